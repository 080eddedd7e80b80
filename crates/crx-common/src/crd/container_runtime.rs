//! ContainerRuntime CRD types
//!
//! A `ContainerRuntime` describes the container runtime a worker pool of a
//! shoot cluster should run (e.g. gVisor). It lives in the shoot's namespace
//! on the seed.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{LastError, LastOperation};

/// Desired container runtime configuration for a worker pool
///
/// Example:
/// ```yaml
/// apiVersion: extensions.crx.dev/v1alpha1
/// kind: ContainerRuntime
/// metadata:
///   name: worker-a-gvisor
///   namespace: shoot--dev--demo
/// spec:
///   type: gvisor
///   binaryPath: /var/bin/containerruntimes
///   workerPool:
///     name: worker-a
///     selector:
///       worker.gardener.cloud/pool: worker-a
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.crx.dev",
    version = "v1alpha1",
    kind = "ContainerRuntime",
    plural = "containerruntimes",
    shortname = "cr",
    namespaced,
    status = "ContainerRuntimeStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Operation","type":"string","jsonPath":".status.lastOperation.type"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeSpec {
    /// Runtime technology handled by an extension (e.g. `gvisor`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Runtime-specific configuration, opaque to the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub provider_config: Option<serde_json::Value>,

    /// Path on the node where runtime binaries are installed
    pub binary_path: String,

    /// Worker pool the runtime applies to
    pub worker_pool: WorkerPoolSelector,
}

/// Worker pool reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPoolSelector {
    /// Worker pool name
    pub name: String,

    /// Node labels selecting the pool's nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

/// Observed state of a ContainerRuntime
///
/// Fields are serialized even when empty so a merge patch of the whole
/// status clears them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuntimeStatus {
    /// Most recent lifecycle operation
    #[serde(default)]
    pub last_operation: Option<LastOperation>,

    /// Most recent error, cleared on success
    #[serde(default)]
    pub last_error: Option<LastError>,

    /// Generation observed by the last successful operation
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl ContainerRuntime {
    /// Last operation recorded in the status, if any
    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.status.as_ref().and_then(|s| s.last_operation.as_ref())
    }

    /// Whether the object carries the given finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == finalizer))
    }

    /// Value of an annotation, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn sample() -> ContainerRuntime {
        let mut runtime = ContainerRuntime::new(
            "worker-a-gvisor",
            ContainerRuntimeSpec {
                type_: "gvisor".to_string(),
                provider_config: None,
                binary_path: "/var/bin/containerruntimes".to_string(),
                worker_pool: WorkerPoolSelector {
                    name: "worker-a".to_string(),
                    selector: BTreeMap::new(),
                },
            },
        );
        runtime.metadata.namespace = Some("shoot--dev--demo".to_string());
        runtime
    }

    #[test]
    fn crd_is_namespaced_with_status() {
        let crd = ContainerRuntime::crd();
        assert_eq!(crd.spec.group, "extensions.crx.dev");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "ContainerRuntime");
    }

    #[test]
    fn spec_round_trips_type_field() {
        let json = serde_json::to_value(&sample().spec).unwrap();
        assert_eq!(json["type"], "gvisor");
        assert_eq!(json["workerPool"]["name"], "worker-a");
        assert!(json.get("providerConfig").is_none());
    }

    #[test]
    fn metadata_accessors() {
        let mut runtime = sample();
        assert!(!runtime.has_finalizer("a"));
        assert_eq!(runtime.annotation("x"), None);
        assert!(!runtime.is_deleting());
        assert!(runtime.last_operation().is_none());

        runtime.metadata.finalizers = Some(vec!["a".to_string()]);
        runtime.metadata.annotations =
            Some(BTreeMap::from([("x".to_string(), "y".to_string())]));
        assert!(runtime.has_finalizer("a"));
        assert_eq!(runtime.annotation("x"), Some("y"));
    }

    #[test]
    fn empty_status_serializes_nulls_for_merge_patch() {
        let json = serde_json::to_value(ContainerRuntimeStatus::default()).unwrap();
        assert!(json["lastError"].is_null());
        assert!(json.as_object().unwrap().contains_key("lastError"));
    }
}
