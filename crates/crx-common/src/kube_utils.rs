//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, merge-patch documents with optimistic locking, and
//! error mapping for writes.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};
use serde_json::{json, Value};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// `namespace/name` of an object, or just `name` for cluster-scoped objects
pub fn object_name<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Merge patch replacing the finalizer list
///
/// Carries `resourceVersion` so the API server rejects the write with a
/// conflict if the object changed since it was read.
pub fn finalizers_patch(resource_version: Option<&str>, finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "finalizers": finalizers,
        }
    })
}

/// Merge patch deleting a single annotation, with the same optimistic lock
pub fn remove_annotation_patch(resource_version: Option<&str>, key: &str) -> Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(key.to_string(), Value::Null);
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "annotations": annotations,
        }
    })
}

/// Map a write error, turning 409 responses into [`Error::Conflict`]
pub fn map_write_error(err: kube::Error, resource: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(resource, ae.message),
        e => e.into(),
    }
}

/// Whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
