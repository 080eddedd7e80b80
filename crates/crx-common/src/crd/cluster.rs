//! Cluster CRD types
//!
//! A `Cluster` is cluster-scoped and named after the seed namespace of a
//! shoot. It carries raw copies of the shoot, seed and cloud profile so
//! extension controllers can read them without access to the garden.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::LastOperationState;

/// Raw documents describing the shoot a seed namespace belongs to
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "extensions.crx.dev",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Raw cloud profile document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub cloud_profile: Option<serde_json::Value>,

    /// Raw seed document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub seed: Option<serde_json::Value>,

    /// Raw shoot document; absent when the namespace has no live shoot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub shoot: Option<serde_json::Value>,
}

/// The subset of a shoot document the controller needs
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootDocument {
    /// Shoot metadata
    #[serde(default)]
    pub metadata: ShootMetadata,

    /// Shoot status
    #[serde(default)]
    pub status: ShootStatus,
}

/// Shoot metadata fields
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootMetadata {
    /// Shoot name
    #[serde(default)]
    pub name: String,

    /// Project namespace of the shoot in the garden
    #[serde(default)]
    pub namespace: String,

    /// Spec generation
    #[serde(default)]
    pub generation: i64,
}

/// Shoot status fields
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Generation observed by the shoot's last operation
    #[serde(default)]
    pub observed_generation: i64,

    /// Shoot's last operation
    #[serde(default)]
    pub last_operation: Option<ShootLastOperation>,
}

/// The shoot's last operation (only the state is used)
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ShootLastOperation {
    /// Operation state
    pub state: LastOperationState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = Cluster::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.plural, "clusters");
    }

    #[test]
    fn shoot_document_tolerates_unknown_fields() {
        let doc: ShootDocument = serde_json::from_value(serde_json::json!({
            "apiVersion": "core.gardener.cloud/v1beta1",
            "kind": "Shoot",
            "metadata": { "name": "demo", "namespace": "garden-dev", "generation": 4 },
            "spec": { "region": "eu-1" },
            "status": {
                "observedGeneration": 4,
                "lastOperation": { "type": "Reconcile", "state": "Succeeded", "progress": 100 }
            }
        }))
        .unwrap();
        assert_eq!(doc.metadata.name, "demo");
        assert_eq!(doc.metadata.generation, 4);
        assert_eq!(
            doc.status.last_operation.map(|op| op.state),
            Some(LastOperationState::Succeeded)
        );
    }
}
