//! Cluster descriptor resolution
//!
//! Every pass reads the `Cluster` named after the object's namespace and
//! reduces it to the few shoot facts the state machine needs. Nothing is
//! cached between passes.

use async_trait::async_trait;
use kube::api::Api;
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crx_common::crd::{Cluster, LastOperationState, ShootDocument};
use crx_common::Error;

/// Shoot facts extracted from a Cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShootInfo {
    /// Shoot name
    pub name: String,
    /// Project namespace of the shoot
    pub namespace: String,
    /// Spec generation
    pub generation: i64,
    /// Generation the shoot's last operation observed
    pub observed_generation: i64,
    /// State of the shoot's last operation
    pub last_operation_state: Option<LastOperationState>,
}

impl ShootInfo {
    /// `namespace/name` of the shoot
    pub fn object_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Context of the shoot a ContainerRuntime belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    /// Cluster name (the shoot's seed namespace)
    pub name: String,
    /// Shoot, if the Cluster carries one
    pub shoot: Option<ShootInfo>,
}

impl ClusterDescriptor {
    /// Build a descriptor from a Cluster resource
    pub fn from_cluster(cluster: &Cluster) -> Result<Self, Error> {
        let shoot = match &cluster.spec.shoot {
            Some(raw) => {
                let doc: ShootDocument = serde_json::from_value(raw.clone()).map_err(|e| {
                    Error::cluster(
                        cluster.name_any(),
                        format!("cannot decode shoot: {}", e),
                    )
                })?;
                Some(ShootInfo {
                    name: doc.metadata.name,
                    namespace: doc.metadata.namespace,
                    generation: doc.metadata.generation,
                    observed_generation: doc.status.observed_generation,
                    last_operation_state: doc.status.last_operation.map(|op| op.state),
                })
            }
            None => None,
        };
        Ok(Self {
            name: cluster.name_any(),
            shoot,
        })
    }

    /// Whether the shoot's latest operation failed for its current generation
    ///
    /// A failed shoot is left alone until someone changes its spec; nothing
    /// the extension does can help.
    pub fn is_failed(&self) -> bool {
        self.shoot.as_ref().is_some_and(|shoot| {
            shoot.last_operation_state == Some(LastOperationState::Failed)
                && shoot.generation == shoot.observed_generation
        })
    }
}

/// Resolves the descriptor of the Cluster for a namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// Resolve the Cluster named `namespace`
    async fn resolve(&self, namespace: &str) -> Result<ClusterDescriptor, Error>;
}

/// Resolver reading `Cluster` resources from the API server
pub struct KubeClusterResolver {
    client: Client,
}

impl KubeClusterResolver {
    /// Create a resolver using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterResolver for KubeClusterResolver {
    async fn resolve(&self, namespace: &str) -> Result<ClusterDescriptor, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let cluster = api
            .get_opt(namespace)
            .await?
            .ok_or_else(|| Error::cluster(namespace, "cluster not found"))?;
        ClusterDescriptor::from_cluster(&cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crx_common::crd::ClusterSpec;
    use rstest::rstest;
    use serde_json::json;

    fn cluster_with_shoot(shoot: Option<serde_json::Value>) -> Cluster {
        Cluster::new(
            "shoot--dev--demo",
            ClusterSpec {
                shoot,
                ..Default::default()
            },
        )
    }

    fn shoot(state: &str, generation: i64, observed: i64) -> serde_json::Value {
        json!({
            "metadata": { "name": "demo", "namespace": "garden-dev", "generation": generation },
            "status": {
                "observedGeneration": observed,
                "lastOperation": { "type": "Reconcile", "state": state }
            }
        })
    }

    #[test]
    fn descriptor_carries_shoot_identity() {
        let desc =
            ClusterDescriptor::from_cluster(&cluster_with_shoot(Some(shoot("Succeeded", 2, 2))))
                .unwrap();
        assert_eq!(desc.name, "shoot--dev--demo");
        let shoot = desc.shoot.unwrap();
        assert_eq!(shoot.object_name(), "garden-dev/demo");
        assert_eq!(shoot.last_operation_state, Some(LastOperationState::Succeeded));
    }

    #[test]
    fn cluster_without_shoot_has_no_shoot() {
        let desc = ClusterDescriptor::from_cluster(&cluster_with_shoot(None)).unwrap();
        assert!(desc.shoot.is_none());
        assert!(!desc.is_failed());
    }

    #[test]
    fn undecodable_shoot_is_a_cluster_error() {
        let err = ClusterDescriptor::from_cluster(&cluster_with_shoot(Some(json!({
            "metadata": { "generation": "not-a-number" }
        }))))
        .unwrap_err();
        assert!(matches!(err, Error::Cluster { .. }));
    }

    #[rstest]
    #[case::failed_current_generation("Failed", 3, 3, true)]
    #[case::failed_old_generation("Failed", 4, 3, false)]
    #[case::error_is_not_failed("Error", 3, 3, false)]
    #[case::succeeded("Succeeded", 3, 3, false)]
    fn failed_shoot_detection(
        #[case] state: &str,
        #[case] generation: i64,
        #[case] observed: i64,
        #[case] failed: bool,
    ) {
        let desc = ClusterDescriptor::from_cluster(&cluster_with_shoot(Some(shoot(
            state, generation, observed,
        ))))
        .unwrap();
        assert_eq!(desc.is_failed(), failed);
    }
}
