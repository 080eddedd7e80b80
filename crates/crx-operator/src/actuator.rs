//! ConfigMap-backed actuator
//!
//! Realizes a ContainerRuntime as a ConfigMap `containerruntime-<name>` in the
//! object's namespace that node-side installers consume. Reconcile and Restore
//! apply it; Delete and Migrate remove it (the next seed re-creates it on
//! Restore).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info};

use crx_common::crd::ContainerRuntime;
use crx_common::kube_utils::is_not_found;
use crx_common::{ActuatorError, FIELD_MANAGER};
use crx_controller::{Actuator, ClusterDescriptor, OperationContext};

/// Prefix of the ConfigMap carrying a runtime's configuration
pub const CONFIGMAP_PREFIX: &str = "containerruntime-";

/// Label naming the ContainerRuntime a ConfigMap belongs to
pub const RUNTIME_LABEL: &str = "extensions.crx.dev/containerruntime";

/// Delay requested when the API server throttles or reports a conflict
const THROTTLED_RETRY: Duration = Duration::from_secs(10);

/// Name of the ConfigMap for a runtime
pub fn configmap_name(runtime: &ContainerRuntime) -> String {
    format!("{}{}", CONFIGMAP_PREFIX, runtime.name_any())
}

/// Build the desired ConfigMap for a runtime
pub fn build_configmap(
    runtime: &ContainerRuntime,
    cluster: &ClusterDescriptor,
) -> Result<ConfigMap, ActuatorError> {
    let namespace = runtime
        .namespace()
        .ok_or_else(|| ActuatorError::fatal("ContainerRuntime has no namespace"))?;
    let spec = &runtime.spec;

    let mut data = BTreeMap::from([
        ("type".to_string(), spec.type_.clone()),
        ("binaryPath".to_string(), spec.binary_path.clone()),
        ("workerPool".to_string(), spec.worker_pool.name.clone()),
        (
            "nodeSelector".to_string(),
            serde_json::to_string(&spec.worker_pool.selector).map_err(ActuatorError::fatal)?,
        ),
        ("cluster".to_string(), cluster.name.clone()),
    ]);
    if let Some(config) = &spec.provider_config {
        data.insert(
            "providerConfig".to_string(),
            serde_json::to_string(config).map_err(ActuatorError::fatal)?,
        );
    }
    if let Some(shoot) = &cluster.shoot {
        data.insert("shoot".to_string(), shoot.object_name());
    }

    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (RUNTIME_LABEL.to_string(), runtime.name_any()),
    ]);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name(runtime)),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: runtime.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Classify an API error from the actuator's own writes
fn classify(err: kube::Error) -> ActuatorError {
    let code = match &err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    };
    match code {
        Some(409 | 429) => ActuatorError::requeue_after(err, THROTTLED_RETRY),
        Some(code) if (400..500).contains(&code) => ActuatorError::fatal(err),
        _ => ActuatorError::failed(err),
    }
}

/// Actuator writing one ConfigMap per ContainerRuntime
pub struct ConfigMapActuator {
    client: Client,
}

impl ConfigMapActuator {
    /// Create an actuator using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, runtime: &ContainerRuntime) -> Result<Api<ConfigMap>, ActuatorError> {
        let namespace = runtime
            .namespace()
            .ok_or_else(|| ActuatorError::fatal("ContainerRuntime has no namespace"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }

    async fn apply(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError> {
        let configmap = build_configmap(runtime, cluster)?;
        let name = configmap_name(runtime);
        let api = self.api(runtime)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let patch = Patch::Apply(&configmap);

        tokio::select! {
            _ = ctx.cancelled() => Err(ActuatorError::failed("operation cancelled")),
            result = api.patch(&name, &params, &patch) => {
                result.map_err(classify)?;
                info!(configmap = %name, "applied runtime configuration");
                Ok(())
            }
        }
    }

    async fn remove(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
    ) -> Result<(), ActuatorError> {
        let name = configmap_name(runtime);
        let api = self.api(runtime)?;
        let delete_params = DeleteParams::default();

        tokio::select! {
            _ = ctx.cancelled() => Err(ActuatorError::failed("operation cancelled")),
            result = api.delete(&name, &delete_params) => match result {
                Ok(_) => {
                    info!(configmap = %name, "removed runtime configuration");
                    Ok(())
                }
                Err(e) if is_not_found(&e) => {
                    debug!(configmap = %name, "runtime configuration already gone");
                    Ok(())
                }
                Err(e) => Err(classify(e)),
            }
        }
    }
}

#[async_trait]
impl Actuator for ConfigMapActuator {
    async fn reconcile(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError> {
        self.apply(ctx, runtime, cluster).await
    }

    async fn restore(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError> {
        self.apply(ctx, runtime, cluster).await
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        _cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError> {
        self.remove(ctx, runtime).await
    }

    async fn migrate(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        _cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError> {
        self.remove(ctx, runtime).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crx_common::crd::{ContainerRuntimeSpec, WorkerPoolSelector};
    use crx_controller::ShootInfo;
    use kube::core::ErrorResponse;
    use rstest::rstest;

    fn runtime() -> ContainerRuntime {
        let mut runtime = ContainerRuntime::new(
            "worker-a-gvisor",
            ContainerRuntimeSpec {
                type_: "gvisor".to_string(),
                provider_config: Some(serde_json::json!({ "configFlags": { "net-raw": "true" } })),
                binary_path: "/var/bin/containerruntimes".to_string(),
                worker_pool: WorkerPoolSelector {
                    name: "worker-a".to_string(),
                    selector: BTreeMap::from([(
                        "worker.gardener.cloud/pool".to_string(),
                        "worker-a".to_string(),
                    )]),
                },
            },
        );
        runtime.metadata.namespace = Some("shoot--dev--demo".to_string());
        runtime
    }

    fn cluster() -> ClusterDescriptor {
        ClusterDescriptor {
            name: "shoot--dev--demo".to_string(),
            shoot: Some(ShootInfo {
                name: "demo".to_string(),
                namespace: "garden-dev".to_string(),
                generation: 1,
                observed_generation: 1,
                last_operation_state: None,
            }),
        }
    }

    #[test]
    fn configmap_carries_runtime_configuration() {
        let cm = build_configmap(&runtime(), &cluster()).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("containerruntime-worker-a-gvisor"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("shoot--dev--demo"));

        let data = cm.data.unwrap();
        assert_eq!(data["type"], "gvisor");
        assert_eq!(data["workerPool"], "worker-a");
        assert_eq!(data["shoot"], "garden-dev/demo");
        assert_eq!(
            data["nodeSelector"],
            r#"{"worker.gardener.cloud/pool":"worker-a"}"#
        );
        assert!(data["providerConfig"].contains("net-raw"));
        assert_eq!(
            cm.metadata.labels.unwrap()[RUNTIME_LABEL],
            "worker-a-gvisor"
        );
    }

    #[test]
    fn owner_reference_requires_uid() {
        let mut rt = runtime();
        assert!(build_configmap(&rt, &cluster())
            .unwrap()
            .metadata
            .owner_references
            .is_none());

        rt.metadata.uid = Some("0b1e-uid".to_string());
        let refs = build_configmap(&rt, &cluster())
            .unwrap()
            .metadata
            .owner_references
            .unwrap();
        assert_eq!(refs[0].kind, "ContainerRuntime");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn missing_namespace_is_fatal() {
        let mut rt = runtime();
        rt.metadata.namespace = None;
        let err = build_configmap(&rt, &cluster()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[rstest]
    #[case::conflict(409, true, Some(THROTTLED_RETRY))]
    #[case::throttled(429, true, Some(THROTTLED_RETRY))]
    #[case::invalid(422, false, None)]
    #[case::server_error(500, true, None)]
    fn api_errors_are_classified(
        #[case] code: u16,
        #[case] retryable: bool,
        #[case] delay: Option<Duration>,
    ) {
        let err = classify(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }));
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.delay(), delay);
    }
}
