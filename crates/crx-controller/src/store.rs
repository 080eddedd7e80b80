//! Resource store for ContainerRuntime objects
//!
//! Every write returns the object as stored so callers continue with the
//! server's view (including the new `resourceVersion`) instead of a locally
//! mutated copy.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crx_common::crd::{ContainerRuntime, ContainerRuntimeStatus};
use crx_common::kube_utils::{finalizers_patch, map_write_error, remove_annotation_patch};
use crx_common::{Error, FIELD_MANAGER};

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a ContainerRuntime; fails for objects without a namespace
    pub fn for_runtime(runtime: &ContainerRuntime) -> Result<Self, Error> {
        let namespace = runtime
            .namespace()
            .ok_or_else(|| Error::validation("ContainerRuntime must be namespaced"))?;
        Ok(Self::new(namespace, runtime.name_any()))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata mutation applied through the store's update path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataChange {
    /// Replace the finalizer list
    SetFinalizers(Vec<String>),
    /// Delete one annotation
    RemoveAnnotation(String),
}

/// Trait abstracting storage operations for ContainerRuntime objects
///
/// Metadata writes use optimistic concurrency: a write against a stale
/// `resourceVersion` fails with [`Error::Conflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Get an object; `Ok(None)` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<ContainerRuntime>, Error>;

    /// Replace the status of an object
    async fn patch_status(
        &self,
        runtime: &ContainerRuntime,
        status: &ContainerRuntimeStatus,
    ) -> Result<ContainerRuntime, Error>;

    /// Apply a metadata change to an object
    async fn patch_metadata(
        &self,
        runtime: &ContainerRuntime,
        change: MetadataChange,
    ) -> Result<ContainerRuntime, Error>;
}

/// Real store backed by the Kubernetes API
pub struct KubeRuntimeStore {
    client: Client,
}

impl KubeRuntimeStore {
    /// Create a new store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ContainerRuntime> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RuntimeStore for KubeRuntimeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ContainerRuntime>, Error> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn patch_status(
        &self,
        runtime: &ContainerRuntime,
        status: &ContainerRuntimeStatus,
    ) -> Result<ContainerRuntime, Error> {
        let key = ObjectKey::for_runtime(runtime)?;
        let patch = serde_json::json!({ "status": status });
        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_write_error(e, &key.to_string()))
    }

    async fn patch_metadata(
        &self,
        runtime: &ContainerRuntime,
        change: MetadataChange,
    ) -> Result<ContainerRuntime, Error> {
        let key = ObjectKey::for_runtime(runtime)?;
        let resource_version = runtime.metadata.resource_version.as_deref();
        let patch = match &change {
            MetadataChange::SetFinalizers(finalizers) => {
                finalizers_patch(resource_version, finalizers)
            }
            MetadataChange::RemoveAnnotation(annotation) => {
                remove_annotation_patch(resource_version, annotation)
            }
        };
        self.api(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| map_write_error(e, &key.to_string()))
    }
}
