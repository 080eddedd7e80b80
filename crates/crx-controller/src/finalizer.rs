//! Finalizer management
//!
//! Adds and removes the controller's finalizer token through the store.
//! Writes are skipped when the object is already in the requested state.

use std::sync::Arc;

use crx_common::crd::ContainerRuntime;
use crx_common::Error;

use crate::store::{MetadataChange, RuntimeStore};

/// Manages one finalizer token on ContainerRuntime objects
#[derive(Clone)]
pub struct FinalizerManager {
    store: Arc<dyn RuntimeStore>,
    name: String,
}

impl FinalizerManager {
    /// Create a manager for the given finalizer token
    pub fn new(store: Arc<dyn RuntimeStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Whether the object carries the managed token
    pub fn has(&self, runtime: &ContainerRuntime) -> bool {
        runtime.has_finalizer(&self.name)
    }

    /// Add the token if missing; returns the object as stored
    pub async fn ensure(&self, runtime: &ContainerRuntime) -> Result<ContainerRuntime, Error> {
        if self.has(runtime) {
            return Ok(runtime.clone());
        }
        let mut finalizers = runtime.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(self.name.clone());
        self.store
            .patch_metadata(runtime, MetadataChange::SetFinalizers(finalizers))
            .await
    }

    /// Remove the token if present, leaving other tokens untouched
    pub async fn remove(&self, runtime: &ContainerRuntime) -> Result<ContainerRuntime, Error> {
        if !self.has(runtime) {
            return Ok(runtime.clone());
        }
        let finalizers = runtime
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| **f != self.name)
            .cloned()
            .collect();
        self.store
            .patch_metadata(runtime, MetadataChange::SetFinalizers(finalizers))
            .await
    }

    /// Remove every finalizer token, including ones owned by others
    pub async fn remove_all(&self, runtime: &ContainerRuntime) -> Result<ContainerRuntime, Error> {
        if runtime.metadata.finalizers.as_ref().map_or(true, Vec::is_empty) {
            return Ok(runtime.clone());
        }
        self.store
            .patch_metadata(runtime, MetadataChange::SetFinalizers(Vec::new()))
            .await
    }
}
