//! Status reporting for ContainerRuntime objects
//!
//! Writes the last operation record through the store. `processing` and
//! `success` propagate write failures; `error` is best-effort because the
//! caller is already returning the original failure.

use std::sync::Arc;

use tracing::warn;

use crx_common::crd::{
    ContainerRuntime, ContainerRuntimeStatus, LastError, LastOperation, LastOperationState,
    LastOperationType, PROGRESS_ERROR, PROGRESS_PROCESSING, PROGRESS_SUCCEEDED,
};
use crx_common::kube_utils::object_name;
use crx_common::Error;

use crate::store::RuntimeStore;

/// Writes last operation records
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn RuntimeStore>,
}

impl StatusReporter {
    /// Create a reporter writing through the given store
    pub fn new(store: Arc<dyn RuntimeStore>) -> Self {
        Self { store }
    }

    /// Record that an operation started
    pub async fn processing(
        &self,
        runtime: &ContainerRuntime,
        operation: LastOperationType,
        description: &str,
    ) -> Result<ContainerRuntime, Error> {
        let mut status = current_status(runtime);
        status.last_operation = Some(LastOperation::new(
            operation,
            LastOperationState::Processing,
            PROGRESS_PROCESSING,
            description,
        ));
        self.store.patch_status(runtime, &status).await
    }

    /// Record that an operation completed
    ///
    /// Clears the last error and records the generation that was handled.
    pub async fn success(
        &self,
        runtime: &ContainerRuntime,
        operation: LastOperationType,
        description: &str,
    ) -> Result<ContainerRuntime, Error> {
        let mut status = current_status(runtime);
        status.last_operation = Some(LastOperation::new(
            operation,
            LastOperationState::Succeeded,
            PROGRESS_SUCCEEDED,
            description,
        ));
        status.last_error = None;
        status.observed_generation = runtime.metadata.generation;
        self.store.patch_status(runtime, &status).await
    }

    /// Record that an operation failed
    ///
    /// A failure to write is logged and otherwise ignored.
    pub async fn error(
        &self,
        runtime: &ContainerRuntime,
        cause: &(dyn std::error::Error + Send + Sync),
        operation: LastOperationType,
        description: &str,
    ) {
        let message = format!("{}: {}", description, cause);
        let mut status = current_status(runtime);
        status.last_operation = Some(LastOperation::new(
            operation,
            LastOperationState::Error,
            PROGRESS_ERROR,
            message.clone(),
        ));
        status.last_error = Some(LastError::new(message));

        if let Err(e) = self.store.patch_status(runtime, &status).await {
            warn!(
                containerruntime = %object_name(runtime),
                operation = %operation,
                error = %e,
                "failed to record error status"
            );
        }
    }
}

fn current_status(runtime: &ContainerRuntime) -> ContainerRuntimeStatus {
    runtime.status.clone().unwrap_or_default()
}
