//! Actuator seam: the component that realizes a ContainerRuntime
//!
//! The controller decides *which* operation runs and keeps status and
//! finalizers consistent; the actuator does the actual work for the runtime
//! technology it serves.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crx_common::crd::ContainerRuntime;
use crx_common::ActuatorError;

use crate::cluster::ClusterDescriptor;

/// Per-operation context handed to the actuator
///
/// The token is cancelled when the process shuts down or when this seed loses
/// ownership of the shoot mid-operation. Actuators should stop at the next
/// safe point once it fires.
#[derive(Clone, Debug)]
pub struct OperationContext {
    token: CancellationToken,
}

impl OperationContext {
    /// Create a context around a cancellation token
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// The operation's cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the operation is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Whether the operation has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Performs the lifecycle operations for a runtime technology
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Create or update the runtime
    async fn reconcile(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError>;

    /// Re-create the runtime's state after a control plane migration
    async fn restore(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError>;

    /// Tear the runtime down
    async fn delete(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError>;

    /// Release the runtime's state on this seed without deleting the object
    async fn migrate(
        &self,
        ctx: &OperationContext,
        runtime: &ContainerRuntime,
        cluster: &ClusterDescriptor,
    ) -> Result<(), ActuatorError>;
}
