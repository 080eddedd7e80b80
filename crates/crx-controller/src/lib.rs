//! ContainerRuntime lifecycle controller
//!
//! Drives ContainerRuntime objects through their lifecycle (Reconcile,
//! Restore, Delete, Migrate) around a pluggable [`Actuator`], keeping status,
//! finalizers and the operation annotation consistent.

#![deny(missing_docs)]

pub mod actuator;
pub mod backoff;
pub mod cluster;
pub mod controller;
pub mod finalizer;
pub mod operation;
pub mod owner;
pub mod status;
pub mod store;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use actuator::{Actuator, OperationContext};
pub use backoff::{BackoffConfig, FailureBackoff};
pub use cluster::{ClusterDescriptor, ClusterResolver, KubeClusterResolver, ShootInfo};
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerConfig};
pub use operation::{classify, Classification, Phase};
pub use owner::{DisabledWatchdog, OwnerCheck, OwnerWatchdog, OwnershipLease};
pub use store::{KubeRuntimeStore, MetadataChange, ObjectKey, RuntimeStore};
pub use watchdog::{LeaseOwnerChecker, OwnerChecker, WatchdogConfig, WatchdogManager};
