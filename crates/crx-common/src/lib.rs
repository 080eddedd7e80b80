//! Common types for crx: CRDs, errors, and utilities
//!
//! Shared by the ContainerRuntime controller and the operator binary.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::{ActuatorError, BoxError, Error};

/// Finalizer token owned by the ContainerRuntime controller
pub const CONTAINER_RUNTIME_FINALIZER: &str = "extensions.crx.dev/containerruntime";

/// Annotation carrying an operation trigger (`reconcile`, `restore`, `migrate`)
pub const OPERATION_ANNOTATION: &str = "crx.dev/operation";

/// Trigger value asking for a forced reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Trigger value asking to restore state after a control plane migration
pub const OPERATION_RESTORE: &str = "restore";

/// Trigger value asking to migrate ownership away from this seed
pub const OPERATION_MIGRATE: &str = "migrate";

/// Field manager used for all writes issued by crx
pub const FIELD_MANAGER: &str = "crx-controller";
