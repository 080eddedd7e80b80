//! Custom Resource Definitions for crx
//!
//! This module contains the ContainerRuntime and Cluster CRDs and the status
//! records they share.

mod cluster;
mod container_runtime;
mod types;

pub use cluster::{
    Cluster, ClusterSpec, ShootDocument, ShootLastOperation, ShootMetadata, ShootStatus,
};
pub use container_runtime::{
    ContainerRuntime, ContainerRuntimeSpec, ContainerRuntimeStatus, WorkerPoolSelector,
};
pub use types::{
    LastError, LastOperation, LastOperationState, LastOperationType, PROGRESS_ERROR,
    PROGRESS_PROCESSING, PROGRESS_SUCCEEDED,
};

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};

/// Schema for free-form JSON fields
///
/// Structural CRD schemas need `x-kubernetes-preserve-unknown-fields` for
/// fields whose content the API server must not prune.
fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
