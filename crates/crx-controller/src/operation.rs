//! Operation classification
//!
//! Decides which lifecycle phase a pass runs from the object's trigger
//! annotation, deletion marker and last recorded operation. Everything here
//! is pure; the controller performs the writes.

use std::collections::BTreeMap;

use crx_common::crd::{ContainerRuntime, LastOperation, LastOperationState, LastOperationType};
use crx_common::{OPERATION_ANNOTATION, OPERATION_MIGRATE, OPERATION_RECONCILE, OPERATION_RESTORE};

/// Lifecycle phase handled by one pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Create or update
    Reconcile,
    /// Re-create state after a control plane migration
    Restore,
    /// Tear down
    Delete,
    /// Hand the object over to another seed
    Migrate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconcile => write!(f, "Reconcile"),
            Self::Restore => write!(f, "Restore"),
            Self::Delete => write!(f, "Delete"),
            Self::Migrate => write!(f, "Migrate"),
        }
    }
}

/// Result of classifying an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    /// Phase to dispatch
    pub phase: Phase,
    /// Operation type derived from annotations and the last operation
    pub operation_type: LastOperationType,
}

/// Derive the operation type of the next pass
///
/// An explicit trigger wins. Otherwise an unfinished Create, Migrate or
/// Restore continues, and anything else is a regular Reconcile.
pub fn compute_operation_type(
    annotations: Option<&BTreeMap<String, String>>,
    last_operation: Option<&LastOperation>,
) -> LastOperationType {
    match annotations
        .and_then(|a| a.get(OPERATION_ANNOTATION))
        .map(String::as_str)
    {
        Some(OPERATION_MIGRATE) => return LastOperationType::Migrate,
        Some(OPERATION_RESTORE) => return LastOperationType::Restore,
        _ => {}
    }

    let Some(last) = last_operation else {
        return LastOperationType::Create;
    };

    match last.type_ {
        LastOperationType::Create
        | LastOperationType::Migrate
        | LastOperationType::Restore
            if last.state != LastOperationState::Succeeded =>
        {
            last.type_
        }
        _ => LastOperationType::Reconcile,
    }
}

/// Classify an object into exactly one phase
///
/// Priority is Migrate, then Delete, then Restore, then Reconcile.
pub fn classify(runtime: &ContainerRuntime) -> Classification {
    let operation_type = compute_operation_type(
        runtime.metadata.annotations.as_ref(),
        runtime.last_operation(),
    );

    let phase = if operation_type == LastOperationType::Migrate {
        Phase::Migrate
    } else if runtime.is_deleting() {
        Phase::Delete
    } else if operation_type == LastOperationType::Restore {
        Phase::Restore
    } else {
        Phase::Reconcile
    };

    Classification {
        phase,
        operation_type,
    }
}

/// Whether the object has been migrated away from this seed
pub fn is_migrated(runtime: &ContainerRuntime) -> bool {
    runtime
        .last_operation()
        .is_some_and(|op| op.succeeded(LastOperationType::Migrate))
}

/// Whether the pass should do nothing
///
/// A migrated object stays untouched until a new Migrate or Restore trigger
/// asks for it again.
pub fn should_skip(operation_type: LastOperationType, runtime: &ContainerRuntime) -> bool {
    is_migrated(runtime)
        && !matches!(
            operation_type,
            LastOperationType::Migrate | LastOperationType::Restore
        )
}

/// Whether the object carries the forced-reconcile trigger
pub fn has_reconcile_trigger(runtime: &ContainerRuntime) -> bool {
    runtime.annotation(OPERATION_ANNOTATION) == Some(OPERATION_RECONCILE)
}
