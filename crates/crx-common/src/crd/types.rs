//! Shared status types: last operation and last error records

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of lifecycle operation recorded in a last operation
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum LastOperationType {
    /// First reconcile of a new object
    Create,
    /// Regular reconcile
    Reconcile,
    /// Restore after a control plane migration
    Restore,
    /// Deletion
    Delete,
    /// Migration away from this seed
    Migrate,
}

impl std::fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Reconcile => write!(f, "Reconcile"),
            Self::Restore => write!(f, "Restore"),
            Self::Delete => write!(f, "Delete"),
            Self::Migrate => write!(f, "Migrate"),
        }
    }
}

/// State of a last operation
///
/// The ContainerRuntime controller only writes `Processing`, `Succeeded` and
/// `Error`. The remaining states appear on shoot records read from a Cluster.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum LastOperationState {
    /// Operation is in flight (or crashed mid-flight)
    Processing,
    /// Operation completed successfully
    Succeeded,
    /// Operation failed and will be retried
    Error,
    /// Operation failed permanently
    Failed,
    /// Operation is waiting to start
    Pending,
    /// Operation was aborted
    Aborted,
}

impl std::fmt::Display for LastOperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "Processing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Error => write!(f, "Error"),
            Self::Failed => write!(f, "Failed"),
            Self::Pending => write!(f, "Pending"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Progress reported with a `Processing` record
pub const PROGRESS_PROCESSING: i32 = 1;
/// Progress reported with an `Error` record
pub const PROGRESS_ERROR: i32 = 50;
/// Progress reported with a `Succeeded` record
pub const PROGRESS_SUCCEEDED: i32 = 100;

/// Record of the most recent lifecycle operation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Operation kind
    #[serde(rename = "type")]
    pub type_: LastOperationType,

    /// Operation state
    pub state: LastOperationState,

    /// Human-readable description
    pub description: String,

    /// Progress in percent
    #[serde(default)]
    pub progress: i32,

    /// Time of the last update to this record
    pub last_update_time: DateTime<Utc>,
}

impl LastOperation {
    /// Create a record stamped with the current time
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        progress: i32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            state,
            description: description.into(),
            progress,
            last_update_time: Utc::now(),
        }
    }

    /// Whether the record is `type` and `Succeeded`
    pub fn succeeded(&self, type_: LastOperationType) -> bool {
        self.type_ == type_ && self.state == LastOperationState::Succeeded
    }
}

/// Last error observed while processing an object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// Human-readable description
    pub description: String,

    /// Time the error was observed
    pub last_update_time: DateTime<Utc>,
}

impl LastError {
    /// Create a record stamped with the current time
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            last_update_time: Utc::now(),
        }
    }
}
