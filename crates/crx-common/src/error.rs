//! Error types for crx
//!
//! Errors carry the classification the scheduler needs: whether a failure is
//! retryable, whether an actuator asked for a specific requeue delay, and
//! which bookkeeping step failed after an otherwise successful operation.

use std::time::Duration;

use thiserror::Error;

use crate::crd::LastOperationType;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Boxed error used to carry actuator causes of arbitrary type
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for crx operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict on a write
    #[error("conflict updating {resource}: {message}")]
    Conflict {
        /// Object that was being written (`namespace/name`)
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// The Cluster resource for a namespace could not be resolved
    #[error("cluster {namespace}: {message}")]
    Cluster {
        /// Namespace (and Cluster name) that failed to resolve
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// Another seed owns the shoot
    #[error("this seed is not the owner of shoot {shoot}")]
    NotOwner {
        /// Shoot name in `namespace/name` form
        shoot: String,
    },

    /// The ownership check itself could not be performed
    #[error("owner check failed for {key}: {message}")]
    OwnerCheck {
        /// Watchdog registration key
        key: String,
        /// Description of what failed
        message: String,
    },

    /// The actuator failed to perform an operation
    #[error("{operation} failed: {source}")]
    Actuator {
        /// Operation that was running
        operation: LastOperationType,
        /// Classified actuator failure
        #[source]
        source: ActuatorError,
    },

    /// Finalizer or annotation cleanup failed after a successful operation
    #[error("error {action}: {source}")]
    Bookkeeping {
        /// What was being done (e.g. "removing finalizer from the containerruntime")
        action: String,
        /// Underlying store error
        #[source]
        source: Box<Error>,
    },

    /// Invalid object
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "watchdog", "store")
        context: String,
    },
}

impl Error {
    /// Create a conflict error for the given object
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a cluster resolution error
    pub fn cluster(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cluster {
            namespace: namespace.into(),
            message: message.into(),
        }
    }

    /// Create the ownership error for a shoot (`namespace/name`)
    pub fn not_owner(shoot: impl Into<String>) -> Self {
        Self::NotOwner {
            shoot: shoot.into(),
        }
    }

    /// Create an owner check error
    pub fn owner_check(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OwnerCheck {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Wrap an actuator failure for the given operation
    pub fn actuator(operation: LastOperationType, source: ActuatorError) -> Self {
        Self::Actuator { operation, source }
    }

    /// Wrap a failed cleanup write
    pub fn bookkeeping(action: impl Into<String>, source: Error) -> Self {
        Self::Bookkeeping {
            action: action.into(),
            source: Box::new(source),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Ownership loss, validation and serialization errors are not retried by
    /// backoff. Actuator errors follow the actuator's own classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Conflict { .. } => true,
            Error::Cluster { .. } => true,
            Error::NotOwner { .. } => false,
            Error::OwnerCheck { .. } => true,
            Error::Actuator { source, .. } => source.is_retryable(),
            Error::Bookkeeping { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Requeue delay explicitly requested by the actuator, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Actuator { source, .. } => source.delay(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Failure reported by an actuator
///
/// `Failed` is a bare error and gets the scheduler's backoff. `RequeueAfter`
/// wraps a cause together with the delay the actuator wants before the next
/// attempt. `Fatal` errors are not retried until the object changes.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// Retryable failure
    #[error("{0}")]
    Failed(BoxError),

    /// Retryable failure with a requested requeue delay
    #[error("{cause} (requeue after {}s)", .delay.as_secs())]
    RequeueAfter {
        /// Underlying cause
        cause: BoxError,
        /// Delay before the next attempt
        delay: Duration,
    },

    /// Failure that retrying will not fix
    #[error("{0}")]
    Fatal(BoxError),
}

impl ActuatorError {
    /// Create a retryable actuator error
    pub fn failed(cause: impl Into<BoxError>) -> Self {
        Self::Failed(cause.into())
    }

    /// Create a retryable actuator error that asks for a specific requeue delay
    pub fn requeue_after(cause: impl Into<BoxError>, delay: Duration) -> Self {
        Self::RequeueAfter {
            cause: cause.into(),
            delay,
        }
    }

    /// Create a non-retryable actuator error
    pub fn fatal(cause: impl Into<BoxError>) -> Self {
        Self::Fatal(cause.into())
    }

    /// The underlying cause, unwrapped from any requeue hint
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Self::Failed(cause) | Self::Fatal(cause) => cause.as_ref(),
            Self::RequeueAfter { cause, .. } => cause.as_ref(),
        }
    }

    /// Whether the cause is wrapped together with a requeue hint
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Self::RequeueAfter { .. })
    }

    /// Requested requeue delay, if any
    ///
    /// Named `delay` to avoid clashing with the `requeue_after` constructor.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::RequeueAfter { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    /// Whether retrying can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}
