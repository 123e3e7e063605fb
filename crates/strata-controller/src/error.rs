// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use strata_storage::StorageError;
use thiserror::Error;

/// Controller error type
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// A pod spec references a ConfigMap or Secret that does not exist
    #[error("Referenced {reference} does not exist")]
    #[diagnostic(
        code(strata::controller::reference_unresolved),
        help("Create the referenced object; the template is retried with backoff until it appears")
    )]
    ReferenceUnresolved {
        #[allow(unused)]
        reference: String,
    },

    /// A write lost an optimistic concurrency race
    #[error("Conflicting write to {key}")]
    #[diagnostic(
        code(strata::controller::conflict),
        help("Another writer changed the object first. The reconcile is re-run against fresh state")
    )]
    Conflict {
        #[allow(unused)]
        key: String,
    },

    /// Store failure that may succeed on retry
    #[error("Transient store failure: {message}")]
    #[diagnostic(
        code(strata::controller::transient_store),
        help("The request is retried with exponential backoff")
    )]
    TransientStore {
        #[allow(unused)]
        message: String,
    },

    /// The template cannot be turned into instances as written
    #[error("Invalid template {template}: {reason}")]
    #[diagnostic(
        code(strata::controller::invalid_spec),
        help("Edit the WorkloadTemplate; it is not retried until it changes")
    )]
    InvalidSpec {
        #[allow(unused)]
        template: String,
        #[allow(unused)]
        reason: String,
    },

    /// The reconcile exceeded its deadline
    #[error("Reconcile of {template} timed out after {seconds}s")]
    #[diagnostic(
        code(strata::controller::timeout),
        help("Raise --reconcile-timeout-secs if the store is slow")
    )]
    Timeout {
        #[allow(unused)]
        template: String,
        #[allow(unused)]
        seconds: u64,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(strata::controller::serialization),
        help("A stored object could not be encoded or decoded. Check it for hand edits")
    )]
    Serialization {
        #[allow(unused)]
        message: String,
    },

    /// Internal error
    #[error("Internal controller error: {message}")]
    #[diagnostic(
        code(strata::controller::internal_error),
        help("This is likely a bug in strata-controller. Please report it with the full error details")
    )]
    Internal {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn reference_unresolved(reference: impl ToString) -> Self {
        Self::ReferenceUnresolved {
            reference: reference.to_string(),
        }
    }

    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::TransientStore {
            message: message.into(),
        }
    }

    pub fn invalid_spec(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            template: template.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(template: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            template: template.into(),
            seconds,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the request should be requeued with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReferenceUnresolved { .. }
                | Self::Conflict { .. }
                | Self::TransientStore { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { key, .. } => Self::conflict(key),
            StorageError::SerializationError { message, .. } => Self::serialization(message),
            StorageError::InvalidObject { message } => Self::serialization(message),
            other => Self::transient_store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
