//! Error types for the MPI operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors carry the resource kind and name they relate to so the
//! reconciliation engine can decide between absorbing, requeueing and
//! surfacing them.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for MPI operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that could not be classified further
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for MPIJob specs
    #[error("validation error for {job}: {message}")]
    Validation {
        /// Name of the job with invalid configuration
        job: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.mpiReplicaSpecs.Launcher.replicas")
        field: Option<String>,
    },

    /// Optimistic-concurrency conflict on write
    #[error("conflict writing {kind} {name}")]
    Conflict {
        /// Resource kind being written
        kind: String,
        /// Resource name
        name: String,
    },

    /// Create of an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind being created
        kind: String,
        /// Resource name
        name: String,
    },

    /// The store refused to create an object (quota, invalid template)
    #[error("{kind} {name} rejected: {message}")]
    Rejected {
        /// Resource kind being created
        kind: String,
        /// Resource name
        name: String,
        /// Reason reported by the store
        message: String,
    },

    /// Throttling or temporary unavailability of the store
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "sweep")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            job: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with job context and field path
    pub fn validation_for_field(
        job: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            job: job.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a rejected-create error
    pub fn rejected(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable {
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error raised while writing `kind`/`name`.
    ///
    /// 409 becomes `Conflict` (or `AlreadyExists` when `creating`), 429 and
    /// 5xx become `Unavailable`, 403/422 during create become `Rejected`.
    pub fn from_kube(kind: &str, name: &str, creating: bool, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 409 && creating => Self::already_exists(kind, name),
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name),
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => {
                Self::unavailable(ae.message.clone())
            }
            kube::Error::Api(ae) if creating && (ae.code == 403 || ae.code == 422) => {
                Self::rejected(kind, name, ae.message.clone())
            }
            _ => Self::Kube { source: err },
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec change. Rejected
    /// creates are requeued with backoff but are not transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::AlreadyExists { .. } => true,
            Error::Rejected { .. } => false,
            Error::Unavailable { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the job name if this error is associated with a specific job
    pub fn job(&self) -> Option<&str> {
        match self {
            Error::Validation { job, .. } => Some(job),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            kind: None,
        }
    }
}
