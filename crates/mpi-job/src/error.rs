//! Job-specific error types

use mpi_common::Error;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Common(#[from] Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("missing namespace on MPIJob")]
    MissingNamespace,

    #[error("ssh key generation failed: {0}")]
    KeyGeneration(String),

    #[error("secret {0} holds no ssh public key")]
    MalformedSecret(String),
}

impl JobError {
    /// Conflicts, throttling and store outages: retry with backoff, never fail the job
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Common(e) => e.is_retryable(),
            JobError::Serialization(_) | JobError::MissingNamespace => false,
            JobError::KeyGeneration(_) => true,
            JobError::MalformedSecret(_) => false,
        }
    }

    /// The store refused to create an owned resource (quota, invalid template)
    pub fn is_rejected(&self) -> bool {
        matches!(self, JobError::Common(Error::Rejected { .. }))
    }
}
