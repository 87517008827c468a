//! Custom Resource Definitions for the MPI operator

mod mpi_job;
mod types;

pub use mpi_job::{
    is_retryable_exit_code, CleanPodPolicy, ExecutionTemplate, JobPhase, MPIJob, MPIJobSpec,
    MPIJobStatus, ReplicaSpec, ReplicaStatus, ReplicaType, ResourceRequirements, RestartPolicy,
    RunPolicy, SchedulingPolicy, DEFAULT_BACKOFF_LIMIT, DEFAULT_SSH_AUTH_MOUNT_PATH,
};
pub use types::{Condition, ConditionStatus};
