//! Common types for the MPI operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the port used between launcher and workers
pub const DEFAULT_PORT_NAME: &str = "mpi-port";

/// Default value of the interconnect port
pub const DEFAULT_PORT: i32 = 9999;

/// Name of the container running the MPI payload in every unit
pub const DEFAULT_CONTAINER_NAME: &str = "mpi";

/// Framework name recorded on owned resources
pub const FRAMEWORK_NAME: &str = "mpi";

/// Name under which the controller manages resources and reports events
pub const CONTROLLER_NAME: &str = "mpi-operator";

/// Label keys stamped on every owned resource
pub mod labels {
    /// Controller that manages the resource
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Name of the owning MPIJob
    pub const JOB_NAME: &str = "training.kubeflow.org/job-name";
    /// Role of an execution unit (`launcher` / `worker`)
    pub const JOB_ROLE: &str = "training.kubeflow.org/job-role";
    /// Ordinal of a worker unit
    pub const REPLICA_INDEX: &str = "training.kubeflow.org/replica-index";
    /// Framework name
    pub const FRAMEWORK: &str = "training.kubeflow.org/framework";
}
