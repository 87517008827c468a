//! MPI operator: runs MPIJobs as launcher and worker pods

#![deny(missing_docs)]

/// Operator configuration (CLI flags and environment)
pub mod config;
/// Controller runner - builds the MPIJob controller future
pub mod controller_runner;
/// CRD installation on startup
pub mod crds;
