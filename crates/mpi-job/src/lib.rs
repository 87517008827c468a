//! MPIJob controller: turns a declared MPIJob into launcher and worker pods
//!
//! - [`builder`] / [`connectivity`] / [`rbac`]: pure desired-state builders
//! - [`repository`]: object store abstraction, kube-backed and in-memory
//! - [`gate`]: worker readiness and Volcano gang admission
//! - [`engine`]: the per-job state machine
//! - [`status`]: replica counts and the condition history
//! - [`sweep`]: removal of resources whose job is gone
//! - [`controller`]: kube-runtime adapter with per-job failure backoff

pub mod builder;
pub mod connectivity;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gate;
pub mod rbac;
pub mod repository;
pub mod status;
pub mod sweep;

pub use engine::{EngineConfig, JobEngine, JobStage, ReconcileOutcome};
pub use error::JobError;
pub use gate::SchedulingGate;
pub use repository::{JobKey, ObjectKind, ObjectSelector, OwnedObject, Repository};
