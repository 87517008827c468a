//! Volcano PodGroup compiler for MPIJob gang scheduling
//!
//! Compiles `MPIJob` specs into Volcano `PodGroup` resources so that all
//! units of a job are admitted by the scheduler atomically.
//! Pure compilation crate with no controller logic.

mod compiler;
mod types;

pub use compiler::{compile_pod_group, pod_group_name, GROUP_NAME_ANNOTATION, VOLCANO_SCHEDULER};
pub use types::{
    OwnerReference, PodGroup, PodGroupMetadata, PodGroupPhase, PodGroupSpec, PodGroupStatus,
    POD_GROUP_API_VERSION, POD_GROUP_KIND,
};
