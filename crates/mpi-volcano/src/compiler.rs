//! PodGroup compilation from MPIJob specs
//!
//! One PodGroup per job, named after the job. Member pods join the group by
//! carrying [`GROUP_NAME_ANNOTATION`] and running under [`VOLCANO_SCHEDULER`].

use std::collections::BTreeMap;

use mpi_common::crd::MPIJob;
use mpi_common::{labels, CONTROLLER_NAME};

use crate::types::{
    OwnerReference, PodGroup, PodGroupMetadata, PodGroupSpec, POD_GROUP_API_VERSION,
    POD_GROUP_KIND,
};

/// Pod annotation that assigns a pod to a PodGroup
pub const GROUP_NAME_ANNOTATION: &str = "scheduling.k8s.io/group-name";

/// Scheduler name pods must use to be gang scheduled
pub const VOLCANO_SCHEDULER: &str = "volcano";

/// Name of the PodGroup owned by `job_name`
pub fn pod_group_name(job_name: &str) -> String {
    job_name.to_string()
}

/// Compile an MPIJob into a Volcano PodGroup.
///
/// `minMember` is `schedulingPolicy.minAvailable` when set, otherwise the
/// worker count plus one when the launcher takes part in the gang.
pub fn compile_pod_group(job: &MPIJob, include_launcher: bool) -> PodGroup {
    let name = job.metadata.name.as_deref().unwrap_or_default();
    let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
    let uid = job.metadata.uid.as_deref().unwrap_or_default();

    let scheduling = job.spec.run_policy.scheduling_policy.as_ref();
    let min_member = scheduling.and_then(|p| p.min_available).unwrap_or_else(|| {
        job.spec.worker_replicas() as i32 + i32::from(include_launcher)
    });

    PodGroup {
        api_version: POD_GROUP_API_VERSION.to_string(),
        kind: POD_GROUP_KIND.to_string(),
        metadata: PodGroupMetadata {
            name: pod_group_name(name),
            namespace: namespace.to_string(),
            labels: BTreeMap::from([
                (labels::MANAGED_BY.to_string(), CONTROLLER_NAME.to_string()),
                (labels::JOB_NAME.to_string(), name.to_string()),
            ]),
            owner_references: vec![OwnerReference {
                api_version: "kubeflow.org/v1".to_string(),
                kind: "MPIJob".to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }],
        },
        spec: PodGroupSpec {
            min_member,
            queue: scheduling.and_then(|p| p.queue.clone()),
            priority_class_name: scheduling.and_then(|p| p.priority_class.clone()),
        },
        status: None,
    }
}
