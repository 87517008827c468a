//! Removal of owned resources whose job is gone
//!
//! Kubernetes garbage-collects owned objects through their ownerReferences,
//! but the engine does not rely on it: a missing job has its labeled
//! objects removed on the next reconcile, and a periodic sweep catches
//! objects whose reconcile never ran (operator down while the job was
//! deleted, or the job recreated under the same name with a new uid).

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use mpi_common::labels;
use mpi_common::Result;

use crate::repository::{JobKey, ObjectKind, ObjectSelector, OwnedObject, Repository};

/// Kinds in deletion order: execution units first, identity last
fn deletion_order(include_pod_groups: bool) -> impl Iterator<Item = ObjectKind> {
    ObjectKind::ALL
        .into_iter()
        .rev()
        .filter(move |k| include_pod_groups || *k != ObjectKind::PodGroup)
}

/// Delete every object labeled as owned by `key`. Returns how many were found.
pub async fn remove_job_resources(
    repo: &dyn Repository,
    key: &JobKey,
    include_pod_groups: bool,
) -> Result<usize> {
    let selector = ObjectSelector::for_job(key);
    let mut removed = 0;
    for kind in deletion_order(include_pod_groups) {
        for object in repo.list(kind, &selector).await? {
            repo.delete(kind, object.namespace(), object.name()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(job = %key, removed, "removed resources of deleted job");
    }
    Ok(removed)
}

fn is_orphan(
    object: &OwnedObject,
    live_uids: &HashSet<String>,
    live_keys: &BTreeSet<JobKey>,
) -> bool {
    match object.owner_uid() {
        Some(uid) => !live_uids.contains(uid),
        None => match object.labels().get(labels::JOB_NAME) {
            Some(job) => !live_keys.contains(&JobKey::new(object.namespace(), job.as_str())),
            None => false,
        },
    }
}

/// Whether the job `object` belongs to exists now.
///
/// The job snapshot is older than the object listing, so a job created in
/// between would otherwise lose everything it just created.
async fn owner_exists(repo: &dyn Repository, object: &OwnedObject) -> Result<bool> {
    let Some(key) = object.owner_key() else {
        return Ok(false);
    };
    let Some(job) = repo.get_job(&key).await? else {
        return Ok(false);
    };
    Ok(match object.owner_uid() {
        Some(uid) => job.metadata.uid.as_deref() == Some(uid),
        None => true,
    })
}

/// Outcome of one orphan sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    /// Jobs that existed when the sweep started
    pub live_jobs: BTreeSet<JobKey>,
}

/// Delete managed objects in `namespace` (all when `None`) whose owning
/// job no longer exists.
///
/// Ownership is decided by the controller ownerReference uid, so objects
/// left behind by an earlier job of the same name are removed too.
pub async fn sweep_orphans(
    repo: &dyn Repository,
    namespace: Option<&str>,
    include_pod_groups: bool,
) -> Result<SweepReport> {
    let jobs = repo.list_jobs(&ObjectSelector::scoped(namespace)).await?;
    let live_uids: HashSet<String> = jobs
        .iter()
        .filter_map(|j| j.metadata.uid.clone())
        .collect();
    let live_jobs: BTreeSet<JobKey> = jobs.iter().filter_map(JobKey::for_job).collect();

    let selector = ObjectSelector::managed(namespace);
    let mut removed = 0;
    for kind in deletion_order(include_pod_groups) {
        for object in repo.list(kind, &selector).await? {
            if !is_orphan(&object, &live_uids, &live_jobs) {
                continue;
            }
            if owner_exists(repo, &object).await? {
                debug!(kind = %kind, namespace = object.namespace(), name = object.name(), "owner appeared during sweep, keeping");
                continue;
            }
            debug!(kind = %kind, namespace = object.namespace(), name = object.name(), "deleting orphan");
            repo.delete(kind, object.namespace(), object.name()).await?;
            removed += 1;
        }
    }

    if removed > 0 {
        info!(removed, "orphan sweep removed resources");
    }
    Ok(SweepReport { removed, live_jobs })
}
