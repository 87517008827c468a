//! In-memory repository
//!
//! Behaves like the API server for the subset the engine relies on:
//! resource versions on jobs, `AlreadyExists` on duplicate creates and
//! idempotent deletes. Test hooks simulate the kubelet and the scheduler
//! (pod phases, readiness, PodGroup admission) and inject store faults.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::RwLock;

use mpi_common::crd::MPIJob;
use mpi_common::{Error, Result, DEFAULT_CONTAINER_NAME};
use mpi_volcano::{PodGroupPhase, PodGroupStatus};

use super::{JobKey, ObjectKind, ObjectSelector, OwnedObject, Repository};

type ObjectId = (ObjectKind, String, String);

#[derive(Default)]
struct State {
    jobs: BTreeMap<JobKey, MPIJob>,
    objects: BTreeMap<ObjectId, OwnedObject>,
    next_version: u64,
    creates: usize,
    replaces: usize,
    deletes: usize,
    rejected_kinds: BTreeMap<ObjectKind, String>,
    status_conflicts: u32,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Object store held in process memory
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{kind} {name} not found"),
            reason: "NotFound".to_string(),
            code: 404,
        }),
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a job as if submitted by a user; assigns uid and resource version
    pub fn insert_job(&self, mut job: MPIJob) -> MPIJob {
        let mut state = self.state.write();
        let version = state.bump();
        if job.metadata.uid.is_none() {
            job.metadata.uid = Some(format!("uid-{version}"));
        }
        if job.metadata.namespace.is_none() {
            job.metadata.namespace = Some("default".to_string());
        }
        job.metadata.resource_version = Some(version);
        job.metadata.creation_timestamp = Some(Time(Utc::now()));
        if let Some(key) = JobKey::for_job(&job) {
            state.jobs.insert(key, job.clone());
        }
        job
    }

    pub fn job(&self, key: &JobKey) -> Option<MPIJob> {
        self.state.read().jobs.get(key).cloned()
    }

    /// Drop a job without touching anything it owns
    pub fn remove_job(&self, key: &JobKey) {
        self.state.write().jobs.remove(key);
    }

    /// Mark a job as being deleted, as a finalizer-holding API server would
    pub fn mark_job_deleting(&self, key: &JobKey) {
        if let Some(job) = self.state.write().jobs.get_mut(key) {
            job.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
    }

    /// Move every recorded timestamp of a job's status `by` into the past
    pub fn backdate_job(&self, key: &JobKey, by: chrono::Duration) {
        let mut state = self.state.write();
        let version = state.bump();
        if let Some(status) = state
            .jobs
            .get_mut(key)
            .and_then(|job| {
                job.metadata.resource_version = Some(version);
                job.status.as_mut()
            })
        {
            for condition in &mut status.conditions {
                condition.last_transition_time -= by;
            }
            if let Some(t) = status.start_time.as_mut() {
                *t -= by;
            }
            if let Some(t) = status.completion_time.as_mut() {
                *t -= by;
            }
        }
    }

    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<OwnedObject> {
        self.state
            .read()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self, kind: ObjectKind) -> Vec<OwnedObject> {
        self.state
            .read()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Number of objects of every kind currently stored
    pub fn object_count(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Successful create calls so far
    pub fn create_calls(&self) -> usize {
        self.state.read().creates
    }

    /// Successful replace calls so far
    pub fn replace_calls(&self) -> usize {
        self.state.read().replaces
    }

    /// Objects actually removed so far
    pub fn delete_calls(&self) -> usize {
        self.state.read().deletes
    }

    /// Reject every create of `kind` with `message` until [`Self::accept_creates`]
    pub fn reject_creates(&self, kind: ObjectKind, message: impl Into<String>) {
        self.state
            .write()
            .rejected_kinds
            .insert(kind, message.into());
    }

    pub fn accept_creates(&self, kind: ObjectKind) {
        self.state.write().rejected_kinds.remove(&kind);
    }

    /// Fail the next `count` status updates with `Conflict`
    pub fn fail_status_updates(&self, count: u32) {
        self.state.write().status_conflicts = count;
    }

    fn update_pod(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Pod)) {
        let mut state = self.state.write();
        let version = state.bump();
        let id = (ObjectKind::Pod, namespace.to_string(), name.to_string());
        if let Some(OwnedObject::Pod(pod)) = state.objects.get_mut(&id) {
            f(pod);
            pod.metadata.resource_version = Some(version);
        }
    }

    /// Set a pod's phase as the kubelet would; `exit_code` fills the
    /// terminated state of the `mpi` container
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str, exit_code: Option<i32>) {
        self.update_pod(namespace, name, |pod| {
            let status = pod.status.get_or_insert_with(PodStatus::default);
            status.phase = Some(phase.to_string());
            status.conditions = None;
            status.container_statuses = exit_code.map(|code| {
                vec![ContainerStatus {
                    name: DEFAULT_CONTAINER_NAME.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: code,
                            reason: Some(if code == 0 { "Completed" } else { "Error" }.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]
            });
        });
    }

    /// Mark a pod Running with a Ready condition
    pub fn set_pod_ready(&self, namespace: &str, name: &str) {
        self.update_pod(namespace, name, |pod| {
            let status = pod.status.get_or_insert_with(PodStatus::default);
            status.phase = Some("Running".to_string());
            status.conditions = Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]);
        });
    }

    /// Report a PodGroup phase as the Volcano scheduler would
    pub fn set_pod_group_phase(&self, namespace: &str, name: &str, phase: PodGroupPhase) {
        let mut state = self.state.write();
        let id = (ObjectKind::PodGroup, namespace.to_string(), name.to_string());
        if let Some(OwnedObject::PodGroup(pg)) = state.objects.get_mut(&id) {
            pg.status = Some(PodGroupStatus {
                phase,
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_job(&self, key: &JobKey) -> Result<Option<MPIJob>> {
        Ok(self.job(key))
    }

    async fn list_jobs(&self, selector: &ObjectSelector) -> Result<Vec<MPIJob>> {
        Ok(self
            .state
            .read()
            .jobs
            .values()
            .filter(|job| {
                let labels = job.metadata.labels.clone().unwrap_or_default();
                selector.matches(job.metadata.namespace.as_deref().unwrap_or_default(), &labels)
            })
            .cloned()
            .collect())
    }

    async fn update_job_status(&self, job: &MPIJob) -> Result<MPIJob> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        let key = JobKey::for_job(job).ok_or_else(|| not_found("MPIJob", name))?;

        let mut state = self.state.write();
        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            return Err(Error::conflict("MPIJob", name));
        }

        let version = state.bump();
        let stored = state
            .jobs
            .get_mut(&key)
            .ok_or_else(|| not_found("MPIJob", name))?;
        if stored.metadata.resource_version != job.metadata.resource_version {
            return Err(Error::conflict("MPIJob", name));
        }
        stored.status = job.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.state.write().jobs.remove(key);
        Ok(())
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnedObject>> {
        Ok(self.object(kind, namespace, name))
    }

    async fn list(&self, kind: ObjectKind, selector: &ObjectSelector) -> Result<Vec<OwnedObject>> {
        Ok(self
            .objects(kind)
            .into_iter()
            .filter(|o| selector.matches(o.namespace(), &o.labels()))
            .collect())
    }

    async fn create(&self, object: &OwnedObject) -> Result<OwnedObject> {
        let kind = object.kind();
        let id = (kind, object.namespace().to_string(), object.name().to_string());

        let mut state = self.state.write();
        if let Some(message) = state.rejected_kinds.get(&kind) {
            return Err(Error::rejected(kind.as_str(), &id.2, message.clone()));
        }
        if state.objects.contains_key(&id) {
            return Err(Error::already_exists(kind.as_str(), &id.2));
        }

        let version = state.bump();
        let mut stored = object.clone();
        if let Some(meta) = stored.meta_mut() {
            meta.resource_version = Some(version.clone());
            meta.uid = Some(format!("uid-{version}"));
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        state.objects.insert(id, stored.clone());
        state.creates += 1;
        Ok(stored)
    }

    async fn replace(&self, object: &OwnedObject) -> Result<OwnedObject> {
        let kind = object.kind();
        let id = (kind, object.namespace().to_string(), object.name().to_string());

        let mut state = self.state.write();
        let version = state.bump();
        let Some(stored) = state.objects.get_mut(&id) else {
            return Err(not_found(kind.as_str(), &id.2));
        };
        let previous = stored.meta().cloned();
        *stored = object.clone();
        if let (Some(meta), Some(previous)) = (stored.meta_mut(), previous) {
            meta.uid = previous.uid;
            meta.creation_timestamp = previous.creation_timestamp;
            meta.resource_version = Some(version);
        }
        let replaced = stored.clone();
        state.replaces += 1;
        Ok(replaced)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.deletes += 1;
        }
        Ok(())
    }
}
