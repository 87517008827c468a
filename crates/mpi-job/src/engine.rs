//! Per-job reconciliation state machine
//!
//! One call to [`JobEngine::reconcile`] observes the job and its pods,
//! performs the next step and records status. Every step is idempotent, so
//! a crash between any two writes is repaired by the next call.
//!
//! Lifecycle: Created → WorkersPending → WorkersReady → LauncherRunning →
//! Succeeded | Failed, with Restarting looping back to Created.
//!
//! Resources are created in dependency order:
//! - launcher identity (ServiceAccount, Role, RoleBinding)
//! - connectivity (SSH Secret, ConfigMap with the hostfile)
//! - PodGroup (gang mode), headless worker Service and worker pods
//! - the launcher, only after the scheduling gate opens

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info, instrument, warn};

use mpi_common::crd::{CleanPodPolicy, JobPhase, MPIJob, MPIJobStatus, ReplicaType};
use mpi_common::events::{actions, reasons, EventPublisher};
use mpi_common::{labels, Error};
use mpi_volcano::{pod_group_name, PodGroup};

use crate::builder::{build_launcher, build_worker, build_worker_service, job_name, BuildConfig};
use crate::connectivity::{build_connectivity_artifact, ssh_secret_name};
use crate::error::JobError;
use crate::gate::SchedulingGate;
use crate::rbac::{build_role, build_role_binding, build_service_account};
use crate::repository::{JobKey, ObjectKind, ObjectSelector, OwnedObject, Repository};
use crate::status::{
    attempt_started_at, current_phase, exit_code, is_unit_ready, record_transition,
    replica_statuses, termination_message, unit_phase, StatusReporter, UnitPhase,
};
use crate::sweep::remove_job_resources;

/// Engine settings that are not part of any job
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Requeue delay while waiting on workers or a teardown
    pub pending_requeue: Duration,
    /// Cluster DNS domain
    pub cluster_domain: String,
    pub gate: SchedulingGate,
    /// Namespace the controller is limited to; `None` covers all
    pub namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_requeue: Duration::from_secs(10),
            cluster_domain: "cluster.local".to_string(),
            gate: SchedulingGate::Readiness,
            namespace: None,
        }
    }
}

impl EngineConfig {
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            cluster_domain: self.cluster_domain.clone(),
            gang_scheduled: self.gate.is_gang(),
            gang_include_launcher: self.gate.includes_launcher(),
        }
    }
}

/// Where a job stands after one reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStage {
    /// Job is gone or being deleted
    Removed,
    Created,
    /// Waiting on worker readiness or gang admission
    WorkersPending,
    /// Launcher created, not yet running
    WorkersReady,
    LauncherRunning,
    /// Tearing down a failed attempt
    Restarting,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub stage: JobStage,
    /// `None` waits for the next change to the job or its pods
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn done(stage: JobStage) -> Self {
        Self {
            stage,
            requeue_after: None,
        }
    }

    fn requeue(stage: JobStage, after: Duration) -> Self {
        Self {
            stage,
            requeue_after: Some(after),
        }
    }
}

/// Pods and PodGroup of a job as currently stored
#[derive(Default)]
struct Observed {
    launcher: Option<Pod>,
    /// Sorted by ordinal
    workers: Vec<Pod>,
    pod_group: Option<PodGroup>,
}

impl Observed {
    fn units(&self) -> impl Iterator<Item = &Pod> {
        self.launcher.iter().chain(self.workers.iter())
    }

    fn is_empty(&self) -> bool {
        self.launcher.is_none() && self.workers.is_empty()
    }
}

fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.labels.as_ref()?.get(key).map(String::as_str)
}

fn pod_role(pod: &Pod) -> Option<ReplicaType> {
    let role = pod_label(pod, labels::JOB_ROLE)?;
    [ReplicaType::Launcher, ReplicaType::Worker]
        .into_iter()
        .find(|r| r.role() == role)
}

fn pod_ordinal(pod: &Pod) -> Option<u32> {
    pod_label(pod, labels::REPLICA_INDEX)?.parse().ok()
}

/// Time left until `at`, at least one second
fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_secs(1))
}

/// Drives MPIJobs through their lifecycle against a [`Repository`]
pub struct JobEngine {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    status: StatusReporter,
    build: BuildConfig,
    config: EngineConfig,
}

impl JobEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            status: StatusReporter::new(repo.clone()),
            build: config.build_config(),
            repo,
            events,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Bring one job one step closer to its declared state.
    ///
    /// A missing job has its leftover resources removed. Store errors are
    /// returned for the caller to retry with backoff; nothing is half-applied
    /// in a way the next call cannot finish.
    #[instrument(skip(self), fields(job = %key))]
    pub async fn reconcile(&self, key: &JobKey) -> Result<ReconcileOutcome, JobError> {
        let Some(mut job) = self.repo.get_job(key).await? else {
            remove_job_resources(self.repo.as_ref(), key, self.config.gate.is_gang()).await?;
            return Ok(ReconcileOutcome::done(JobStage::Removed));
        };

        if job.metadata.deletion_timestamp.is_some() {
            debug!("job is being deleted");
            return Ok(ReconcileOutcome::done(JobStage::Removed));
        }

        let mut status = job.status.clone().unwrap_or_default();
        if status.is_terminal() {
            let observed = self.observe(&job, key).await?;
            return self.finalize(&job, &status, &observed).await;
        }

        if let Err(e) = job.spec.validate(&key.name) {
            return self.reject_invalid(&job, status, e).await;
        }

        let now = Utc::now();
        if status.conditions.is_empty() {
            let message = format!("MPIJob {key} is created.");
            record_transition(
                &mut status,
                JobPhase::Created,
                reasons::JOB_CREATED,
                &message,
                now,
            );
            status.start_time.get_or_insert(now);
            status.observed_generation = job.metadata.generation;
            info!("job accepted");
            self.emit(&job, EventType::Normal, reasons::JOB_CREATED, actions::RECONCILE, message)
                .await;
            job = self.status.publish(&job, status.clone()).await?;
        }
        status.observed_generation = job.metadata.generation;

        let mut observed = self.observe(&job, key).await?;
        status.replica_statuses = replica_statuses(observed.launcher.as_ref(), &observed.workers);

        if current_phase(&status.conditions) == Some(JobPhase::Restarting) {
            if !observed.is_empty() {
                self.delete_units(&observed, |_| true).await?;
                self.status.publish(&job, status).await?;
                return Ok(ReconcileOutcome::requeue(
                    JobStage::Restarting,
                    self.config.pending_requeue,
                ));
            }
            let message = format!(
                "MPIJob {key} attempt {} is created.",
                status.restart_count + 1
            );
            record_transition(
                &mut status,
                JobPhase::Created,
                reasons::JOB_CREATED,
                &message,
                now,
            );
            info!(restarts = status.restart_count, "starting new attempt");
        }

        let deadline = self.deadline(&job, &status);

        if let Some(launcher) = observed.launcher.as_ref() {
            return self
                .track_launcher(&job, status, &observed, launcher, deadline)
                .await;
        }

        if deadline.is_some_and(|d| d <= now) {
            return self.workers_not_ready(&job, status, &observed).await;
        }

        self.remove_excess_workers(&job, &mut observed).await?;

        let failed: Vec<&Pod> = observed
            .workers
            .iter()
            .filter(|p| unit_phase(p) == UnitPhase::Failed)
            .collect();
        if !failed.is_empty() {
            return self
                .worker_failures(&job, status, &observed, &failed)
                .await;
        }

        self.provision(&job, &observed).await?;

        let gate = self
            .config
            .gate
            .evaluate(&job, &observed.workers, observed.pod_group.as_ref());
        if !gate.is_ready() {
            debug!(?gate, "waiting on scheduling gate");
            self.status.publish(&job, status).await?;
            let wait = match deadline {
                Some(d) => self.config.pending_requeue.min(until(d, now)),
                None => self.config.pending_requeue,
            };
            return Ok(ReconcileOutcome::requeue(JobStage::WorkersPending, wait));
        }

        self.ensure(&job, build_launcher(&job, &self.build).into())
            .await?;
        info!(workers = observed.workers.len(), "workers ready, launcher created");
        self.status.publish(&job, status).await?;

        Ok(ReconcileOutcome {
            stage: JobStage::WorkersReady,
            requeue_after: deadline.map(|d| until(d, now)),
        })
    }

    async fn observe(&self, job: &MPIJob, key: &JobKey) -> Result<Observed, JobError> {
        let uid = job.metadata.uid.as_deref();
        let mut observed = Observed::default();

        for object in self
            .repo
            .list(ObjectKind::Pod, &ObjectSelector::for_job(key))
            .await?
        {
            // Pods of an earlier job with the same name belong to the sweep
            if uid.is_some() && object.owner_uid() != uid {
                continue;
            }
            let OwnedObject::Pod(pod) = object else {
                continue;
            };
            match pod_role(&pod) {
                Some(ReplicaType::Launcher) => observed.launcher = Some(pod),
                Some(ReplicaType::Worker) => observed.workers.push(pod),
                None => {}
            }
        }
        observed.workers.sort_by_key(pod_ordinal);

        if self.config.gate.is_gang() {
            observed.pod_group = self
                .repo
                .get(
                    ObjectKind::PodGroup,
                    &key.namespace,
                    &pod_group_name(&key.name),
                )
                .await?
                .and_then(|o| o.as_pod_group().cloned());
        }

        Ok(observed)
    }

    /// Deadline of the current attempt. A deadline past the end of the
    /// representable calendar is never reached and counts as none.
    fn deadline(&self, job: &MPIJob, status: &MPIJobStatus) -> Option<DateTime<Utc>> {
        let secs = job.spec.run_policy.active_deadline_seconds?;
        let started = attempt_started_at(status)?;
        started.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }

    /// Delete workers whose ordinal is past the desired count
    async fn remove_excess_workers(
        &self,
        job: &MPIJob,
        observed: &mut Observed,
    ) -> Result<(), JobError> {
        let desired = job.spec.worker_replicas();
        let is_excess = |pod: &Pod| {
            pod_role(pod) == Some(ReplicaType::Worker) && pod_ordinal(pod).is_some_and(|i| i >= desired)
        };
        let removed = self.delete_units(observed, is_excess).await?;
        if removed > 0 {
            info!(removed, desired, "removed workers beyond the desired count");
            observed.workers.retain(|p| !is_excess(p));
        }
        Ok(())
    }

    /// Create everything the launcher depends on, skipping what exists
    async fn provision(&self, job: &MPIJob, observed: &Observed) -> Result<(), JobError> {
        let name = job_name(job);
        let namespace = job
            .metadata
            .namespace
            .as_deref()
            .ok_or(JobError::MissingNamespace)?;

        self.ensure(job, build_service_account(job).into()).await?;
        self.ensure(job, build_role(job).into()).await?;
        self.ensure(job, build_role_binding(job).into()).await?;

        let existing = self
            .repo
            .get(ObjectKind::Secret, namespace, &ssh_secret_name(name))
            .await?;
        let artifact =
            build_connectivity_artifact(job, existing.as_ref().and_then(|o| o.as_secret()))?;
        if artifact.generated {
            self.create(job, artifact.secret.into()).await?;
        }
        self.sync_config_map(job, artifact.config_map).await?;

        if let Some(pod_group) = self.config.gate.desired_pod_group(job) {
            if observed.pod_group.is_none() {
                self.create(job, pod_group.into()).await?;
            }
        }
        self.ensure(job, build_worker_service(job).into()).await?;

        let present: BTreeSet<u32> = observed.workers.iter().filter_map(pod_ordinal).collect();
        for index in 0..job.spec.worker_replicas() {
            if !present.contains(&index) {
                self.create(job, build_worker(job, &self.build, index).into())
                    .await?;
            }
        }

        Ok(())
    }

    /// Create the config map, or rewrite it when the host list has drifted
    async fn sync_config_map(&self, job: &MPIJob, mut desired: ConfigMap) -> Result<(), JobError> {
        let existing = self
            .repo
            .get(
                ObjectKind::ConfigMap,
                desired.metadata.namespace.as_deref().unwrap_or_default(),
                desired.metadata.name.as_deref().unwrap_or_default(),
            )
            .await?;
        let Some(existing) = existing.as_ref().and_then(OwnedObject::as_config_map) else {
            return self.create(job, desired.into()).await;
        };
        if existing.data == desired.data {
            return Ok(());
        }

        desired.metadata.resource_version = existing.metadata.resource_version.clone();
        let object = OwnedObject::from(desired);
        self.repo.replace(&object).await?;
        info!(name = object.name(), "host list updated");
        Ok(())
    }

    async fn ensure(&self, job: &MPIJob, object: OwnedObject) -> Result<(), JobError> {
        if self
            .repo
            .get(object.kind(), object.namespace(), object.name())
            .await?
            .is_some()
        {
            return Ok(());
        }
        self.create(job, object).await
    }

    /// Create `object`. An existing object counts as created.
    async fn create(&self, job: &MPIJob, object: OwnedObject) -> Result<(), JobError> {
        match self.repo.create(&object).await {
            Ok(_) => {
                debug!(kind = %object.kind(), name = object.name(), "created");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e @ Error::Rejected { .. }) => {
                warn!(kind = %object.kind(), name = object.name(), error = %e, "create rejected");
                self.emit(
                    job,
                    EventType::Warning,
                    reasons::FAILED_CREATE,
                    actions::CREATE,
                    e.to_string(),
                )
                .await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_units(
        &self,
        observed: &Observed,
        select: impl Fn(&Pod) -> bool,
    ) -> Result<usize, JobError> {
        let mut deleted = 0;
        for pod in observed.units().filter(|pod| select(*pod)) {
            let (Some(namespace), Some(name)) = (
                pod.metadata.namespace.as_deref(),
                pod.metadata.name.as_deref(),
            ) else {
                continue;
            };
            self.repo.delete(ObjectKind::Pod, namespace, name).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Launcher exists: follow it to completion
    async fn track_launcher(
        &self,
        job: &MPIJob,
        mut status: MPIJobStatus,
        observed: &Observed,
        launcher: &Pod,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<ReconcileOutcome, JobError> {
        let name = job_name(job);
        let now = Utc::now();

        match unit_phase(launcher) {
            UnitPhase::Succeeded => {
                let message = format!("MPIJob {name} successfully completed.");
                return self
                    .terminate(job, status, observed, JobPhase::Succeeded, reasons::JOB_SUCCEEDED, message)
                    .await;
            }
            UnitPhase::Failed => return self.launcher_failed(job, status, observed, launcher).await,
            UnitPhase::Pending | UnitPhase::Running => {}
        }

        // A lost participant cannot rejoin a running MPI world
        if let Some(worker) = observed
            .workers
            .iter()
            .find(|p| unit_phase(p) == UnitPhase::Failed)
        {
            let message = format!("{} while the launcher was running", termination_message(worker));
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::WORKER_FAILED, message)
                .await;
        }
        let desired = job.spec.worker_replicas() as usize;
        if observed.workers.len() < desired {
            let message = format!(
                "{} of {desired} workers disappeared while the launcher was running",
                desired - observed.workers.len()
            );
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::WORKER_FAILED, message)
                .await;
        }

        if deadline.is_some_and(|d| d <= now) {
            let message = format!("MPIJob {name} exceeded its active deadline");
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::DEADLINE_EXCEEDED, message)
                .await;
        }

        let stage = if unit_phase(launcher) == UnitPhase::Running {
            let message = format!("MPIJob {name} is running.");
            if record_transition(&mut status, JobPhase::Running, reasons::JOB_RUNNING, &message, now) {
                info!("launcher running");
                self.emit(job, EventType::Normal, reasons::JOB_RUNNING, actions::RECONCILE, message)
                    .await;
            }
            JobStage::LauncherRunning
        } else {
            JobStage::WorkersReady
        };

        self.status.publish(job, status).await?;
        Ok(ReconcileOutcome {
            stage,
            requeue_after: deadline.map(|d| until(d, now)),
        })
    }

    async fn launcher_failed(
        &self,
        job: &MPIJob,
        status: MPIJobStatus,
        observed: &Observed,
        launcher: &Pod,
    ) -> Result<ReconcileOutcome, JobError> {
        let policy = job.spec.restart_policy_for(ReplicaType::Launcher);
        let message = termination_message(launcher);

        if !policy.allows_retry(exit_code(launcher)) {
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::JOB_FAILED, message)
                .await;
        }

        let limit = job.spec.backoff_limit();
        if status.restart_count >= limit {
            let message = format!("{message}; backoff limit of {limit} restarts reached");
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::JOB_FAILED, message)
                .await;
        }

        self.restart(job, status, observed, format!("{message}; restarting"))
            .await
    }

    /// Deadline passed before the gate opened
    async fn workers_not_ready(
        &self,
        job: &MPIJob,
        status: MPIJobStatus,
        observed: &Observed,
    ) -> Result<ReconcileOutcome, JobError> {
        let desired = job.spec.worker_replicas();
        let ready = observed.workers.iter().filter(|p| is_unit_ready(p)).count();
        let message = format!("{ready} of {desired} workers ready before the active deadline");

        if job.spec.restart_policy.allows_retry(None) && status.restart_count < job.spec.backoff_limit() {
            return self.restart(job, status, observed, message).await;
        }
        self.terminate(job, status, observed, JobPhase::Failed, reasons::WORKER_NOT_READY, message)
            .await
    }

    /// Workers failed before the launcher started: replace them or give up
    async fn worker_failures(
        &self,
        job: &MPIJob,
        status: MPIJobStatus,
        observed: &Observed,
        failed: &[&Pod],
    ) -> Result<ReconcileOutcome, JobError> {
        let policy = job.spec.restart_policy_for(ReplicaType::Worker);
        if let Some(fatal) = failed.iter().find(|p| !policy.allows_retry(exit_code(p))) {
            let message = termination_message(fatal);
            return self
                .terminate(job, status, observed, JobPhase::Failed, reasons::WORKER_FAILED, message)
                .await;
        }

        for pod in failed {
            info!(worker = pod.metadata.name.as_deref().unwrap_or_default(), "replacing failed worker");
        }
        let names: BTreeSet<&str> = failed
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        self.delete_units(observed, |p| {
            p.metadata
                .name
                .as_deref()
                .is_some_and(|n| names.contains(n))
        })
        .await?;

        self.status.publish(job, status).await?;
        Ok(ReconcileOutcome::requeue(
            JobStage::WorkersPending,
            self.config.pending_requeue,
        ))
    }

    /// Tear down every unit and start the next attempt. Artifacts are kept.
    async fn restart(
        &self,
        job: &MPIJob,
        mut status: MPIJobStatus,
        observed: &Observed,
        message: String,
    ) -> Result<ReconcileOutcome, JobError> {
        self.delete_units(observed, |_| true).await?;
        status.restart_count += 1;
        record_transition(
            &mut status,
            JobPhase::Restarting,
            reasons::JOB_RESTARTING,
            &message,
            Utc::now(),
        );
        warn!(restarts = status.restart_count, %message, "restarting job");
        self.emit(job, EventType::Warning, reasons::JOB_RESTARTING, actions::DELETE, message)
            .await;
        self.status.publish(job, status).await?;

        Ok(ReconcileOutcome::requeue(
            JobStage::Restarting,
            self.config.pending_requeue,
        ))
    }

    async fn terminate(
        &self,
        job: &MPIJob,
        mut status: MPIJobStatus,
        observed: &Observed,
        phase: JobPhase,
        reason: &str,
        message: String,
    ) -> Result<ReconcileOutcome, JobError> {
        record_transition(&mut status, phase, reason, &message, Utc::now());
        let event_type = if phase == JobPhase::Succeeded {
            info!(%message, "job succeeded");
            EventType::Normal
        } else {
            warn!(reason, %message, "job failed");
            EventType::Warning
        };
        self.emit(job, event_type, reason, actions::RECONCILE, message)
            .await;

        let job = self.status.publish(job, status.clone()).await?;
        self.finalize(&job, &status, observed).await
    }

    async fn reject_invalid(
        &self,
        job: &MPIJob,
        mut status: MPIJobStatus,
        error: Error,
    ) -> Result<ReconcileOutcome, JobError> {
        let message = error.to_string();
        warn!(%message, "invalid MPIJob");
        record_transition(
            &mut status,
            JobPhase::Failed,
            reasons::VALIDATION_FAILED,
            &message,
            Utc::now(),
        );
        self.emit(job, EventType::Warning, reasons::VALIDATION_FAILED, actions::RECONCILE, message)
            .await;

        let job = self.status.publish(job, status.clone()).await?;
        self.finalize(&job, &status, &Observed::default()).await
    }

    /// Terminal job: apply the clean pod policy, then the TTL
    async fn finalize(
        &self,
        job: &MPIJob,
        status: &MPIJobStatus,
        observed: &Observed,
    ) -> Result<ReconcileOutcome, JobError> {
        let stage = if status.phase == Some(JobPhase::Succeeded) {
            JobStage::Succeeded
        } else {
            JobStage::Failed
        };

        let policy = job.spec.run_policy.clean_pod_policy;
        let cleaned = match policy {
            CleanPodPolicy::All => self.delete_units(observed, |_| true).await?,
            CleanPodPolicy::Running => {
                self.delete_units(observed, |p| unit_phase(p).is_active())
                    .await?
            }
            CleanPodPolicy::None => 0,
        };
        if policy != CleanPodPolicy::None {
            if let Some(pg) = observed.pod_group.as_ref() {
                self.repo
                    .delete(ObjectKind::PodGroup, &pg.metadata.namespace, &pg.metadata.name)
                    .await?;
            }
        }
        if cleaned > 0 {
            debug!(cleaned, ?policy, "cleaned up pods of finished job");
        }

        let (Some(ttl), Some(finished)) = (
            job.spec.run_policy.ttl_seconds_after_finished,
            status.completion_time,
        ) else {
            return Ok(ReconcileOutcome::done(stage));
        };

        let Some(expires) =
            finished.checked_add_signed(chrono::Duration::seconds(i64::from(ttl.max(0))))
        else {
            return Ok(ReconcileOutcome::done(stage));
        };
        let now = Utc::now();
        if expires > now {
            return Ok(ReconcileOutcome::requeue(stage, until(expires, now)));
        }

        let key = JobKey::for_job(job).ok_or(JobError::MissingNamespace)?;
        info!(ttl, "finished job expired, deleting");
        self.repo.delete_job(&key).await?;
        remove_job_resources(self.repo.as_ref(), &key, self.config.gate.is_gang()).await?;
        Ok(ReconcileOutcome::done(JobStage::Removed))
    }

    async fn emit(
        &self,
        job: &MPIJob,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.events
            .publish(&job.object_ref(&()), type_, reason, action, Some(note))
            .await;
    }
}
