//! Status reporting: replica counts, condition history and completion time
//!
//! Conditions form an append-only history. A condition is appended only when
//! the phase actually changes, and `phase` is always the type of the newest
//! phase condition. `completionTime` is set once, on the first terminal
//! transition.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use mpi_common::crd::{
    Condition, ConditionStatus, JobPhase, MPIJob, MPIJobStatus, ReplicaStatus, ReplicaType,
};
use mpi_common::DEFAULT_CONTAINER_NAME;

use crate::error::JobError;
use crate::repository::Repository;

/// Lifecycle phase of one execution unit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl UnitPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, UnitPhase::Pending | UnitPhase::Running)
    }
}

pub fn unit_phase(pod: &Pod) -> UnitPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => UnitPhase::Running,
        Some("Succeeded") => UnitPhase::Succeeded,
        Some("Failed") => UnitPhase::Failed,
        _ => UnitPhase::Pending,
    }
}

/// Running with a `Ready=True` condition
pub fn is_unit_ready(pod: &Pod) -> bool {
    unit_phase(pod) == UnitPhase::Running
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
}

/// Exit code of the terminated `mpi` container, if any
pub fn exit_code(pod: &Pod) -> Option<i32> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|s| s.name == DEFAULT_CONTAINER_NAME)
        .or_else(|| statuses.first())
        .and_then(|s| s.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .map(|t| t.exit_code)
}

/// Human-readable reason for a unit's termination
pub fn termination_message(pod: &Pod) -> String {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let reason = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|s| s.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .and_then(|t| t.reason.clone())
        .or_else(|| pod.status.as_ref().and_then(|s| s.reason.clone()));

    match (reason, exit_code(pod)) {
        (Some(reason), Some(code)) => format!("{name} exited with code {code} ({reason})"),
        (None, Some(code)) => format!("{name} exited with code {code}"),
        (Some(reason), None) => format!("{name} failed: {reason}"),
        (None, None) => format!("{name} failed"),
    }
}

/// Unit counts of one role
pub fn replica_status<'a>(pods: impl IntoIterator<Item = &'a Pod>) -> ReplicaStatus {
    pods.into_iter()
        .fold(ReplicaStatus::default(), |mut counts, pod| {
            match unit_phase(pod) {
                UnitPhase::Pending | UnitPhase::Running => counts.active += 1,
                UnitPhase::Succeeded => counts.succeeded += 1,
                UnitPhase::Failed => counts.failed += 1,
            }
            counts
        })
}

/// Unit counts for both roles
pub fn replica_statuses(launcher: Option<&Pod>, workers: &[Pod]) -> BTreeMap<ReplicaType, ReplicaStatus> {
    BTreeMap::from([
        (ReplicaType::Launcher, replica_status(launcher)),
        (ReplicaType::Worker, replica_status(workers)),
    ])
}

/// Phase implied by the newest phase condition
pub fn current_phase(conditions: &[Condition]) -> Option<JobPhase> {
    conditions
        .iter()
        .rev()
        .find_map(|c| JobPhase::from_condition_type(&c.type_))
}

/// Record a transition into `phase`.
///
/// Appends one condition when `phase` differs from the current phase and
/// returns whether anything was appended. Entering a terminal phase sets
/// `completion_time` if it is not set yet.
pub fn record_transition(
    status: &mut MPIJobStatus,
    phase: JobPhase,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> bool {
    if current_phase(&status.conditions) == Some(phase) {
        return false;
    }

    status.conditions.push(Condition::at(
        phase.as_str(),
        ConditionStatus::True,
        reason,
        message,
        now,
    ));
    status.phase = Some(phase);
    if phase.is_terminal() && status.completion_time.is_none() {
        status.completion_time = Some(now);
    }
    true
}

/// Start of the current attempt: time of the newest `Created` condition
pub fn attempt_started_at(status: &MPIJobStatus) -> Option<DateTime<Utc>> {
    status
        .conditions
        .iter()
        .rev()
        .find(|c| c.type_ == JobPhase::Created.as_str())
        .map(|c| c.last_transition_time)
}

/// Writes job status through the repository
pub struct StatusReporter {
    repo: Arc<dyn Repository>,
}

impl StatusReporter {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Persist `status` on `job`, skipping the write when nothing changed.
    ///
    /// Returns the job as stored. A stale resource version surfaces as a
    /// transient conflict and the reconcile is retried with fresh state.
    pub async fn publish(&self, job: &MPIJob, status: MPIJobStatus) -> Result<MPIJob, JobError> {
        if job.status.as_ref() == Some(&status) {
            return Ok(job.clone());
        }

        debug!(
            job = job.metadata.name.as_deref().unwrap_or_default(),
            phase = ?status.phase,
            conditions = status.conditions.len(),
            "writing job status"
        );

        let mut updated = job.clone();
        updated.status = Some(status);
        Ok(self.repo.update_job_status(&updated).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockRepository;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };
    use mpi_common::crd::MPIJobSpec;
    use mpi_common::Error;

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated(code: i32, reason: &str) -> Pod {
        let mut p = pod(if code == 0 { "Succeeded" } else { "Failed" });
        p.metadata.name = Some("train1-launcher".to_string());
        if let Some(status) = p.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "mpi".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: code,
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        p
    }

    #[test]
    fn unit_phase_maps_pod_phase() {
        assert_eq!(unit_phase(&pod("Running")), UnitPhase::Running);
        assert_eq!(unit_phase(&pod("Succeeded")), UnitPhase::Succeeded);
        assert_eq!(unit_phase(&pod("Failed")), UnitPhase::Failed);
        assert_eq!(unit_phase(&pod("Unknown")), UnitPhase::Pending);
        assert_eq!(unit_phase(&Pod::default()), UnitPhase::Pending);
    }

    #[test]
    fn readiness_requires_ready_condition() {
        let mut p = pod("Running");
        assert!(!is_unit_ready(&p));
        if let Some(status) = p.status.as_mut() {
            status.conditions = Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]);
        }
        assert!(is_unit_ready(&p));
    }

    #[test]
    fn exit_code_and_message_come_from_mpi_container() {
        let p = terminated(137, "OOMKilled");
        assert_eq!(exit_code(&p), Some(137));
        assert_eq!(
            termination_message(&p),
            "train1-launcher exited with code 137 (OOMKilled)"
        );
        assert_eq!(exit_code(&pod("Failed")), None);
    }

    #[test]
    fn replica_counts_by_phase() {
        let pods = vec![pod("Pending"), pod("Running"), pod("Succeeded"), pod("Failed")];
        let counts = replica_status(&pods);
        assert_eq!(counts.active, 2);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);

        let statuses = replica_statuses(None, &pods);
        assert_eq!(statuses[&ReplicaType::Launcher], ReplicaStatus::default());
    }

    #[test]
    fn repeated_transition_appends_once() {
        let mut status = MPIJobStatus::default();
        let now = Utc::now();
        assert!(record_transition(&mut status, JobPhase::Created, "MPIJobCreated", "", now));
        assert!(!record_transition(&mut status, JobPhase::Created, "MPIJobCreated", "", now));
        assert!(record_transition(&mut status, JobPhase::Running, "MPIJobRunning", "", now));
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.phase, Some(JobPhase::Running));
    }

    #[test]
    fn completion_time_is_set_once() {
        let mut status = MPIJobStatus::default();
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(30);
        record_transition(&mut status, JobPhase::Running, "MPIJobRunning", "", first);
        assert!(status.completion_time.is_none());

        record_transition(&mut status, JobPhase::Succeeded, "MPIJobSucceeded", "", first);
        assert_eq!(status.completion_time, Some(first));

        record_transition(&mut status, JobPhase::Failed, "MPIJobFailed", "", later);
        assert_eq!(status.completion_time, Some(first));
    }

    #[test]
    fn history_is_never_rewritten() {
        let mut status = MPIJobStatus::default();
        let now = Utc::now();
        for phase in [
            JobPhase::Created,
            JobPhase::Running,
            JobPhase::Restarting,
            JobPhase::Created,
        ] {
            record_transition(&mut status, phase, "r", "", now);
        }
        let types: Vec<&str> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["Created", "Running", "Restarting", "Created"]);
        assert_eq!(current_phase(&status.conditions), Some(JobPhase::Created));
    }

    #[test]
    fn attempt_start_is_newest_created_condition() {
        let mut status = MPIJobStatus::default();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(60);
        record_transition(&mut status, JobPhase::Created, "r", "", t0);
        record_transition(&mut status, JobPhase::Restarting, "r", "", t0);
        record_transition(&mut status, JobPhase::Created, "r", "", t1);
        assert_eq!(attempt_started_at(&status), Some(t1));
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let mut mock = MockRepository::new();
        mock.expect_update_job_status().never();
        let reporter = StatusReporter::new(Arc::new(mock));

        let mut job = MPIJob::new("train1", MPIJobSpec::default());
        job.status = Some(MPIJobStatus::default());
        reporter
            .publish(&job, MPIJobStatus::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflict_surfaces_as_transient_error() {
        let mut mock = MockRepository::new();
        mock.expect_update_job_status()
            .times(1)
            .returning(|_| Err(Error::conflict("MPIJob", "train1")));
        let reporter = StatusReporter::new(Arc::new(mock));

        let job = MPIJob::new("train1", MPIJobSpec::default());
        let mut status = MPIJobStatus::default();
        status.restart_count = 1;
        let err = reporter.publish(&job, status).await.unwrap_err();
        assert!(err.is_transient());
    }
}
