//! Scheduling gate: decides when workers may receive the launcher
//!
//! - `Readiness`: every desired worker exists and reports Ready.
//! - `Gang`: a Volcano PodGroup sized to the gang must be admitted
//!   (`Inqueue` or `Running`), so no job ever holds a partial allocation
//!   while waiting for the rest of its workers. When the launcher is a
//!   group member, Volcano binds no worker until the launcher exists, so
//!   admission alone opens the gate; otherwise workers must also be Ready.

use k8s_openapi::api::core::v1::Pod;

use mpi_common::crd::MPIJob;
use mpi_common::Result;
use mpi_volcano::{compile_pod_group, pod_group_name, PodGroup};

use crate::builder::job_name;
use crate::repository::{JobKey, ObjectKind, ObjectSelector, Repository};
use crate::status::is_unit_ready;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingGate {
    #[default]
    Readiness,
    Gang {
        /// Size the group as workers + launcher instead of workers alone
        include_launcher: bool,
    },
}

/// Result of one gate evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateStatus {
    Ready,
    WaitingForWorkers { ready: u32, desired: u32 },
    WaitingForAdmission,
}

impl GateStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, GateStatus::Ready)
    }
}

impl SchedulingGate {
    pub fn is_gang(&self) -> bool {
        matches!(self, SchedulingGate::Gang { .. })
    }

    pub fn includes_launcher(&self) -> bool {
        matches!(
            self,
            SchedulingGate::Gang {
                include_launcher: true
            }
        )
    }

    /// PodGroup the job needs, if any. Groups with no members are skipped.
    pub fn desired_pod_group(&self, job: &MPIJob) -> Option<PodGroup> {
        match self {
            SchedulingGate::Readiness => None,
            SchedulingGate::Gang { include_launcher } => {
                let pg = compile_pod_group(job, *include_launcher);
                (pg.spec.min_member > 0).then_some(pg)
            }
        }
    }

    /// Evaluate observed workers (any order) and the observed PodGroup
    pub fn evaluate(
        &self,
        job: &MPIJob,
        workers: &[Pod],
        pod_group: Option<&PodGroup>,
    ) -> GateStatus {
        let desired = job.spec.worker_replicas();
        let ready = workers.iter().filter(|p| is_unit_ready(p)).count() as u32;
        if workers.len() as u32 != desired {
            return GateStatus::WaitingForWorkers { ready, desired };
        }

        let gang = self.desired_pod_group(job).is_some();
        let waits_for_readiness = !(gang && self.includes_launcher());
        if waits_for_readiness && ready < desired {
            return GateStatus::WaitingForWorkers { ready, desired };
        }

        if gang && !pod_group.is_some_and(|pg| pg.is_admitted()) {
            return GateStatus::WaitingForAdmission;
        }

        GateStatus::Ready
    }

    /// Whether the job's workers are collectively ready for the launcher
    pub async fn ready(&self, repo: &dyn Repository, job: &MPIJob) -> Result<bool> {
        let Some(key) = JobKey::for_job(job) else {
            return Ok(false);
        };

        let workers: Vec<Pod> = repo
            .list(
                ObjectKind::Pod,
                &ObjectSelector::for_role(&key, mpi_common::crd::ReplicaType::Worker),
            )
            .await?
            .into_iter()
            .filter_map(|o| o.as_pod().cloned())
            .collect();

        let pod_group = if self.is_gang() {
            repo.get(
                ObjectKind::PodGroup,
                &key.namespace,
                &pod_group_name(job_name(job)),
            )
            .await?
            .and_then(|o| o.as_pod_group().cloned())
        } else {
            None
        };

        Ok(self.evaluate(job, &workers, pod_group.as_ref()).is_ready())
    }
}
