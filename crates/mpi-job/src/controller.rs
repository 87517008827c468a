//! kube-runtime adapter for the MPIJob engine
//!
//! `reconcile` and `error_policy` plug into `kube::runtime::Controller`.
//! Consecutive failures of the same job back off exponentially; a success
//! resets the count.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, warn};

use mpi_common::crd::MPIJob;
use mpi_common::events::{EventPublisher, KubeEventPublisher};
use mpi_common::retry::RetryConfig;
use mpi_common::CONTROLLER_NAME;

use crate::engine::{EngineConfig, JobEngine};
use crate::error::JobError;
use crate::repository::{JobKey, Repository};
use crate::sweep::sweep_orphans;

/// Shared context for the MPIJob controller
pub struct JobContext {
    pub engine: JobEngine,
    failures: DashMap<JobKey, u32>,
    retry: RetryConfig,
}

impl JobContext {
    pub fn new(engine: JobEngine) -> Self {
        Self {
            engine,
            failures: DashMap::new(),
            retry: RetryConfig::reconcile(),
        }
    }

    /// Context reading through `repo` and publishing events to the API server
    pub fn from_client(client: Client, repo: Arc<dyn Repository>, config: EngineConfig) -> Self {
        let events: Arc<dyn EventPublisher> =
            Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME));
        Self::new(JobEngine::new(repo, events, config))
    }

    /// Consecutive failed reconciles of `key`
    pub fn failures(&self, key: &JobKey) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    /// Remove resources whose job no longer exists, and forget the failure
    /// counts of those jobs
    pub async fn sweep(&self) -> Result<usize, JobError> {
        let config = self.engine.config();
        let report = sweep_orphans(
            self.engine.repository().as_ref(),
            config.namespace.as_deref(),
            config.gate.is_gang(),
        )
        .await?;
        self.failures.retain(|key, _| report.live_jobs.contains(key));
        Ok(report.removed)
    }
}

/// Reconcile an MPIJob
pub async fn reconcile(job: Arc<MPIJob>, ctx: Arc<JobContext>) -> Result<Action, JobError> {
    let key = JobKey::for_job(&job).ok_or(JobError::MissingNamespace)?;
    let outcome = ctx.engine.reconcile(&key).await?;
    ctx.failures.remove(&key);

    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

/// Error policy for MPIJob reconciliation
pub fn error_policy(job: Arc<MPIJob>, error: &JobError, ctx: Arc<JobContext>) -> Action {
    let Some(key) = JobKey::for_job(&job) else {
        error!(?error, job = %job.name_any(), "job has no namespace");
        return Action::await_change();
    };

    let failures = {
        let mut entry = ctx.failures.entry(key).or_insert(0);
        *entry += 1;
        *entry
    };
    let delay = ctx.retry.delay_for(failures);

    if error.is_transient() {
        warn!(%error, job = %job.name_any(), failures, ?delay, "job reconciliation failed, retrying");
    } else {
        error!(%error, job = %job.name_any(), failures, ?delay, "job reconciliation failed");
    }
    Action::requeue(delay)
}

/// Run the orphan sweep every `interval` until the task is dropped
pub async fn run_sweep_loop(ctx: Arc<JobContext>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = ctx.sweep().await {
            warn!(error = %e, "orphan sweep failed");
        }
    }
}
