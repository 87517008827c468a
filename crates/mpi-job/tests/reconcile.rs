//! Scenario tests for the MPIJob engine
//!
//! Each test walks one job through the lifecycle the way the cluster would:
//! the engine reconciles, the test plays kubelet and scheduler by flipping
//! pod phases in the in-memory store, and assertions check what a user
//! would see on the job and in the namespace.

use std::sync::Arc;

use mpi_common::crd::{
    ExecutionTemplate, JobPhase, MPIJob, MPIJobSpec, MPIJobStatus, ReplicaSpec, ReplicaType,
    RestartPolicy,
};
use mpi_common::events::{reasons, RecordingEventPublisher};
use mpi_job::connectivity::HOSTFILE_KEY;
use mpi_job::repository::InMemoryRepository;
use mpi_job::{EngineConfig, JobEngine, JobKey, JobStage, ObjectKind, OwnedObject, Repository};

// =============================================================================
// Test Fixtures
// =============================================================================

fn template(image: &str, command: &[&str]) -> ExecutionTemplate {
    ExecutionTemplate {
        image: image.to_string(),
        command: command.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

/// `workers` workers running sshd and a launcher running `mpirun`
fn mpi_job(name: &str, workers: i32, slots: i32) -> MPIJob {
    let mut spec = MPIJobSpec {
        slots_per_worker: slots,
        ..Default::default()
    };
    spec.mpi_replica_specs.insert(
        ReplicaType::Launcher,
        ReplicaSpec {
            replicas: Some(1),
            template: template("mpioperator/mpi-pi:openmpi", &["mpirun", "-n", "4", "/home/mpiuser/pi"]),
            restart_policy: None,
        },
    );
    spec.mpi_replica_specs.insert(
        ReplicaType::Worker,
        ReplicaSpec {
            replicas: Some(workers),
            template: template("mpioperator/mpi-pi:openmpi", &["/usr/sbin/sshd", "-De"]),
            restart_policy: None,
        },
    );
    MPIJob::new(name, spec)
}

struct Cluster {
    repo: Arc<InMemoryRepository>,
    events: Arc<RecordingEventPublisher>,
    engine: JobEngine,
}

impl Cluster {
    fn new() -> Self {
        let repo = Arc::new(InMemoryRepository::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let engine = JobEngine::new(repo.clone(), events.clone(), EngineConfig::default());
        Self {
            repo,
            events,
            engine,
        }
    }

    fn submit(&self, job: MPIJob) -> JobKey {
        let job = self.repo.insert_job(job);
        JobKey::for_job(&job).expect("submitted job has a namespace")
    }

    async fn reconcile(&self, key: &JobKey) -> JobStage {
        self.engine
            .reconcile(key)
            .await
            .expect("reconcile succeeds")
            .stage
    }

    fn status(&self, key: &JobKey) -> MPIJobStatus {
        self.repo
            .job(key)
            .and_then(|j| j.status)
            .unwrap_or_default()
    }

    fn pod_exists(&self, key: &JobKey, name: &str) -> bool {
        self.repo
            .object(ObjectKind::Pod, &key.namespace, name)
            .is_some()
    }

    fn ready_workers(&self, key: &JobKey, workers: u32) {
        for i in 0..workers {
            self.repo
                .set_pod_ready(&key.namespace, &format!("{}-worker-{i}", key.name));
        }
    }

    /// Reconcile until the launcher exists, readying workers on the way
    async fn launch(&self, key: &JobKey, workers: u32) {
        assert_eq!(self.reconcile(key).await, JobStage::WorkersPending);
        self.ready_workers(key, workers);
        assert_eq!(self.reconcile(key).await, JobStage::WorkersReady);
        assert!(self.pod_exists(key, &format!("{}-launcher", key.name)));
    }

    fn hostfile(&self, key: &JobKey) -> String {
        let object = self
            .repo
            .object(ObjectKind::ConfigMap, &key.namespace, &format!("{}-config", key.name))
            .expect("config map created");
        let OwnedObject::ConfigMap(config_map) = object else {
            panic!("expected a ConfigMap");
        };
        config_map.data.unwrap_or_default()[HOSTFILE_KEY].clone()
    }

    /// Apply a user edit to the stored job spec
    fn edit(&self, key: &JobKey, f: impl FnOnce(&mut MPIJobSpec)) {
        let mut job = self.repo.job(key).expect("job exists");
        f(&mut job.spec);
        self.repo.insert_job(job);
    }

    fn finish_launcher(&self, key: &JobKey, phase: &str, exit_code: i32) {
        self.repo.set_pod_phase(
            &key.namespace,
            &format!("{}-launcher", key.name),
            phase,
            Some(exit_code),
        );
    }
}

fn conditions_of(status: &MPIJobStatus, phase: JobPhase) -> usize {
    status
        .conditions
        .iter()
        .filter(|c| c.type_ == phase.as_str())
        .count()
}

// =============================================================================
// Provisioning
// =============================================================================

/// A two-worker job gets its host list, identity and workers on the first
/// pass, and nothing more until the workers report ready.
#[tokio::test]
async fn story_new_job_gets_hostfile_and_workers() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 2, 2));

    assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersPending);

    let config_map = cluster
        .repo
        .object(ObjectKind::ConfigMap, "default", "train1-config")
        .expect("config map created");
    let OwnedObject::ConfigMap(config_map) = config_map else {
        panic!("expected a ConfigMap");
    };
    assert_eq!(
        config_map.data.unwrap()[HOSTFILE_KEY],
        "train1-worker-0 slots=2\ntrain1-worker-1 slots=2\n"
    );

    for kind in [
        ObjectKind::ServiceAccount,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
        ObjectKind::Secret,
        ObjectKind::Service,
    ] {
        assert_eq!(cluster.repo.objects(kind).len(), 1, "{kind}");
    }
    assert!(cluster.pod_exists(&key, "train1-worker-0"));
    assert!(cluster.pod_exists(&key, "train1-worker-1"));
    assert!(!cluster.pod_exists(&key, "train1-launcher"));

    let status = cluster.status(&key);
    assert_eq!(status.phase, Some(JobPhase::Created));
    assert!(status.start_time.is_some());
    assert_eq!(status.replica_statuses.len(), 2);
    assert_eq!(cluster.events.count(reasons::JOB_CREATED), 1);
}

/// Reconciling an unchanged job again creates nothing and writes nothing.
#[tokio::test]
async fn story_repeated_reconcile_is_idempotent() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 3, 1));

    cluster.reconcile(&key).await;
    cluster.reconcile(&key).await;
    let creates = cluster.repo.create_calls();
    let version = cluster.repo.job(&key).unwrap().metadata.resource_version;

    for _ in 0..3 {
        assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersPending);
    }
    assert_eq!(cluster.repo.create_calls(), creates);
    assert_eq!(cluster.repo.job(&key).unwrap().metadata.resource_version, version);
}

/// The launcher waits until every worker is ready, however many passes it takes.
#[tokio::test]
async fn story_launcher_waits_for_every_worker() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 3, 1));

    cluster.reconcile(&key).await;
    for i in 0..2 {
        cluster
            .repo
            .set_pod_ready("default", &format!("train1-worker-{i}"));
        assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersPending);
        assert!(!cluster.pod_exists(&key, "train1-launcher"));
    }

    cluster.repo.set_pod_ready("default", "train1-worker-2");
    assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersReady);
    assert!(cluster.pod_exists(&key, "train1-launcher"));
}

/// A job whose SSH secret already exists keeps that key material.
#[tokio::test]
async fn story_existing_ssh_secret_is_reused() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 1, 1));

    cluster.reconcile(&key).await;
    let secret = cluster
        .repo
        .object(ObjectKind::Secret, "default", "train1-ssh")
        .unwrap();

    cluster
        .repo
        .delete(ObjectKind::ConfigMap, "default", "train1-config")
        .await
        .unwrap();
    cluster.reconcile(&key).await;

    assert_eq!(
        cluster
            .repo
            .object(ObjectKind::Secret, "default", "train1-ssh")
            .unwrap(),
        secret
    );
    assert!(cluster
        .repo
        .object(ObjectKind::ConfigMap, "default", "train1-config")
        .is_some());
}

/// Resizing the job before launch rewrites the host list and drops workers
/// past the new count, so the host list always names exactly the workers.
#[tokio::test]
async fn story_resized_job_gets_matching_hostfile() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 3, 1));

    assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersPending);
    assert_eq!(cluster.hostfile(&key).lines().count(), 3);

    cluster.edit(&key, |spec| {
        spec.slots_per_worker = 2;
        if let Some(worker) = spec.mpi_replica_specs.get_mut(&ReplicaType::Worker) {
            worker.replicas = Some(1);
        }
    });
    assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersPending);

    assert_eq!(cluster.hostfile(&key), "train1-worker-0 slots=2\n");
    assert!(cluster.pod_exists(&key, "train1-worker-0"));
    assert!(!cluster.pod_exists(&key, "train1-worker-1"));
    assert!(!cluster.pod_exists(&key, "train1-worker-2"));
    assert_eq!(cluster.repo.replace_calls(), 1);

    // Converged: nothing more to rewrite
    cluster.reconcile(&key).await;
    assert_eq!(cluster.repo.replace_calls(), 1);

    cluster.edit(&key, |spec| {
        if let Some(worker) = spec.mpi_replica_specs.get_mut(&ReplicaType::Worker) {
            worker.replicas = Some(2);
        }
    });
    cluster.reconcile(&key).await;
    assert_eq!(
        cluster.hostfile(&key),
        "train1-worker-0 slots=2\ntrain1-worker-1 slots=2\n"
    );
    assert!(cluster.pod_exists(&key, "train1-worker-1"));

    cluster.ready_workers(&key, 2);
    assert_eq!(cluster.reconcile(&key).await, JobStage::WorkersReady);
}

// =============================================================================
// Completion
// =============================================================================

/// Success is recorded once, with a completion time that never moves.
#[tokio::test]
async fn story_successful_job_completes_once() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 2, 1));

    cluster.launch(&key, 2).await;
    cluster.repo.set_pod_ready("default", "train1-launcher");
    assert_eq!(cluster.reconcile(&key).await, JobStage::LauncherRunning);

    cluster.finish_launcher(&key, "Succeeded", 0);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Succeeded);
    let completed = cluster.status(&key).completion_time.expect("completion time set");

    for _ in 0..3 {
        assert_eq!(cluster.reconcile(&key).await, JobStage::Succeeded);
    }
    let status = cluster.status(&key);
    assert_eq!(status.completion_time, Some(completed));
    assert_eq!(conditions_of(&status, JobPhase::Succeeded), 1);
    assert_eq!(cluster.events.count(reasons::JOB_SUCCEEDED), 1);
    let phases: Vec<&str> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(phases, ["Created", "Running", "Succeeded"]);
}

/// Under `Never`, a worker that fails before launch fails the job exactly once.
#[tokio::test]
async fn story_worker_failure_with_never_policy_fails_job() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 2, 1));

    cluster.reconcile(&key).await;
    cluster
        .repo
        .set_pod_phase("default", "train1-worker-1", "Failed", Some(1));

    assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);

    let status = cluster.status(&key);
    assert_eq!(status.phase, Some(JobPhase::Failed));
    assert_eq!(conditions_of(&status, JobPhase::Failed), 1);
    assert_eq!(status.conditions.last().unwrap().reason, reasons::WORKER_FAILED);
    assert_eq!(cluster.events.count(reasons::WORKER_FAILED), 1);
    assert!(!cluster.pod_exists(&key, "train1-launcher"));
}

/// Under `Never`, a worker lost while the launcher runs fails the job exactly
/// once and never schedules another attempt.
#[tokio::test]
async fn story_worker_failure_while_running_with_never_policy_fails_once() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 2, 1));

    cluster.launch(&key, 2).await;
    cluster.repo.set_pod_ready("default", "train1-launcher");
    assert_eq!(cluster.reconcile(&key).await, JobStage::LauncherRunning);

    cluster
        .repo
        .set_pod_phase("default", "train1-worker-0", "Failed", Some(1));
    for _ in 0..3 {
        assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);
    }

    let status = cluster.status(&key);
    assert_eq!(status.restart_count, 0);
    assert_eq!(conditions_of(&status, JobPhase::Failed), 1);
    assert_eq!(conditions_of(&status, JobPhase::Restarting), 0);
    assert_eq!(status.conditions.last().unwrap().reason, reasons::WORKER_FAILED);
    assert_eq!(cluster.events.count(reasons::WORKER_FAILED), 1);
    assert_eq!(cluster.events.count(reasons::JOB_RESTARTING), 0);
    assert!(status.completion_time.is_some());
}

/// `OnFailure` with a backoff limit of k runs the launcher k + 1 times,
/// reusing the same SSH secret on every attempt.
#[tokio::test]
async fn story_on_failure_retries_until_backoff_limit() {
    let cluster = Cluster::new();
    let mut job = mpi_job("train1", 2, 1);
    job.spec.restart_policy = RestartPolicy::OnFailure;
    job.spec.run_policy.backoff_limit = Some(2);
    let key = cluster.submit(job);

    let mut attempts = 0;
    let mut secret = None;
    loop {
        cluster.launch(&key, 2).await;
        attempts += 1;

        let current = cluster
            .repo
            .object(ObjectKind::Secret, "default", "train1-ssh")
            .expect("secret kept across attempts");
        let first = secret.get_or_insert_with(|| current.clone());
        assert_eq!(*first, current);

        cluster.finish_launcher(&key, "Failed", 1);
        match cluster.reconcile(&key).await {
            JobStage::Failed => break,
            stage => assert_eq!(stage, JobStage::Restarting),
        }
        assert!(!cluster.pod_exists(&key, "train1-worker-0"));
        assert!(!cluster.pod_exists(&key, "train1-launcher"));
        assert!(attempts <= 3, "backoff limit not enforced");
    }

    assert_eq!(attempts, 3);
    let status = cluster.status(&key);
    assert_eq!(status.restart_count, 2);
    assert_eq!(status.phase, Some(JobPhase::Failed));
    assert_eq!(conditions_of(&status, JobPhase::Restarting), 2);
    assert_eq!(cluster.events.count(reasons::JOB_RESTARTING), 2);
}

/// `ExitCode` retries signal terminations but not application errors.
#[tokio::test]
async fn story_exit_code_policy_distinguishes_signals() {
    let cluster = Cluster::new();
    let mut job = mpi_job("train1", 1, 1);
    job.spec.restart_policy = RestartPolicy::ExitCode;
    let key = cluster.submit(job);

    cluster.launch(&key, 1).await;
    cluster.finish_launcher(&key, "Failed", 137);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Restarting);

    cluster.launch(&key, 1).await;
    cluster.finish_launcher(&key, "Failed", 2);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);
    assert_eq!(cluster.status(&key).restart_count, 1);
}

// =============================================================================
// Validation and deletion
// =============================================================================

/// A job with zero launchers fails validation and never creates anything.
#[tokio::test]
async fn story_invalid_job_fails_without_resources() {
    let cluster = Cluster::new();
    let mut job = mpi_job("broken", 2, 1);
    if let Some(launcher) = job.spec.mpi_replica_specs.get_mut(&ReplicaType::Launcher) {
        launcher.replicas = Some(0);
    }
    let key = cluster.submit(job);

    assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Failed);

    assert_eq!(cluster.repo.object_count(), 0);
    let status = cluster.status(&key);
    assert_eq!(status.conditions.len(), 1);
    assert_eq!(status.conditions[0].reason, reasons::VALIDATION_FAILED);
    let events = cluster.events.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].warning);
    assert_eq!(events[0].reason, reasons::VALIDATION_FAILED);
}

/// Deleting a job removes everything it owned on the next reconcile.
#[tokio::test]
async fn story_deleted_job_leaves_nothing_behind() {
    let cluster = Cluster::new();
    let key = cluster.submit(mpi_job("train1", 2, 1));
    cluster.launch(&key, 2).await;
    assert!(cluster.repo.object_count() > 0);

    cluster.repo.remove_job(&key);
    assert_eq!(cluster.reconcile(&key).await, JobStage::Removed);
    assert_eq!(cluster.repo.object_count(), 0);

    // Nothing left to do
    assert_eq!(cluster.reconcile(&key).await, JobStage::Removed);
}

/// Jobs in one namespace never touch resources of another job.
#[tokio::test]
async fn story_jobs_are_isolated() {
    let cluster = Cluster::new();
    let first = cluster.submit(mpi_job("train1", 1, 1));
    let second = cluster.submit(mpi_job("train2", 2, 1));

    cluster.reconcile(&first).await;
    cluster.reconcile(&second).await;
    cluster.repo.remove_job(&first);
    cluster.reconcile(&first).await;

    assert!(!cluster.pod_exists(&first, "train1-worker-0"));
    assert!(cluster.pod_exists(&second, "train2-worker-0"));
    assert!(cluster.pod_exists(&second, "train2-worker-1"));
}
