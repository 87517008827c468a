//! MPIJob CRD types
//!
//! Defines `MPIJob`, a distributed MPI run made of exactly one Launcher and
//! zero or more Workers. The launcher reaches workers over SSH using a host
//! list generated by the operator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// Default mount path of the SSH auth material inside every unit
pub const DEFAULT_SSH_AUTH_MOUNT_PATH: &str = "/root/.ssh";

/// Backoff limit applied when `runPolicy.backoffLimit` is not set
pub const DEFAULT_BACKOFF_LIMIT: u32 = 6;

// =============================================================================
// Phase
// =============================================================================

/// Externally visible phase of an MPIJob.
///
/// Each phase doubles as a condition type; the phase is the type of the
/// newest phase condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum JobPhase {
    /// Owned resources are being provisioned
    Created,
    /// Launcher is running
    Running,
    /// A failed attempt is being torn down before the next one
    Restarting,
    /// Launcher completed successfully
    Succeeded,
    /// Job failed terminally
    Failed,
}

impl JobPhase {
    /// All phases, in lifecycle order
    pub const ALL: [JobPhase; 5] = [
        JobPhase::Created,
        JobPhase::Running,
        JobPhase::Restarting,
        JobPhase::Succeeded,
        JobPhase::Failed,
    ];

    /// Whether no further transitions happen from this phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Parse a condition type back into a phase
    pub fn from_condition_type(type_: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == type_)
    }

    /// Condition type string for this phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Restarting => "Restarting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RestartPolicy
// =============================================================================

/// How failures of a role are handled
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Any failure is terminal
    #[default]
    Never,
    /// Failures are retried until the backoff limit is reached
    OnFailure,
    /// Signal terminations (exit code >= 128) are retried, other exit codes are terminal
    ExitCode,
}

impl RestartPolicy {
    /// Whether a unit that exited with `exit_code` may be retried under this policy
    pub fn allows_retry(&self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure => true,
            Self::ExitCode => exit_code.map(is_retryable_exit_code).unwrap_or(false),
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::OnFailure => write!(f, "OnFailure"),
            Self::ExitCode => write!(f, "ExitCode"),
        }
    }
}

/// Exit codes 128 and above are terminations by signal (OOM kill, preemption)
pub fn is_retryable_exit_code(code: i32) -> bool {
    code >= 128
}

/// Which execution units are removed once a job reaches a terminal phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanPodPolicy {
    /// Remove every unit
    All,
    /// Remove units that are still active
    #[default]
    Running,
    /// Keep all units
    None,
}

// =============================================================================
// Replica specs
// =============================================================================

/// Role of an execution unit within an MPIJob
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ReplicaType {
    /// The single unit that runs `mpirun`
    Launcher,
    /// A participant reached by the launcher over SSH
    Worker,
}

impl ReplicaType {
    /// Lower-case role name used in labels and unit names
    pub fn role(&self) -> &'static str {
        match self {
            Self::Launcher => "launcher",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launcher => write!(f, "Launcher"),
            Self::Worker => write!(f, "Worker"),
        }
    }
}

/// Container resource requests and limits (quantity strings)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ResourceRequirements {
    /// Requested quantities, e.g. `cpu: "2"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Limits, e.g. `nvidia.com/gpu: "1"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// What runs inside a role's execution units
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTemplate {
    /// Container image
    pub image: String,

    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Desired state of one role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of units; Launcher defaults to 1, Worker to 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Execution template for every unit of this role
    pub template: ExecutionTemplate,

    /// Per-role override of the job restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

/// Gang scheduling hints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Override of the grouping record's minimum member count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,

    /// Scheduler queue name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    /// Priority class applied to the grouping record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
}

/// Policies governing a job's runtime behavior
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Units removed after the job finishes
    #[serde(default)]
    pub clean_pod_policy: CleanPodPolicy,

    /// Delete the job this many seconds after it finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Wall-clock bound on one attempt, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Number of restarts allowed before the job fails terminally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Gang scheduling hints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
}

fn default_slots() -> i32 {
    1
}

fn default_ssh_auth_mount_path() -> String {
    DEFAULT_SSH_AUTH_MOUNT_PATH.to_string()
}

// =============================================================================
// CRD
// =============================================================================

/// Distributed MPI job
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "MPIJob",
    plural = "mpijobs",
    singular = "mpijob",
    namespaced,
    status = "MPIJobStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Restarts","type":"integer","jsonPath":".status.restartCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobSpec {
    /// Execution slots advertised for every worker in the host list
    #[serde(default = "default_slots")]
    pub slots_per_worker: i32,

    /// Job-level restart policy
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Runtime policies
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Role specs keyed by `Launcher` / `Worker`
    #[serde(default)]
    pub mpi_replica_specs: BTreeMap<ReplicaType, ReplicaSpec>,

    /// Where the SSH auth material is mounted in every unit
    #[serde(default = "default_ssh_auth_mount_path")]
    pub ssh_auth_mount_path: String,
}

impl Default for MPIJobSpec {
    fn default() -> Self {
        Self {
            slots_per_worker: default_slots(),
            restart_policy: RestartPolicy::default(),
            run_policy: RunPolicy::default(),
            mpi_replica_specs: BTreeMap::new(),
            ssh_auth_mount_path: default_ssh_auth_mount_path(),
        }
    }
}

impl MPIJobSpec {
    /// Launcher role spec, if declared
    pub fn launcher(&self) -> Option<&ReplicaSpec> {
        self.mpi_replica_specs.get(&ReplicaType::Launcher)
    }

    /// Worker role spec, if declared
    pub fn worker(&self) -> Option<&ReplicaSpec> {
        self.mpi_replica_specs.get(&ReplicaType::Worker)
    }

    /// Declared launcher replicas (defaults to 1)
    pub fn launcher_replicas(&self) -> i32 {
        self.launcher().and_then(|s| s.replicas).unwrap_or(1)
    }

    /// Declared worker replicas (defaults to 0, negative values clamp to 0)
    pub fn worker_replicas(&self) -> u32 {
        self.worker()
            .and_then(|s| s.replicas)
            .map(|r| r.max(0) as u32)
            .unwrap_or(0)
    }

    /// Slots per worker as an unsigned count
    pub fn slots(&self) -> u32 {
        self.slots_per_worker.max(1) as u32
    }

    /// Effective restart policy for a role
    pub fn restart_policy_for(&self, role: ReplicaType) -> RestartPolicy {
        self.mpi_replica_specs
            .get(&role)
            .and_then(|s| s.restart_policy)
            .unwrap_or(self.restart_policy)
    }

    /// Restarts allowed before terminal failure
    pub fn backoff_limit(&self) -> u32 {
        self.run_policy
            .backoff_limit
            .map(|b| b.max(0) as u32)
            .unwrap_or(DEFAULT_BACKOFF_LIMIT)
    }

    /// Validate a spec that can never converge.
    ///
    /// Checked before any resource is created; failures are terminal.
    pub fn validate(&self, job: &str) -> Result<(), Error> {
        let Some(launcher) = self.launcher() else {
            return Err(Error::validation_for_field(
                job,
                "spec.mpiReplicaSpecs.Launcher",
                "launcher replica spec is required",
            ));
        };

        let launcher_replicas = self.launcher_replicas();
        if launcher_replicas != 1 {
            return Err(Error::validation_for_field(
                job,
                "spec.mpiReplicaSpecs.Launcher.replicas",
                format!("launcher replicas must be exactly 1, got {launcher_replicas}"),
            ));
        }

        if launcher.template.image.is_empty() {
            return Err(Error::validation_for_field(
                job,
                "spec.mpiReplicaSpecs.Launcher.template.image",
                "launcher image is required",
            ));
        }

        if let Some(worker) = self.worker() {
            if worker.replicas.is_some_and(|r| r < 0) {
                return Err(Error::validation_for_field(
                    job,
                    "spec.mpiReplicaSpecs.Worker.replicas",
                    "worker replicas must not be negative",
                ));
            }
            if self.worker_replicas() > 0 && worker.template.image.is_empty() {
                return Err(Error::validation_for_field(
                    job,
                    "spec.mpiReplicaSpecs.Worker.template.image",
                    "worker image is required",
                ));
            }
        }

        if self.slots_per_worker < 1 {
            return Err(Error::validation_for_field(
                job,
                "spec.slotsPerWorker",
                "slotsPerWorker must be at least 1",
            ));
        }

        if self.run_policy.backoff_limit.is_some_and(|b| b < 0) {
            return Err(Error::validation_for_field(
                job,
                "spec.runPolicy.backoffLimit",
                "backoffLimit must not be negative",
            ));
        }

        if self
            .run_policy
            .active_deadline_seconds
            .is_some_and(|d| d <= 0)
        {
            return Err(Error::validation_for_field(
                job,
                "spec.runPolicy.activeDeadlineSeconds",
                "activeDeadlineSeconds must be positive",
            ));
        }

        Ok(())
    }
}

/// Unit counts of one role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ReplicaStatus {
    /// Units pending or running
    #[serde(default)]
    pub active: u32,
    /// Units that exited successfully
    #[serde(default)]
    pub succeeded: u32,
    /// Units that failed
    #[serde(default)]
    pub failed: u32,
}

/// Status of an MPIJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MPIJobStatus {
    /// Type of the newest phase condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<JobPhase>,

    /// Append-only condition history, newest last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Unit counts per role
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_statuses: BTreeMap<ReplicaType, ReplicaStatus>,

    /// When the job was first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the job first reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Number of restarts performed so far
    #[serde(default)]
    pub restart_count: u32,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MPIJobStatus {
    /// Whether the job reached Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        self.phase.is_some_and(|p| p.is_terminal())
    }
}

// =============================================================================
// Tests
// =============================================================================
