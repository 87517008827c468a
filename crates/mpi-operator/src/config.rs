use std::time::Duration;

use clap::{Parser, ValueEnum};

use mpi_job::{EngineConfig, SchedulingGate};

/// How workers are admitted before the launcher starts
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GangScheduling {
    /// Wait for every worker to report ready
    #[default]
    None,
    /// Also require an admitted Volcano PodGroup
    Volcano,
}

/// MPI operator - runs MPIJobs on Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(name = "mpi-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print the MPIJob CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// Only watch MPIJobs in this namespace
    #[arg(long, env = "MPI_OPERATOR_NAMESPACE")]
    pub namespace: Option<String>,

    /// Scheduling gate mode
    #[arg(long, env = "MPI_OPERATOR_GANG_SCHEDULING", value_enum, default_value_t = GangScheduling::None)]
    pub gang_scheduling: GangScheduling,

    /// Count the launcher as a PodGroup member
    #[arg(
        long,
        env = "MPI_OPERATOR_GANG_INCLUDE_LAUNCHER",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub gang_include_launcher: bool,

    /// Jobs reconciled concurrently
    #[arg(long, env = "MPI_OPERATOR_CONCURRENCY", default_value_t = 8)]
    pub concurrency: u16,

    /// Cluster DNS domain
    #[arg(long, env = "MPI_OPERATOR_CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Seconds between orphan sweeps
    #[arg(long, env = "MPI_OPERATOR_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl OperatorConfig {
    /// Scheduling gate selected by the flags
    pub fn gate(&self) -> SchedulingGate {
        match self.gang_scheduling {
            GangScheduling::None => SchedulingGate::Readiness,
            GangScheduling::Volcano => SchedulingGate::Gang {
                include_launcher: self.gang_include_launcher,
            },
        }
    }

    /// Engine settings derived from the flags
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cluster_domain: self.cluster_domain.clone(),
            gate: self.gate(),
            namespace: self.namespace.clone(),
            ..Default::default()
        }
    }

    /// Period of the orphan sweep, at least one second
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
