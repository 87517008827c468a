//! MPI Operator - runs MPIJobs as launcher and worker pods

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use mpi_common::telemetry::{init_telemetry, TelemetryConfig};
use mpi_job::controller::{run_sweep_loop, JobContext};
use mpi_job::repository::CachedRepository;
use mpi_operator::config::OperatorConfig;
use mpi_operator::controller_runner::{build_job_controllers, build_object_stores};
use mpi_operator::crds::{crd_yaml, ensure_crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    if config.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    run_controller(config).await
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    ensure_crds(&client).await?;

    let engine_config = config.engine_config();
    tracing::info!(
        gate = ?engine_config.gate,
        concurrency = config.concurrency,
        sweep_interval_secs = config.sweep_interval().as_secs(),
        "Starting MPI operator"
    );

    let (stores, informers) = build_object_stores(&client, config.namespace.as_deref());
    for informer in informers {
        tokio::spawn(informer);
    }
    stores
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("object cache failed to sync: {}", e))?;
    tracing::info!("Object cache synced");

    let repo = Arc::new(CachedRepository::new(client.clone(), stores));
    let ctx = Arc::new(JobContext::from_client(client.clone(), repo, engine_config));
    let controllers = build_job_controllers(client, ctx.clone(), &config);

    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers stopped, shutting down");
        }
        _ = run_sweep_loop(ctx, config.sweep_interval()) => {}
    }

    Ok(())
}
