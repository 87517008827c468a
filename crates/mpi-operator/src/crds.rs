//! CRD installation utilities
//!
//! The operator installs its own CRD on startup using server-side apply, so
//! the installed schema always matches the operator version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use mpi_common::crd::MPIJob;
use mpi_common::retry::{retry_with_backoff, RetryConfig};
use mpi_common::CONTROLLER_NAME;

/// Name of the MPIJob CRD object
pub const MPIJOB_CRD_NAME: &str = "mpijobs.kubeflow.org";

/// Render the MPIJob CRD as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&MPIJob::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Install or update the MPIJob CRD, retrying transient API failures
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();
    let crd = MPIJob::crd();
    let patch = Patch::Apply(&crd);

    tracing::info!("Installing {} CRD...", MPIJOB_CRD_NAME);
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install_mpijob_crd",
        || crds.patch(MPIJOB_CRD_NAME, &params, &patch),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", MPIJOB_CRD_NAME, e))?;
    tracing::info!("MPIJob CRD installed/updated");

    Ok(())
}
