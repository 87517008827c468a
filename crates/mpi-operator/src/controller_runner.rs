//! Controller runner - builds the MPIJob controller future and the watches
//! that feed the engine's object cache
//!
//! The controller watches MPIJobs plus every resource kind a job owns, so a
//! pod phase change or a deleted config map re-triggers the owning job. In
//! gang mode the Volcano PodGroup is watched too, so admission is seen
//! without waiting for the next requeue.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, reflector};
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use mpi_common::crd::MPIJob;
use mpi_common::{labels, CONTROLLER_NAME};
use mpi_job::controller::{error_policy, reconcile, JobContext};
use mpi_job::repository::{pod_group_resource, ObjectStores};

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Owned resources are filtered to those this operator manages
fn owned_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .labels(&format!("{}={}", labels::MANAGED_BY, CONTROLLER_NAME))
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Long-running future that keeps one cache store in sync
pub type Informer = Pin<Box<dyn Future<Output = ()> + Send>>;

fn informer<K>(client: &Client, namespace: Option<&str>, informers: &mut Vec<Informer>) -> reflector::Store<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = reflector::store();
    let watch = reflector(
        writer,
        watcher(scoped_api::<K>(client, namespace), owned_watcher_config()),
    )
    .default_backoff()
    .for_each(|event| {
        if let Err(e) = event {
            tracing::warn!(kind = %K::kind(&()), error = %e, "object cache watch failed");
        }
        std::future::ready(())
    });
    informers.push(Box::pin(watch));
    reader
}

/// Build the object stores the engine reads from, plus the watches that
/// fill them. The stores stay empty until the informers are polled.
pub fn build_object_stores(client: &Client, namespace: Option<&str>) -> (ObjectStores, Vec<Informer>) {
    let mut informers = Vec::new();
    let stores = ObjectStores {
        service_accounts: informer(client, namespace, &mut informers),
        roles: informer(client, namespace, &mut informers),
        role_bindings: informer(client, namespace, &mut informers),
        secrets: informer(client, namespace, &mut informers),
        config_maps: informer(client, namespace, &mut informers),
        services: informer(client, namespace, &mut informers),
        pods: informer(client, namespace, &mut informers),
    };
    (stores, informers)
}

/// Build the MPIJob controller future
pub fn build_job_controllers(
    client: Client,
    ctx: Arc<JobContext>,
    config: &OperatorConfig,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let namespace = config.namespace.as_deref();
    let jobs: Api<MPIJob> = scoped_api(&client, namespace);

    match namespace {
        Some(ns) => tracing::info!(namespace = %ns, "- MPIJob controller"),
        None => tracing::info!("- MPIJob controller (all namespaces)"),
    }

    let mut controller = Controller::new(jobs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(scoped_api::<Pod>(&client, namespace), owned_watcher_config())
        .owns(scoped_api::<Service>(&client, namespace), owned_watcher_config())
        .owns(scoped_api::<ConfigMap>(&client, namespace), owned_watcher_config())
        .owns(scoped_api::<Secret>(&client, namespace), owned_watcher_config())
        .owns(
            scoped_api::<ServiceAccount>(&client, namespace),
            owned_watcher_config(),
        )
        .owns(scoped_api::<Role>(&client, namespace), owned_watcher_config())
        .owns(
            scoped_api::<RoleBinding>(&client, namespace),
            owned_watcher_config(),
        );

    if config.gate().is_gang() {
        let ar = pod_group_resource();
        let pod_groups: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        };
        tracing::info!("- watching Volcano PodGroups");
        controller = controller.owns_with(pod_groups, ar, owned_watcher_config());
    }

    let controller = controller
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("MPIJob"));

    vec![Box::pin(controller)]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
