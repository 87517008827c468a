//! Desired-state construction for worker pods, the launcher pod and the
//! headless worker service
//!
//! Pure functions of the MPIJob. Every object carries the job's labels and a
//! controller ownerReference so it can be traced back to (and swept with)
//! its job.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath, Pod, PodDNSConfig,
    PodSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use mpi_common::crd::{ExecutionTemplate, MPIJob, ReplicaType};
use mpi_common::{
    labels, CONTROLLER_NAME, DEFAULT_CONTAINER_NAME, DEFAULT_PORT, DEFAULT_PORT_NAME,
    FRAMEWORK_NAME,
};
use mpi_volcano::{pod_group_name, GROUP_NAME_ANNOTATION, VOLCANO_SCHEDULER};

use crate::connectivity::{config_map_name, ssh_auth_volume, HOSTFILE_KEY, SSH_AUTH_VOLUME};

/// Directory the launcher's host list is mounted into
pub const CONFIG_MOUNT_DIR: &str = "/etc/mpi";
/// Full path of the host list inside the launcher
pub const HOSTFILE_PATH: &str = "/etc/mpi/hostfile";
/// Env var telling the payload which role it runs as
pub const ROLE_ENV: &str = "K_MPI_JOB_ROLE";

const CONFIG_VOLUME: &str = "mpi-job-config";

/// Knobs that shape built pods but are not part of the job
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// Cluster DNS domain used in the launcher's search path
    pub cluster_domain: String,
    /// Route pods through the Volcano scheduler and its PodGroup
    pub gang_scheduled: bool,
    /// Whether the launcher is a PodGroup member
    pub gang_include_launcher: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.local".to_string(),
            gang_scheduled: false,
            gang_include_launcher: true,
        }
    }
}

pub fn job_name(job: &MPIJob) -> &str {
    job.metadata.name.as_deref().unwrap_or_default()
}

fn job_namespace(job: &MPIJob) -> &str {
    job.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn worker_name(job_name: &str, index: u32) -> String {
    format!("{job_name}-worker-{index}")
}

pub fn launcher_name(job_name: &str) -> String {
    format!("{job_name}-launcher")
}

/// Headless service giving every worker a stable DNS name
pub fn worker_service_name(job_name: &str) -> String {
    format!("{job_name}-worker")
}

/// Names of all desired worker pods, by ordinal
pub fn worker_names(job: &MPIJob) -> Vec<String> {
    (0..job.spec.worker_replicas())
        .map(|i| worker_name(job_name(job), i))
        .collect()
}

/// Labels shared by every object owned by `job_name`
pub fn job_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED_BY.to_string(), CONTROLLER_NAME.to_string()),
        (labels::JOB_NAME.to_string(), job_name.to_string()),
        (labels::FRAMEWORK.to_string(), FRAMEWORK_NAME.to_string()),
    ])
}

fn unit_labels(job_name: &str, role: ReplicaType, index: Option<u32>) -> BTreeMap<String, String> {
    let mut labels = job_labels(job_name);
    labels.insert(labels::JOB_ROLE.to_string(), role.role().to_string());
    if let Some(i) = index {
        labels.insert(labels::REPLICA_INDEX.to_string(), i.to_string());
    }
    labels
}

/// Controller ownerReference pointing at the job
pub fn owner_reference(job: &MPIJob) -> OwnerReference {
    OwnerReference {
        api_version: MPIJob::api_version(&()).to_string(),
        kind: MPIJob::kind(&()).to_string(),
        name: job_name(job).to_string(),
        uid: job.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an object owned by `job`
pub fn object_meta(job: &MPIJob, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(job_namespace(job).to_string()),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(job)]),
        ..Default::default()
    }
}

pub fn build_worker_service(job: &MPIJob) -> Service {
    let name = job_name(job);
    let mut selector = job_labels(name);
    selector.insert(
        labels::JOB_ROLE.to_string(),
        ReplicaType::Worker.role().to_string(),
    );

    Service {
        metadata: object_meta(job, worker_service_name(name), job_labels(name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            // Worker names resolve before the pods report ready
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![ServicePort {
                name: Some(DEFAULT_PORT_NAME.to_string()),
                port: DEFAULT_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// All worker pods, ordered by ordinal
pub fn build_workers(job: &MPIJob, config: &BuildConfig) -> Vec<Pod> {
    (0..job.spec.worker_replicas())
        .map(|i| build_worker(job, config, i))
        .collect()
}

pub fn build_worker(job: &MPIJob, config: &BuildConfig, index: u32) -> Pod {
    let name = job_name(job);
    let pod_name = worker_name(name, index);
    let template = role_template(job, ReplicaType::Worker);

    let container = build_container(
        &template,
        role_env(&template, ReplicaType::Worker, Vec::new()),
        vec![ssh_mount(job)],
    );

    let mut pod = base_pod(
        job,
        config,
        ReplicaType::Worker,
        pod_name.clone(),
        Some(index),
    );
    if let Some(spec) = pod.spec.as_mut() {
        spec.hostname = Some(pod_name);
        spec.subdomain = Some(worker_service_name(name));
        spec.containers = vec![container];
        spec.volumes = Some(vec![ssh_auth_volume(name, false)]);
    }
    pod
}

/// The single launcher pod.
///
/// Reads the host list from `/etc/mpi/hostfile` and resolves short worker
/// names through a DNS search path on the headless worker service.
pub fn build_launcher(job: &MPIJob, config: &BuildConfig) -> Pod {
    let name = job_name(job);
    let template = role_template(job, ReplicaType::Launcher);

    let slots = job.spec.slots().to_string();
    let mpi_env = vec![
        env("OMPI_MCA_orte_default_hostfile", HOSTFILE_PATH),
        env("OMPI_MCA_plm_rsh_args", "-o ConnectionAttempts=10"),
        env("OMPI_MCA_orte_keep_fqdn_hostnames", "true"),
        env("OMPI_MCA_orte_set_default_slots", &slots),
    ];

    let container = build_container(
        &template,
        role_env(&template, ReplicaType::Launcher, mpi_env),
        vec![
            ssh_mount(job),
            VolumeMount {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ],
    );

    let config_volume = Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map_name(name),
            items: Some(vec![KeyToPath {
                key: HOSTFILE_KEY.to_string(),
                path: "hostfile".to_string(),
                mode: Some(0o444),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let search = format!(
        "{}.{}.svc.{}",
        worker_service_name(name),
        job_namespace(job),
        config.cluster_domain
    );

    let mut pod = base_pod(job, config, ReplicaType::Launcher, launcher_name(name), None);
    if let Some(spec) = pod.spec.as_mut() {
        spec.service_account_name = Some(crate::rbac::launcher_service_account_name(name));
        spec.dns_config = Some(PodDNSConfig {
            searches: Some(vec![search]),
            ..Default::default()
        });
        spec.containers = vec![container];
        spec.volumes = Some(vec![ssh_auth_volume(name, true), config_volume]);
    }
    pod
}

fn base_pod(
    job: &MPIJob,
    config: &BuildConfig,
    role: ReplicaType,
    name: String,
    index: Option<u32>,
) -> Pod {
    let mut metadata = object_meta(job, name, unit_labels(job_name(job), role, index));

    let gang_member = config.gang_scheduled
        && (role == ReplicaType::Worker || config.gang_include_launcher);
    if gang_member {
        metadata.annotations = Some(BTreeMap::from([(
            GROUP_NAME_ANNOTATION.to_string(),
            pod_group_name(job_name(job)),
        )]));
    }

    Pod {
        metadata,
        spec: Some(PodSpec {
            // The engine owns restarts; the kubelet never restarts a unit
            restart_policy: Some("Never".to_string()),
            scheduler_name: gang_member.then(|| VOLCANO_SCHEDULER.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn role_template(job: &MPIJob, role: ReplicaType) -> ExecutionTemplate {
    job.spec
        .mpi_replica_specs
        .get(&role)
        .map(|s| s.template.clone())
        .unwrap_or_default()
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Template env first, then operator-provided vars the template does not set
fn role_env(template: &ExecutionTemplate, role: ReplicaType, extra: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = template
        .env
        .iter()
        .map(|(name, value)| env(name, value))
        .collect();

    let operator_vars = std::iter::once(env(ROLE_ENV, role.role())).chain(extra);
    for var in operator_vars {
        if !template.env.contains_key(&var.name) {
            vars.push(var);
        }
    }
    vars
}

fn ssh_mount(job: &MPIJob) -> VolumeMount {
    VolumeMount {
        name: SSH_AUTH_VOLUME.to_string(),
        mount_path: job.spec.ssh_auth_mount_path.clone(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn build_container(
    template: &ExecutionTemplate,
    env: Vec<EnvVar>,
    volume_mounts: Vec<VolumeMount>,
) -> Container {
    let resources = match (
        quantities(&template.resources.requests),
        quantities(&template.resources.limits),
    ) {
        (None, None) => None,
        (requests, limits) => Some(ResourceRequirements {
            requests,
            limits,
            ..Default::default()
        }),
    };

    Container {
        name: DEFAULT_CONTAINER_NAME.to_string(),
        image: Some(template.image.clone()),
        command: (!template.command.is_empty()).then(|| template.command.clone()),
        args: (!template.args.is_empty()).then(|| template.args.clone()),
        env: Some(env),
        resources,
        image_pull_policy: template.image_pull_policy.clone(),
        ports: Some(vec![ContainerPort {
            name: Some(DEFAULT_PORT_NAME.to_string()),
            container_port: DEFAULT_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mpi_common::crd::{MPIJobSpec, ReplicaSpec};

    pub(crate) fn test_job(name: &str, workers: i32) -> MPIJob {
        let template = ExecutionTemplate {
            image: "mpioperator/mpi-pi:openmpi".to_string(),
            command: vec!["mpirun".to_string()],
            args: vec!["/home/mpiuser/pi".to_string()],
            ..Default::default()
        };
        let mut spec = MPIJobSpec::default();
        spec.mpi_replica_specs.insert(
            ReplicaType::Launcher,
            ReplicaSpec {
                replicas: Some(1),
                template: template.clone(),
                restart_policy: None,
            },
        );
        spec.mpi_replica_specs.insert(
            ReplicaType::Worker,
            ReplicaSpec {
                replicas: Some(workers),
                template: ExecutionTemplate {
                    command: vec!["/usr/sbin/sshd".to_string(), "-De".to_string()],
                    args: Vec::new(),
                    ..template
                },
                restart_policy: None,
            },
        );

        let mut job = MPIJob::new(name, spec);
        job.metadata.namespace = Some("default".to_string());
        job.metadata.uid = Some(format!("{name}-uid"));
        job
    }

    fn env_value<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
        pod.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn workers_are_named_by_ordinal() {
        let job = test_job("train1", 3);
        let names: Vec<String> = build_workers(&job, &BuildConfig::default())
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect();
        assert_eq!(
            names,
            vec!["train1-worker-0", "train1-worker-1", "train1-worker-2"]
        );
        assert_eq!(worker_names(&job), names);
    }

    #[test]
    fn zero_workers_builds_nothing() {
        let job = test_job("solo", 0);
        assert!(build_workers(&job, &BuildConfig::default()).is_empty());
    }

    #[test]
    fn worker_exposes_mpi_port_on_mpi_container() {
        let pod = build_worker(&test_job("train1", 1), &BuildConfig::default(), 0);
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(container.name, "mpi");
        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("mpi-port"));
        assert_eq!(port.container_port, 9999);
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.hostname.as_deref(), Some("train1-worker-0"));
        assert_eq!(spec.subdomain.as_deref(), Some("train1-worker"));
    }

    #[test]
    fn worker_carries_role_labels_and_owner() {
        let pod = build_worker(&test_job("train1", 2), &BuildConfig::default(), 1);
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[labels::JOB_ROLE], "worker");
        assert_eq!(labels[labels::REPLICA_INDEX], "1");
        assert_eq!(labels[labels::JOB_NAME], "train1");

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "MPIJob");
        assert_eq!(owner.api_version, "kubeflow.org/v1");
        assert_eq!(owner.uid, "train1-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn ssh_material_is_mounted_read_only() {
        let job = test_job("train1", 1);
        for pod in [
            build_worker(&job, &BuildConfig::default(), 0),
            build_launcher(&job, &BuildConfig::default()),
        ] {
            let container = &pod.spec.as_ref().unwrap().containers[0];
            let mount = container
                .volume_mounts
                .as_ref()
                .unwrap()
                .iter()
                .find(|m| m.name == SSH_AUTH_VOLUME)
                .unwrap();
            assert_eq!(mount.mount_path, "/root/.ssh");
            assert_eq!(mount.read_only, Some(true));
        }
    }

    #[test]
    fn launcher_references_hostfile_and_worker_domain() {
        let mut job = test_job("train1", 2);
        job.spec.slots_per_worker = 4;
        let pod = build_launcher(&job, &BuildConfig::default());

        assert_eq!(pod.metadata.name.as_deref(), Some("train1-launcher"));
        assert_eq!(
            env_value(&pod, "OMPI_MCA_orte_default_hostfile"),
            Some(HOSTFILE_PATH)
        );
        assert_eq!(env_value(&pod, "OMPI_MCA_orte_set_default_slots"), Some("4"));
        assert_eq!(env_value(&pod, ROLE_ENV), Some("launcher"));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("train1-launcher"));
        assert_eq!(
            spec.dns_config.unwrap().searches.unwrap(),
            vec!["train1-worker.default.svc.cluster.local"]
        );
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "mpirun");
    }

    #[test]
    fn template_env_wins_over_operator_env() {
        let mut job = test_job("train1", 1);
        if let Some(launcher) = job.spec.mpi_replica_specs.get_mut(&ReplicaType::Launcher) {
            launcher
                .template
                .env
                .insert("OMPI_MCA_plm_rsh_args".to_string(), "-p 2222".to_string());
        }
        let pod = build_launcher(&job, &BuildConfig::default());
        assert_eq!(env_value(&pod, "OMPI_MCA_plm_rsh_args"), Some("-p 2222"));
        let count = pod.spec.unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .filter(|e| e.name == "OMPI_MCA_plm_rsh_args")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn gang_mode_routes_members_through_volcano() {
        let job = test_job("train1", 1);
        let config = BuildConfig {
            gang_scheduled: true,
            gang_include_launcher: false,
            ..Default::default()
        };

        let worker = build_worker(&job, &config, 0);
        assert_eq!(
            worker.spec.as_ref().unwrap().scheduler_name.as_deref(),
            Some("volcano")
        );
        assert_eq!(
            worker.metadata.annotations.as_ref().unwrap()[GROUP_NAME_ANNOTATION],
            "train1"
        );

        let launcher = build_launcher(&job, &config);
        assert!(launcher.metadata.annotations.is_none());
        assert!(launcher.spec.unwrap().scheduler_name.is_none());
    }

    #[test]
    fn resources_map_to_quantities() {
        let mut job = test_job("train1", 1);
        if let Some(worker) = job.spec.mpi_replica_specs.get_mut(&ReplicaType::Worker) {
            worker
                .template
                .resources
                .limits
                .insert("nvidia.com/gpu".to_string(), "1".to_string());
        }
        let pod = build_worker(&job, &BuildConfig::default(), 0);
        let resources = pod.spec.unwrap().containers[0].resources.clone().unwrap();
        assert_eq!(
            resources.limits.unwrap()["nvidia.com/gpu"],
            Quantity("1".to_string())
        );
        assert!(resources.requests.is_none());
    }

    #[test]
    fn headless_service_selects_workers() {
        let svc = build_worker_service(&test_job("train1", 2));
        assert_eq!(svc.metadata.name.as_deref(), Some("train1-worker"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.selector.unwrap()[labels::JOB_ROLE], "worker");
        assert_eq!(spec.ports.unwrap()[0].port, 9999);
    }
}
