//! Launcher access-control triple: ServiceAccount, Role and RoleBinding
//!
//! The Role only names this job's worker pods, so a launcher can never exec
//! into units of another job.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

use mpi_common::crd::MPIJob;

use crate::builder::{job_labels, job_name, object_meta, worker_names};

pub fn launcher_service_account_name(job_name: &str) -> String {
    format!("{job_name}-launcher")
}

pub fn build_service_account(job: &MPIJob) -> ServiceAccount {
    let name = job_name(job);
    ServiceAccount {
        metadata: object_meta(job, launcher_service_account_name(name), job_labels(name)),
        ..Default::default()
    }
}

/// Role allowing the launcher to find and exec into its own workers.
///
/// With zero workers there is nothing to reach and the Role has no rules.
pub fn build_role(job: &MPIJob) -> Role {
    let name = job_name(job);
    let workers = worker_names(job);

    let rules = if workers.is_empty() {
        Vec::new()
    } else {
        vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                resource_names: Some(workers.clone()),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods/exec".to_string()]),
                resource_names: Some(workers),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]
    };

    Role {
        metadata: object_meta(job, launcher_service_account_name(name), job_labels(name)),
        rules: Some(rules),
    }
}

pub fn build_role_binding(job: &MPIJob) -> RoleBinding {
    let name = job_name(job);
    let sa_name = launcher_service_account_name(name);

    RoleBinding {
        metadata: object_meta(job, sa_name.clone(), job_labels(name)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: sa_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: sa_name,
            namespace: job.metadata.namespace.clone(),
            ..Default::default()
        }]),
    }
}
