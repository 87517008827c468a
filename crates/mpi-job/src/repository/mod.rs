//! Object store abstraction used by the reconciliation engine
//!
//! The engine only talks to the cluster through [`Repository`]. Production
//! uses [`CachedRepository`], which reads owned objects from watch-fed
//! stores and writes through [`KubeRepository`]; tests and local runs use
//! [`InMemoryRepository`].
//! Owned resources are the plain `k8s-openapi` types plus the Volcano
//! `PodGroup`, wrapped in [`OwnedObject`] so one trait covers every kind.

mod cache;
mod cluster;
mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
#[cfg(test)]
use mockall::automock;

use mpi_common::crd::{MPIJob, ReplicaType};
use mpi_common::{labels, Result, CONTROLLER_NAME};
use mpi_volcano::PodGroup;

pub use cache::{CachedRepository, ObjectStores};
pub use cluster::{pod_group_resource, KubeRepository};
pub use memory::InMemoryRepository;

/// Identity of one MPIJob: the reconcile key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a stored job; `None` when the job carries no namespace
    pub fn for_job(job: &MPIJob) -> Option<Self> {
        Some(Self::new(
            job.metadata.namespace.as_deref()?,
            job.metadata.name.as_deref()?,
        ))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Every resource kind the controller creates on behalf of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    Secret,
    ConfigMap,
    PodGroup,
    Service,
    Pod,
}

impl ObjectKind {
    /// All kinds, in creation order
    pub const ALL: [ObjectKind; 8] = [
        ObjectKind::ServiceAccount,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
        ObjectKind::Secret,
        ObjectKind::ConfigMap,
        ObjectKind::PodGroup,
        ObjectKind::Service,
        ObjectKind::Pod,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "ServiceAccount",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::PodGroup => "PodGroup",
            Self::Service => "Service",
            Self::Pod => "Pod",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace and label filter for [`Repository::list`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectSelector {
    /// `None` lists across all namespaces
    pub namespace: Option<String>,
    /// Every pair must be present on a matching object
    pub labels: BTreeMap<String, String>,
}

impl ObjectSelector {
    /// Everything in `namespace`, or in every namespace when `None`
    pub fn scoped(namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            labels: BTreeMap::new(),
        }
    }

    /// Everything managed by this controller in `namespace`, or everywhere
    pub fn managed(namespace: Option<&str>) -> Self {
        let mut selector = Self::scoped(namespace);
        selector
            .labels
            .insert(labels::MANAGED_BY.to_string(), CONTROLLER_NAME.to_string());
        selector
    }

    /// Everything owned by one job
    pub fn for_job(key: &JobKey) -> Self {
        let mut selector = Self::managed(Some(&key.namespace));
        selector
            .labels
            .insert(labels::JOB_NAME.to_string(), key.name.clone());
        selector
    }

    /// Execution units of one role of one job
    pub fn for_role(key: &JobKey, role: ReplicaType) -> Self {
        let mut selector = Self::for_job(key);
        selector
            .labels
            .insert(labels::JOB_ROLE.to_string(), role.role().to_string());
        selector
    }

    /// Whether an object with `object_labels` in `namespace` is selected
    pub fn matches(&self, namespace: &str, object_labels: &BTreeMap<String, String>) -> bool {
        if self.namespace.as_deref().is_some_and(|ns| ns != namespace) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| object_labels.get(k) == Some(v))
    }

    /// Kubernetes label selector string (`k=v,k=v`)
    pub fn to_label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A resource owned by an MPIJob
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Secret(Secret),
    ConfigMap(ConfigMap),
    PodGroup(PodGroup),
    Service(Service),
    Pod(Pod),
}

impl OwnedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::ServiceAccount(_) => ObjectKind::ServiceAccount,
            Self::Role(_) => ObjectKind::Role,
            Self::RoleBinding(_) => ObjectKind::RoleBinding,
            Self::Secret(_) => ObjectKind::Secret,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::PodGroup(_) => ObjectKind::PodGroup,
            Self::Service(_) => ObjectKind::Service,
            Self::Pod(_) => ObjectKind::Pod,
        }
    }

    /// Standard object metadata; `None` for the Volcano PodGroup
    pub fn meta(&self) -> Option<&ObjectMeta> {
        match self {
            Self::ServiceAccount(o) => Some(&o.metadata),
            Self::Role(o) => Some(&o.metadata),
            Self::RoleBinding(o) => Some(&o.metadata),
            Self::Secret(o) => Some(&o.metadata),
            Self::ConfigMap(o) => Some(&o.metadata),
            Self::Service(o) => Some(&o.metadata),
            Self::Pod(o) => Some(&o.metadata),
            Self::PodGroup(_) => None,
        }
    }

    pub(crate) fn meta_mut(&mut self) -> Option<&mut ObjectMeta> {
        match self {
            Self::ServiceAccount(o) => Some(&mut o.metadata),
            Self::Role(o) => Some(&mut o.metadata),
            Self::RoleBinding(o) => Some(&mut o.metadata),
            Self::Secret(o) => Some(&mut o.metadata),
            Self::ConfigMap(o) => Some(&mut o.metadata),
            Self::Service(o) => Some(&mut o.metadata),
            Self::Pod(o) => Some(&mut o.metadata),
            Self::PodGroup(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::PodGroup(pg) => &pg.metadata.name,
            _ => self
                .meta()
                .and_then(|m| m.name.as_deref())
                .unwrap_or_default(),
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::PodGroup(pg) => &pg.metadata.namespace,
            _ => self
                .meta()
                .and_then(|m| m.namespace.as_deref())
                .unwrap_or_default(),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        match self {
            Self::PodGroup(pg) => pg.metadata.labels.clone(),
            _ => self
                .meta()
                .and_then(|m| m.labels.clone())
                .unwrap_or_default(),
        }
    }

    /// UID of the controlling owner recorded on the object
    pub fn owner_uid(&self) -> Option<&str> {
        match self {
            Self::PodGroup(pg) => pg
                .metadata
                .owner_references
                .iter()
                .find(|r| r.controller == Some(true))
                .map(|r| r.uid.as_str()),
            _ => self
                .meta()
                .and_then(|m| m.owner_references.as_ref())
                .and_then(|refs| controller_ref(refs))
                .map(|r| r.uid.as_str()),
        }
    }

    /// Job this object was created for: the controlling owner, else the
    /// job-name label
    pub fn owner_key(&self) -> Option<JobKey> {
        let owner_name = match self {
            Self::PodGroup(pg) => pg
                .metadata
                .owner_references
                .iter()
                .find(|r| r.controller == Some(true))
                .map(|r| r.name.clone()),
            _ => self
                .meta()
                .and_then(|m| m.owner_references.as_ref())
                .and_then(|refs| controller_ref(refs))
                .map(|r| r.name.clone()),
        };
        let name = owner_name.or_else(|| self.labels().get(labels::JOB_NAME).cloned())?;
        Some(JobKey::new(self.namespace(), name))
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Self::Pod(pod) => Some(pod),
            _ => None,
        }
    }

    pub fn as_config_map(&self) -> Option<&ConfigMap> {
        match self {
            Self::ConfigMap(cm) => Some(cm),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            Self::Secret(secret) => Some(secret),
            _ => None,
        }
    }

    pub fn as_pod_group(&self) -> Option<&PodGroup> {
        match self {
            Self::PodGroup(pg) => Some(pg),
            _ => None,
        }
    }
}

fn controller_ref(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|r| r.controller == Some(true))
}

macro_rules! owned_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for OwnedObject {
                fn from(object: $variant) -> Self {
                    OwnedObject::$variant(object)
                }
            }
        )*
    };
}

owned_from!(ServiceAccount, Role, RoleBinding, Secret, ConfigMap, PodGroup, Service, Pod);

/// Cluster object store as seen by the engine
///
/// Deleting an object that does not exist succeeds. Creating an object that
/// already exists fails with `AlreadyExists`; callers absorb it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fetch one job; `None` when it does not exist
    async fn get_job(&self, key: &JobKey) -> Result<Option<MPIJob>>;

    /// Jobs matching `selector`
    async fn list_jobs(&self, selector: &ObjectSelector) -> Result<Vec<MPIJob>>;

    /// Write `job.status`, guarded by `job.metadata.resourceVersion`.
    ///
    /// Returns the stored job. A stale resource version fails with `Conflict`.
    async fn update_job_status(&self, job: &MPIJob) -> Result<MPIJob>;

    /// Remove the job itself (TTL expiry)
    async fn delete_job(&self, key: &JobKey) -> Result<()>;

    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str)
        -> Result<Option<OwnedObject>>;

    async fn list(&self, kind: ObjectKind, selector: &ObjectSelector) -> Result<Vec<OwnedObject>>;

    async fn create(&self, object: &OwnedObject) -> Result<OwnedObject>;

    /// Overwrite an existing object with `object`
    async fn replace(&self, object: &OwnedObject) -> Result<OwnedObject>;

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;
}
