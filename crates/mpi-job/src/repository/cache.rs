//! Watch-fed read cache in front of [`KubeRepository`]
//!
//! Reads of owned objects are served from reflector stores filled by the
//! operator's watches on managed objects; writes and job reads go to the
//! API server. A stale read is harmless to the engine: a missing object is
//! re-created and the `AlreadyExists` absorbed, a deleted one is deleted
//! again and the 404 absorbed.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};

use mpi_common::crd::MPIJob;
use mpi_common::{Error, Result};

use super::{JobKey, KubeRepository, ObjectKind, ObjectSelector, OwnedObject, Repository};

/// Reader side of one store per cached kind
#[derive(Clone)]
pub struct ObjectStores {
    pub service_accounts: Store<ServiceAccount>,
    pub roles: Store<Role>,
    pub role_bindings: Store<RoleBinding>,
    pub secrets: Store<Secret>,
    pub config_maps: Store<ConfigMap>,
    pub services: Store<Service>,
    pub pods: Store<Pod>,
}

impl ObjectStores {
    /// Wait until every store has completed its initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        let unavailable = |kind: &str| Error::unavailable(format!("{kind} cache watch stopped"));
        self.service_accounts
            .wait_until_ready()
            .await
            .map_err(|_| unavailable("ServiceAccount"))?;
        self.roles.wait_until_ready().await.map_err(|_| unavailable("Role"))?;
        self.role_bindings
            .wait_until_ready()
            .await
            .map_err(|_| unavailable("RoleBinding"))?;
        self.secrets.wait_until_ready().await.map_err(|_| unavailable("Secret"))?;
        self.config_maps
            .wait_until_ready()
            .await
            .map_err(|_| unavailable("ConfigMap"))?;
        self.services.wait_until_ready().await.map_err(|_| unavailable("Service"))?;
        self.pods.wait_until_ready().await.map_err(|_| unavailable("Pod"))?;
        Ok(())
    }
}

fn cached_get<K>(store: &Store<K>, namespace: &str, name: &str) -> Option<OwnedObject>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Into<OwnedObject> + 'static,
{
    store
        .get(&ObjectRef::new(name).within(namespace))
        .map(|object| K::clone(&object).into())
}

fn cached_list<K>(store: &Store<K>, selector: &ObjectSelector) -> Vec<OwnedObject>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Into<OwnedObject> + 'static,
{
    store
        .state()
        .into_iter()
        .map(|object| K::clone(&object).into())
        .filter(|object: &OwnedObject| selector.matches(object.namespace(), &object.labels()))
        .collect()
}

/// Repository reading owned objects from watch-fed stores
pub struct CachedRepository {
    api: KubeRepository,
    stores: ObjectStores,
}

impl CachedRepository {
    pub fn new(client: Client, stores: ObjectStores) -> Self {
        Self {
            api: KubeRepository::new(client),
            stores,
        }
    }
}

#[async_trait]
impl Repository for CachedRepository {
    async fn get_job(&self, key: &JobKey) -> Result<Option<MPIJob>> {
        self.api.get_job(key).await
    }

    async fn list_jobs(&self, selector: &ObjectSelector) -> Result<Vec<MPIJob>> {
        self.api.list_jobs(selector).await
    }

    async fn update_job_status(&self, job: &MPIJob) -> Result<MPIJob> {
        self.api.update_job_status(job).await
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.api.delete_job(key).await
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnedObject>> {
        let s = &self.stores;
        Ok(match kind {
            ObjectKind::ServiceAccount => cached_get(&s.service_accounts, namespace, name),
            ObjectKind::Role => cached_get(&s.roles, namespace, name),
            ObjectKind::RoleBinding => cached_get(&s.role_bindings, namespace, name),
            ObjectKind::Secret => cached_get(&s.secrets, namespace, name),
            ObjectKind::ConfigMap => cached_get(&s.config_maps, namespace, name),
            ObjectKind::Service => cached_get(&s.services, namespace, name),
            ObjectKind::Pod => cached_get(&s.pods, namespace, name),
            // Only present in gang mode, read through
            ObjectKind::PodGroup => return self.api.get(kind, namespace, name).await,
        })
    }

    async fn list(&self, kind: ObjectKind, selector: &ObjectSelector) -> Result<Vec<OwnedObject>> {
        let s = &self.stores;
        Ok(match kind {
            ObjectKind::ServiceAccount => cached_list(&s.service_accounts, selector),
            ObjectKind::Role => cached_list(&s.roles, selector),
            ObjectKind::RoleBinding => cached_list(&s.role_bindings, selector),
            ObjectKind::Secret => cached_list(&s.secrets, selector),
            ObjectKind::ConfigMap => cached_list(&s.config_maps, selector),
            ObjectKind::Service => cached_list(&s.services, selector),
            ObjectKind::Pod => cached_list(&s.pods, selector),
            ObjectKind::PodGroup => return self.api.list(kind, selector).await,
        })
    }

    async fn create(&self, object: &OwnedObject) -> Result<OwnedObject> {
        self.api.create(object).await
    }

    async fn replace(&self, object: &OwnedObject) -> Result<OwnedObject> {
        self.api.replace(object).await
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        self.api.delete(kind, namespace, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::tests::test_job;
    use crate::builder::{build_worker, BuildConfig};
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;
    use mpi_common::crd::ReplicaType;

    fn filled(pods: Vec<Pod>) -> Store<Pod> {
        let mut writer = Writer::<Pod>::default();
        for pod in pods {
            writer.apply_watcher_event(&Event::Apply(pod));
        }
        writer.as_reader()
    }

    #[test]
    fn get_looks_up_namespace_and_name() {
        let job = test_job("train1", 2);
        let store = filled(vec![build_worker(&job, &BuildConfig::default(), 1)]);

        let found = cached_get(&store, "default", "train1-worker-1").unwrap();
        assert_eq!(found.kind(), ObjectKind::Pod);
        assert!(cached_get(&store, "research", "train1-worker-1").is_none());
        assert!(cached_get(&store, "default", "train1-worker-0").is_none());
    }

    #[test]
    fn list_applies_the_selector() {
        let job = test_job("train1", 2);
        let other = test_job("train2", 1);
        let store = filled(vec![
            build_worker(&job, &BuildConfig::default(), 0),
            build_worker(&job, &BuildConfig::default(), 1),
            build_worker(&other, &BuildConfig::default(), 0),
        ]);

        let key = JobKey::new("default", "train1");
        assert_eq!(cached_list(&store, &ObjectSelector::for_job(&key)).len(), 2);
        assert_eq!(
            cached_list(&store, &ObjectSelector::for_role(&key, ReplicaType::Launcher)).len(),
            0
        );
        assert_eq!(cached_list(&store, &ObjectSelector::managed(None)).len(), 3);
    }

    #[test]
    fn deleted_object_leaves_the_store() {
        let job = test_job("train1", 1);
        let pod = build_worker(&job, &BuildConfig::default(), 0);
        let mut writer = Writer::<Pod>::default();
        writer.apply_watcher_event(&Event::Apply(pod.clone()));
        let store = writer.as_reader();
        assert!(cached_get(&store, "default", "train1-worker-0").is_some());

        writer.apply_watcher_event(&Event::Delete(pod));
        assert!(cached_get(&store, "default", "train1-worker-0").is_none());
    }
}
