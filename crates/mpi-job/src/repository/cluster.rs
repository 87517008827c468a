//! Kubernetes-backed repository

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mpi_common::crd::MPIJob;
use mpi_common::{Error, Result};
use mpi_volcano::{PodGroup, POD_GROUP_KIND};

use super::{JobKey, ObjectKind, ObjectSelector, OwnedObject, Repository};

/// Repository backed by the Kubernetes API server
pub struct KubeRepository {
    client: Client,
}

impl KubeRepository {
    /// Create a repository using the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn scoped<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pod_groups(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = pod_group_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn get_typed<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.scoped::<K>(Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), name, false, e))
    }

    async fn list_typed<K>(&self, selector: &ObjectSelector) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let params = ListParams::default().labels(&selector.to_label_selector());
        let list = self
            .scoped::<K>(selector.namespace.as_deref())
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), "", false, e))?;
        Ok(list.items)
    }

    async fn create_typed<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let meta = object.meta();
        let name = meta.name.as_deref().unwrap_or_default();
        self.scoped::<K>(meta.namespace.as_deref())
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), name, true, e))
    }

    async fn replace_typed<K>(&self, object: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let meta = object.meta();
        let name = meta.name.as_deref().unwrap_or_default();
        self.scoped::<K>(meta.namespace.as_deref())
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), name, false, e))
    }

    async fn delete_typed<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        match self
            .scoped::<K>(Some(namespace))
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube(&K::kind(&()), name, false, e)),
        }
    }
}

/// API resource of the Volcano PodGroup, for dynamic clients and watches
pub fn pod_group_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "scheduling.volcano.sh",
        "v1beta1",
        POD_GROUP_KIND,
    ))
}

fn pod_group_from_dynamic(object: DynamicObject) -> Result<PodGroup> {
    let value = serde_json::to_value(&object)?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(POD_GROUP_KIND, e.to_string()))
}

fn pod_group_to_dynamic(pg: &PodGroup) -> Result<DynamicObject> {
    let value = serde_json::to_value(pg)?;
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(POD_GROUP_KIND, e.to_string()))
}

#[async_trait]
impl Repository for KubeRepository {
    async fn get_job(&self, key: &JobKey) -> Result<Option<MPIJob>> {
        let api: Api<MPIJob> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name)
            .await
            .map_err(|e| Error::from_kube("MPIJob", &key.name, false, e))
    }

    async fn list_jobs(&self, selector: &ObjectSelector) -> Result<Vec<MPIJob>> {
        let api: Api<MPIJob> = match selector.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api
            .list(&ListParams::default().labels(&selector.to_label_selector()))
            .await
            .map_err(|e| Error::from_kube("MPIJob", "", false, e))?;
        Ok(list.items)
    }

    async fn update_job_status(&self, job: &MPIJob) -> Result<MPIJob> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<MPIJob> = Api::namespaced(self.client.clone(), namespace);

        // A resourceVersion in the patch makes the API server reject stale writes
        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": job.metadata.resource_version },
            "status": job.status,
        });

        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&status_patch),
        )
        .await
        .map_err(|e| Error::from_kube("MPIJob", name, false, e))
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        let api: Api<MPIJob> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube("MPIJob", &key.name, false, e)),
        }
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnedObject>> {
        Ok(match kind {
            ObjectKind::ServiceAccount => self
                .get_typed::<ServiceAccount>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::Role => self
                .get_typed::<Role>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::RoleBinding => self
                .get_typed::<RoleBinding>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::Secret => self
                .get_typed::<Secret>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::ConfigMap => self
                .get_typed::<ConfigMap>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::Service => self
                .get_typed::<Service>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::Pod => self
                .get_typed::<Pod>(namespace, name)
                .await?
                .map(OwnedObject::from),
            ObjectKind::PodGroup => {
                let object = self
                    .pod_groups(Some(namespace))
                    .get_opt(name)
                    .await
                    .map_err(|e| Error::from_kube(POD_GROUP_KIND, name, false, e))?;
                match object {
                    Some(o) => Some(OwnedObject::from(pod_group_from_dynamic(o)?)),
                    None => None,
                }
            }
        })
    }

    async fn list(&self, kind: ObjectKind, selector: &ObjectSelector) -> Result<Vec<OwnedObject>> {
        fn wrap<K: Into<OwnedObject>>(items: Vec<K>) -> Vec<OwnedObject> {
            items.into_iter().map(Into::into).collect()
        }

        Ok(match kind {
            ObjectKind::ServiceAccount => wrap(self.list_typed::<ServiceAccount>(selector).await?),
            ObjectKind::Role => wrap(self.list_typed::<Role>(selector).await?),
            ObjectKind::RoleBinding => wrap(self.list_typed::<RoleBinding>(selector).await?),
            ObjectKind::Secret => wrap(self.list_typed::<Secret>(selector).await?),
            ObjectKind::ConfigMap => wrap(self.list_typed::<ConfigMap>(selector).await?),
            ObjectKind::Service => wrap(self.list_typed::<Service>(selector).await?),
            ObjectKind::Pod => wrap(self.list_typed::<Pod>(selector).await?),
            ObjectKind::PodGroup => {
                let params = ListParams::default().labels(&selector.to_label_selector());
                let list = self
                    .pod_groups(selector.namespace.as_deref())
                    .list(&params)
                    .await
                    .map_err(|e| Error::from_kube(POD_GROUP_KIND, "", false, e))?;
                list.items
                    .into_iter()
                    .map(|o| pod_group_from_dynamic(o).map(OwnedObject::from))
                    .collect::<Result<Vec<_>>>()?
            }
        })
    }

    async fn create(&self, object: &OwnedObject) -> Result<OwnedObject> {
        Ok(match object {
            OwnedObject::ServiceAccount(o) => self.create_typed(o).await?.into(),
            OwnedObject::Role(o) => self.create_typed(o).await?.into(),
            OwnedObject::RoleBinding(o) => self.create_typed(o).await?.into(),
            OwnedObject::Secret(o) => self.create_typed(o).await?.into(),
            OwnedObject::ConfigMap(o) => self.create_typed(o).await?.into(),
            OwnedObject::Service(o) => self.create_typed(o).await?.into(),
            OwnedObject::Pod(o) => self.create_typed(o).await?.into(),
            OwnedObject::PodGroup(pg) => {
                let name = pg.metadata.name.as_str();
                let created = self
                    .pod_groups(Some(&pg.metadata.namespace))
                    .create(&PostParams::default(), &pod_group_to_dynamic(pg)?)
                    .await
                    .map_err(|e| Error::from_kube(POD_GROUP_KIND, name, true, e))?;
                pod_group_from_dynamic(created)?.into()
            }
        })
    }

    async fn replace(&self, object: &OwnedObject) -> Result<OwnedObject> {
        Ok(match object {
            OwnedObject::ServiceAccount(o) => self.replace_typed(o).await?.into(),
            OwnedObject::Role(o) => self.replace_typed(o).await?.into(),
            OwnedObject::RoleBinding(o) => self.replace_typed(o).await?.into(),
            OwnedObject::Secret(o) => self.replace_typed(o).await?.into(),
            OwnedObject::ConfigMap(o) => self.replace_typed(o).await?.into(),
            OwnedObject::Service(o) => self.replace_typed(o).await?.into(),
            OwnedObject::Pod(o) => self.replace_typed(o).await?.into(),
            OwnedObject::PodGroup(pg) => {
                let name = pg.metadata.name.as_str();
                let replaced = self
                    .pod_groups(Some(&pg.metadata.namespace))
                    .replace(name, &PostParams::default(), &pod_group_to_dynamic(pg)?)
                    .await
                    .map_err(|e| Error::from_kube(POD_GROUP_KIND, name, false, e))?;
                pod_group_from_dynamic(replaced)?.into()
            }
        })
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::ServiceAccount => self.delete_typed::<ServiceAccount>(namespace, name).await,
            ObjectKind::Role => self.delete_typed::<Role>(namespace, name).await,
            ObjectKind::RoleBinding => self.delete_typed::<RoleBinding>(namespace, name).await,
            ObjectKind::Secret => self.delete_typed::<Secret>(namespace, name).await,
            ObjectKind::ConfigMap => self.delete_typed::<ConfigMap>(namespace, name).await,
            ObjectKind::Service => self.delete_typed::<Service>(namespace, name).await,
            ObjectKind::Pod => self.delete_typed::<Pod>(namespace, name).await,
            ObjectKind::PodGroup => {
                match self
                    .pod_groups(Some(namespace))
                    .delete(name, &DeleteParams::background())
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                    Err(e) => Err(Error::from_kube(POD_GROUP_KIND, name, false, e)),
                }
            }
        }
    }
}
