//! Production [`Cluster`] backed by `kube::Api`.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::{CronJob, Job},
    core::v1::{
        LimitRange, Namespace, PersistentVolumeClaim, Pod, ResourceQuota, Secret, Service,
    },
    networking::v1::{Ingress, NetworkPolicy},
};
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{is_not_found, Result};

use super::{Cluster, ManagedObject, NamespaceRecord, ObjectKind};

/// Field manager name used for patches.
pub const FIELD_MANAGER: &str = "tenant-plane";

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), ns)
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn list_labelled<K>(api: Api<K>, selector: &str) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    let lp = if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    };
    Ok(api.list(&lp).await?.items)
}

async fn create_one<K>(api: Api<K>, obj: &K) -> Result<K>
where
    K: Clone + Serialize + DeserializeOwned + Debug,
{
    Ok(api.create(&PostParams::default(), obj).await?)
}

async fn replace_one<K>(api: Api<K>, name: &str, obj: &K) -> Result<K>
where
    K: Clone + Serialize + DeserializeOwned + Debug,
{
    Ok(api.replace(name, &PostParams::default(), obj).await?)
}

async fn delete_quiet<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn namespace_record(ns: Namespace) -> NamespaceRecord {
    NamespaceRecord {
        name: ns.metadata.name.unwrap_or_default(),
        annotations: ns.metadata.annotations.unwrap_or_default(),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(false);
        }
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(%name, "created namespace");
                Ok(true)
            }
            // Lost a creation race: the namespace exists, which is all we need.
            Err(kube::Error::Api(ref e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        delete_quiet(Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.map(namespace_record))
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "annotations": changes } });
        debug!(%name, keys = changes.len(), "patching namespace annotations");
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<NamespaceRecord>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(list_labelled(api, label_selector)
            .await?
            .into_iter()
            .map(namespace_record)
            .collect())
    }

    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>> {
        use ManagedObject as M;
        Ok(match kind {
            ObjectKind::Deployment => get_opt(self.api::<Deployment>(ns), name).await?.map(M::Deployment),
            ObjectKind::Service => get_opt(self.api::<Service>(ns), name).await?.map(M::Service),
            ObjectKind::Ingress => get_opt(self.api::<Ingress>(ns), name).await?.map(M::Ingress),
            ObjectKind::ResourceQuota => get_opt(self.api::<ResourceQuota>(ns), name)
                .await?
                .map(M::ResourceQuota),
            ObjectKind::LimitRange => get_opt(self.api::<LimitRange>(ns), name).await?.map(M::LimitRange),
            ObjectKind::NetworkPolicy => get_opt(self.api::<NetworkPolicy>(ns), name)
                .await?
                .map(M::NetworkPolicy),
            ObjectKind::Secret => get_opt(self.api::<Secret>(ns), name).await?.map(M::Secret),
            ObjectKind::PersistentVolumeClaim => get_opt(self.api::<PersistentVolumeClaim>(ns), name)
                .await?
                .map(M::PersistentVolumeClaim),
            ObjectKind::CronJob => get_opt(self.api::<CronJob>(ns), name).await?.map(M::CronJob),
            ObjectKind::Job => get_opt(self.api::<Job>(ns), name).await?.map(M::Job),
            ObjectKind::Pod => get_opt(self.api::<Pod>(ns), name).await?.map(M::Pod),
        })
    }

    async fn list(
        &self,
        kind: ObjectKind,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>> {
        use ManagedObject as M;
        let sel = label_selector;
        Ok(match kind {
            ObjectKind::Deployment => list_labelled(self.api::<Deployment>(ns), sel)
                .await?
                .into_iter()
                .map(M::Deployment)
                .collect(),
            ObjectKind::Service => list_labelled(self.api::<Service>(ns), sel)
                .await?
                .into_iter()
                .map(M::Service)
                .collect(),
            ObjectKind::Ingress => list_labelled(self.api::<Ingress>(ns), sel)
                .await?
                .into_iter()
                .map(M::Ingress)
                .collect(),
            ObjectKind::ResourceQuota => list_labelled(self.api::<ResourceQuota>(ns), sel)
                .await?
                .into_iter()
                .map(M::ResourceQuota)
                .collect(),
            ObjectKind::LimitRange => list_labelled(self.api::<LimitRange>(ns), sel)
                .await?
                .into_iter()
                .map(M::LimitRange)
                .collect(),
            ObjectKind::NetworkPolicy => list_labelled(self.api::<NetworkPolicy>(ns), sel)
                .await?
                .into_iter()
                .map(M::NetworkPolicy)
                .collect(),
            ObjectKind::Secret => list_labelled(self.api::<Secret>(ns), sel)
                .await?
                .into_iter()
                .map(M::Secret)
                .collect(),
            ObjectKind::PersistentVolumeClaim => {
                list_labelled(self.api::<PersistentVolumeClaim>(ns), sel)
                    .await?
                    .into_iter()
                    .map(M::PersistentVolumeClaim)
                    .collect()
            }
            ObjectKind::CronJob => list_labelled(self.api::<CronJob>(ns), sel)
                .await?
                .into_iter()
                .map(M::CronJob)
                .collect(),
            ObjectKind::Job => list_labelled(self.api::<Job>(ns), sel)
                .await?
                .into_iter()
                .map(M::Job)
                .collect(),
            ObjectKind::Pod => list_labelled(self.api::<Pod>(ns), sel)
                .await?
                .into_iter()
                .map(M::Pod)
                .collect(),
        })
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        use ManagedObject as M;
        let ns = obj.namespace();
        Ok(match obj {
            M::Deployment(o) => M::Deployment(create_one(self.api(ns), o).await?),
            M::Service(o) => M::Service(create_one(self.api(ns), o).await?),
            M::Ingress(o) => M::Ingress(create_one(self.api(ns), o).await?),
            M::ResourceQuota(o) => M::ResourceQuota(create_one(self.api(ns), o).await?),
            M::LimitRange(o) => M::LimitRange(create_one(self.api(ns), o).await?),
            M::NetworkPolicy(o) => M::NetworkPolicy(create_one(self.api(ns), o).await?),
            M::Secret(o) => M::Secret(create_one(self.api(ns), o).await?),
            M::PersistentVolumeClaim(o) => {
                M::PersistentVolumeClaim(create_one(self.api(ns), o).await?)
            }
            M::CronJob(o) => M::CronJob(create_one(self.api(ns), o).await?),
            M::Job(o) => M::Job(create_one(self.api(ns), o).await?),
            M::Pod(o) => M::Pod(create_one(self.api(ns), o).await?),
        })
    }

    async fn replace(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        use ManagedObject as M;
        let (ns, name) = (obj.namespace(), obj.name());
        Ok(match obj {
            M::Deployment(o) => M::Deployment(replace_one(self.api(ns), name, o).await?),
            M::Service(o) => M::Service(replace_one(self.api(ns), name, o).await?),
            M::Ingress(o) => M::Ingress(replace_one(self.api(ns), name, o).await?),
            M::ResourceQuota(o) => M::ResourceQuota(replace_one(self.api(ns), name, o).await?),
            M::LimitRange(o) => M::LimitRange(replace_one(self.api(ns), name, o).await?),
            M::NetworkPolicy(o) => M::NetworkPolicy(replace_one(self.api(ns), name, o).await?),
            M::Secret(o) => M::Secret(replace_one(self.api(ns), name, o).await?),
            M::PersistentVolumeClaim(o) => {
                M::PersistentVolumeClaim(replace_one(self.api(ns), name, o).await?)
            }
            M::CronJob(o) => M::CronJob(replace_one(self.api(ns), name, o).await?),
            M::Job(o) => M::Job(replace_one(self.api(ns), name, o).await?),
            M::Pod(o) => M::Pod(replace_one(self.api(ns), name, o).await?),
        })
    }

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::Deployment => delete_quiet(self.api::<Deployment>(ns), name).await,
            ObjectKind::Service => delete_quiet(self.api::<Service>(ns), name).await,
            ObjectKind::Ingress => delete_quiet(self.api::<Ingress>(ns), name).await,
            ObjectKind::ResourceQuota => delete_quiet(self.api::<ResourceQuota>(ns), name).await,
            ObjectKind::LimitRange => delete_quiet(self.api::<LimitRange>(ns), name).await,
            ObjectKind::NetworkPolicy => delete_quiet(self.api::<NetworkPolicy>(ns), name).await,
            ObjectKind::Secret => delete_quiet(self.api::<Secret>(ns), name).await,
            ObjectKind::PersistentVolumeClaim => {
                delete_quiet(self.api::<PersistentVolumeClaim>(ns), name).await
            }
            ObjectKind::CronJob => delete_quiet(self.api::<CronJob>(ns), name).await,
            ObjectKind::Job => delete_quiet(self.api::<Job>(ns), name).await,
            ObjectKind::Pod => delete_quiet(self.api::<Pod>(ns), name).await,
        }
    }

    async fn pod_logs(&self, ns: &str, name: &str) -> Result<String> {
        Ok(self.api::<Pod>(ns).logs(name, &LogParams::default()).await?)
    }
}
