//! Orchestration-platform seam.
//!
//! Everything the control plane does to the cluster goes through the
//! [`Cluster`] trait so tests can substitute an in-memory implementation.
//! The object kinds we manage form the [`ManagedObject`] sum type; the
//! generic create-or-replace primitive lives in [`applier`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::{CronJob, Job},
    core::v1::{LimitRange, PersistentVolumeClaim, Pod, ResourceQuota, Secret, Service},
    networking::v1::{Ingress, NetworkPolicy},
};
use kube::api::ObjectMeta;

use crate::error::Result;

pub mod applier;
mod kube_cluster;

pub use applier::{create_if_absent, delete_site_objects, upsert};
pub use kube_cluster::KubeCluster;

/// Namespaced object kinds managed by the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Deployment,
    Service,
    Ingress,
    ResourceQuota,
    LimitRange,
    NetworkPolicy,
    Secret,
    PersistentVolumeClaim,
    CronJob,
    Job,
    Pod,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A typed platform object of one of the [`ObjectKind`]s.
#[derive(Clone, Debug)]
pub enum ManagedObject {
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    ResourceQuota(ResourceQuota),
    LimitRange(LimitRange),
    NetworkPolicy(NetworkPolicy),
    Secret(Secret),
    PersistentVolumeClaim(PersistentVolumeClaim),
    CronJob(CronJob),
    Job(Job),
    Pod(Pod),
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Deployment(_) => ObjectKind::Deployment,
            Self::Service(_) => ObjectKind::Service,
            Self::Ingress(_) => ObjectKind::Ingress,
            Self::ResourceQuota(_) => ObjectKind::ResourceQuota,
            Self::LimitRange(_) => ObjectKind::LimitRange,
            Self::NetworkPolicy(_) => ObjectKind::NetworkPolicy,
            Self::Secret(_) => ObjectKind::Secret,
            Self::PersistentVolumeClaim(_) => ObjectKind::PersistentVolumeClaim,
            Self::CronJob(_) => ObjectKind::CronJob,
            Self::Job(_) => ObjectKind::Job,
            Self::Pod(_) => ObjectKind::Pod,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Ingress(o) => &o.metadata,
            Self::ResourceQuota(o) => &o.metadata,
            Self::LimitRange(o) => &o.metadata,
            Self::NetworkPolicy(o) => &o.metadata,
            Self::Secret(o) => &o.metadata,
            Self::PersistentVolumeClaim(o) => &o.metadata,
            Self::CronJob(o) => &o.metadata,
            Self::Job(o) => &o.metadata,
            Self::Pod(o) => &o.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Self::Deployment(o) => &mut o.metadata,
            Self::Service(o) => &mut o.metadata,
            Self::Ingress(o) => &mut o.metadata,
            Self::ResourceQuota(o) => &mut o.metadata,
            Self::LimitRange(o) => &mut o.metadata,
            Self::NetworkPolicy(o) => &mut o.metadata,
            Self::Secret(o) => &mut o.metadata,
            Self::PersistentVolumeClaim(o) => &mut o.metadata,
            Self::CronJob(o) => &mut o.metadata,
            Self::Job(o) => &mut o.metadata,
            Self::Pod(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    pub fn into_deployment(self) -> Option<Deployment> {
        match self {
            Self::Deployment(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_ingress(self) -> Option<Ingress> {
        match self {
            Self::Ingress(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_secret(self) -> Option<Secret> {
        match self {
            Self::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_pod(self) -> Option<Pod> {
        match self {
            Self::Pod(p) => Some(p),
            _ => None,
        }
    }
}

/// A tenant namespace as seen by the metadata store.
#[derive(Clone, Debug, Default)]
pub struct NamespaceRecord {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
}

/// Narrow contract over the orchestration platform API.
///
/// Implementations must classify "not found": `get*` return `None` and
/// `delete*` succeed when the object is already absent.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Create the namespace if absent. Returns true when it was created.
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>)
        -> Result<bool>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>>;

    /// Apply a batch of annotation changes in one platform call; `None`
    /// values remove the key.
    async fn patch_namespace_annotations(
        &self,
        name: &str,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<NamespaceRecord>>;

    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>>;

    async fn list(
        &self,
        kind: ObjectKind,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>>;

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    /// Replace in place; `obj` must carry the current resourceVersion.
    async fn replace(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()>;

    async fn pod_logs(&self, ns: &str, name: &str) -> Result<String>;
}
