//! Credential objects: tenant-scoped secrets read and written by name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crate::cluster::{upsert, Cluster, ManagedObject, ObjectKind};
use crate::error::Result;
use crate::resources::secrets::{opaque_secret, secret_values};

/// Decoded values of secret `name` in `ns`, `None` when absent.
pub async fn get_values(
    cluster: &dyn Cluster,
    ns: &str,
    name: &str,
) -> Result<Option<BTreeMap<String, String>>> {
    Ok(get_secret(cluster, ns, name)
        .await?
        .map(|secret| secret_values(&secret)))
}

pub async fn get_secret(cluster: &dyn Cluster, ns: &str, name: &str) -> Result<Option<Secret>> {
    Ok(cluster
        .get(ObjectKind::Secret, ns, name)
        .await?
        .and_then(ManagedObject::into_secret))
}

pub async fn exists(cluster: &dyn Cluster, ns: &str, name: &str) -> Result<bool> {
    Ok(cluster.get(ObjectKind::Secret, ns, name).await?.is_some())
}

/// Create or overwrite an opaque secret with exactly `values`.
pub async fn put_values(
    cluster: &dyn Cluster,
    ns: &str,
    name: &str,
    labels: BTreeMap<String, String>,
    values: &BTreeMap<String, String>,
) -> Result<()> {
    debug!(%ns, %name, keys = values.len(), "writing credential");
    upsert(
        cluster,
        &ManagedObject::Secret(opaque_secret(ns, name, labels, values)),
    )
    .await?;
    Ok(())
}

pub async fn put_secret(cluster: &dyn Cluster, secret: Secret) -> Result<()> {
    upsert(cluster, &ManagedObject::Secret(secret)).await?;
    Ok(())
}

/// Delete; absent is success.
pub async fn delete(cluster: &dyn Cluster, ns: &str, name: &str) -> Result<()> {
    debug!(%ns, %name, "deleting credential");
    cluster.delete(ObjectKind::Secret, ns, name).await
}
