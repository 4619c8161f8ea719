//! Idempotent create-or-replace over the [`Cluster`] seam.

use tracing::debug;

use crate::error::Result;

use super::{Cluster, ManagedObject, ObjectKind};

/// Kinds carrying the `site-slug` label that a site delete sweeps away.
pub const SITE_SCOPED_KINDS: [ObjectKind; 6] = [
    ObjectKind::Deployment,
    ObjectKind::Service,
    ObjectKind::Ingress,
    ObjectKind::Secret,
    ObjectKind::CronJob,
    ObjectKind::Job,
];

/// Attempts made by [`upsert`] when a concurrent writer wins the race.
const UPSERT_ATTEMPTS: usize = 3;

/// Read by name; create when absent, otherwise replace in place carrying the
/// live resourceVersion. A platform 409 from a concurrent writer is retried
/// against a fresh read; after the last attempt the conflict is returned.
pub async fn upsert(cluster: &dyn Cluster, obj: &ManagedObject) -> Result<ManagedObject> {
    let mut attempt = 1;
    loop {
        match upsert_once(cluster, obj).await {
            Err(e) if e.is_retryable() && attempt < UPSERT_ATTEMPTS => {
                debug!(kind = %obj.kind(), name = %obj.name(), attempt, "upsert raced, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn upsert_once(cluster: &dyn Cluster, obj: &ManagedObject) -> Result<ManagedObject> {
    let kind = obj.kind();
    let (ns, name) = (obj.namespace(), obj.name());
    match cluster.get(kind, ns, name).await? {
        None => {
            debug!(%kind, %ns, %name, "creating object");
            cluster.create(obj).await
        }
        Some(existing) => {
            debug!(%kind, %ns, %name, "replacing object");
            let mut desired = obj.clone();
            desired.meta_mut().resource_version = existing.meta().resource_version.clone();
            cluster.replace(&desired).await
        }
    }
}

/// Delete every object of `kind` in `ns` matching the label selector.
pub async fn delete_labelled(
    cluster: &dyn Cluster,
    kind: ObjectKind,
    ns: &str,
    label_selector: &str,
) -> Result<usize> {
    let objs = cluster.list(kind, ns, label_selector).await?;
    for obj in &objs {
        cluster.delete(kind, ns, obj.name()).await?;
    }
    Ok(objs.len())
}

/// Delete every site-scoped object carrying the site's labels.
pub async fn delete_site_objects(cluster: &dyn Cluster, ns: &str, slug: &str) -> Result<usize> {
    let selector = crate::resources::site_selector(slug);
    let mut removed = 0;
    for kind in SITE_SCOPED_KINDS {
        removed += delete_labelled(cluster, kind, ns, &selector).await?;
    }
    Ok(removed)
}

/// Create the object only when no object of that name exists. For kinds
/// whose spec is immutable after creation (volume claims).
pub async fn create_if_absent(cluster: &dyn Cluster, obj: &ManagedObject) -> Result<bool> {
    if cluster.get(obj.kind(), obj.namespace(), obj.name()).await?.is_some() {
        return Ok(false);
    }
    debug!(kind = %obj.kind(), ns = %obj.namespace(), name = %obj.name(), "creating object");
    cluster.create(obj).await?;
    Ok(true)
}
