//! Tenant lifecycle: one namespace per user with quota, isolation policy,
//! shared home volume and a dedicated database role and schema.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::cluster::{create_if_absent, upsert, ManagedObject};
use crate::context::Context;
use crate::credentials;
use crate::error::Result;
use crate::helpers::{generate_password, tenant_namespace, tenant_role, validate_tenant_id};
use crate::metadata;
use crate::postgres::connection_url;
use crate::resources::tenant::{
    build_isolation_policy, build_limit_range, build_quota, build_shared_volume,
    HOME_VOLUME_CLAIM,
};
use crate::resources::tenant_labels;

/// Credential object holding the tenant's own database connection.
pub const TENANT_DB_SECRET: &str = "tenant-db";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuota {
    pub cpu: String,
    pub memory: String,
    pub pods: String,
    pub storage: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantInfo {
    pub tenant_id: String,
    pub namespace: String,
    pub quota: TenantQuota,
}

pub fn tenant_quota(ctx: &Context) -> TenantQuota {
    let d = &ctx.defaults;
    TenantQuota {
        cpu: d.quota_cpu.clone(),
        memory: d.quota_memory.clone(),
        pods: d.quota_pods.clone(),
        storage: d.quota_storage.clone(),
    }
}

/// Create (or re-converge) the tenant for `user_id`. Idempotent. When this
/// call created the namespace and a later step fails, the namespace and
/// database role are removed again before the error is returned.
pub async fn create_tenant(ctx: &Context, user_id: &str) -> Result<TenantInfo> {
    validate_tenant_id(user_id)?;
    let ns = tenant_namespace(user_id);
    let created = ctx
        .cluster
        .ensure_namespace(&ns, &tenant_labels(user_id))
        .await?;
    info!(%ns, created, "tenant namespace ready");

    if let Err(e) = provision(ctx, user_id, &ns).await {
        if created {
            warn!(%ns, %e, "tenant provisioning failed, rolling back");
            if let Err(drop_err) = ctx.db.drop_tenant(&tenant_role(user_id)).await {
                warn!(%ns, %drop_err, "dropping tenant role during rollback failed");
            }
            if let Err(del_err) = ctx.cluster.delete_namespace(&ns).await {
                warn!(%ns, %del_err, "deleting tenant namespace during rollback failed");
            }
        }
        return Err(e);
    }

    Ok(TenantInfo {
        tenant_id: user_id.to_string(),
        namespace: ns,
        quota: tenant_quota(ctx),
    })
}

async fn provision(ctx: &Context, user_id: &str, ns: &str) -> Result<()> {
    let cluster = ctx.cluster.as_ref();
    let d = &ctx.defaults;

    upsert(cluster, &ManagedObject::ResourceQuota(build_quota(ns, user_id, d))).await?;
    upsert(cluster, &ManagedObject::LimitRange(build_limit_range(ns, user_id))).await?;
    upsert(
        cluster,
        &ManagedObject::NetworkPolicy(build_isolation_policy(ns, user_id, d)?),
    )
    .await?;
    create_if_absent(
        cluster,
        &ManagedObject::PersistentVolumeClaim(build_shared_volume(
            ns,
            HOME_VOLUME_CLAIM,
            user_id,
            &d.home_volume_size,
            &d.storage_class,
        )),
    )
    .await?;

    // Keep the existing password on re-runs so live connections survive.
    let role = tenant_role(user_id);
    let password = credentials::get_values(cluster, ns, TENANT_DB_SECRET)
        .await?
        .and_then(|v| v.get("DB_PASSWORD").cloned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| generate_password(32));
    ctx.db.ensure_tenant(&role, &password).await?;

    let endpoint = ctx.db.endpoint();
    let values = BTreeMap::from([
        ("DB_HOST".to_string(), endpoint.host.clone()),
        ("DB_PORT".to_string(), endpoint.port.to_string()),
        ("DB_NAME".to_string(), endpoint.database.clone()),
        ("DB_SCHEMA".to_string(), role.clone()),
        ("DB_USER".to_string(), role.clone()),
        ("DB_PASSWORD".to_string(), password.clone()),
        (
            "DATABASE_URL".to_string(),
            connection_url(&endpoint, &endpoint.database, &role, &password),
        ),
    ]);
    credentials::put_values(cluster, ns, TENANT_DB_SECRET, tenant_labels(user_id), &values).await?;
    info!(%ns, %role, "tenant provisioned");
    Ok(())
}

/// Remove the tenant: site databases, the tenant role and schema, then the
/// namespace, which cascades to every site object. Absent tenant ⇒ no-op.
pub async fn delete_tenant(ctx: &Context, user_id: &str) -> Result<()> {
    validate_tenant_id(user_id)?;
    let ns = tenant_namespace(user_id);
    if let Some(record) = ctx.cluster.get_namespace(&ns).await? {
        for site in metadata::sites_from_annotations(user_id, &record.annotations) {
            if !site.db.name.is_empty() {
                ctx.db.drop_site_database(&site.db.name, &site.db.user).await?;
            }
        }
    }
    ctx.db.drop_tenant(&tenant_role(user_id)).await?;
    ctx.cluster.delete_namespace(&ns).await?;
    info!(%ns, "tenant deleted");
    Ok(())
}
