//! Database add-on: one PostgreSQL role and database per site, with the
//! connection details stored in the `db-<slug>` credential object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::context::{Context, SiteRef};
use crate::credentials;
use crate::error::{Error, Result};
use crate::helpers::{generate_password, owns_db_ident, site_db_name, site_db_user, tenant_db_prefix};
use crate::metadata::{self, DbFields, SiteRecord};
use crate::postgres::{connection_url, SiteDbProvision};
use crate::resources::{db_secret_name, site_labels};
use crate::site::load_required;

use super::backup::refresh_schedule;
use super::{params, to_json, tracked, AddOn};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableDbRequest {
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStatus {
    pub enabled: bool,
    pub db_name: String,
    pub db_user: String,
    pub db_host: String,
    pub db_port: i32,
    pub secret_name: String,
    pub secret_present: bool,
    pub exists: bool,
    pub last_error: String,
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.db.last_error = msg;
}

/// Caller-chosen database identifiers must stay inside the tenant's own
/// `t_<tenant>_` namespace; see [`owns_db_ident`].
fn validate_db_ident(kind: &str, ident: &str, tenant_id: &str) -> Result<()> {
    let ok = ident.len() <= 63
        && owns_db_ident(tenant_id, ident)
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{kind} {ident:?} must match {}[a-z0-9][a-z0-9_]* and be at most 63 characters",
            tenant_db_prefix(tenant_id)
        )))
    }
}

pub async fn db_status(ctx: &Context, site: &SiteRef) -> Result<DbStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, site, &record.db).await
}

async fn status_of(ctx: &Context, site: &SiteRef, db: &DbFields) -> Result<DbStatus> {
    let secret_name = db_secret_name(&site.slug);
    let secret_present = credentials::exists(ctx.cluster.as_ref(), &site.namespace(), &secret_name).await?;
    let exists = if db.name.is_empty() {
        false
    } else {
        ctx.db.database_exists(&db.name).await?
    };
    Ok(DbStatus {
        enabled: db.enabled,
        db_name: db.name.clone(),
        db_user: db.user.clone(),
        db_host: db.host.clone(),
        db_port: db.port,
        secret_name,
        secret_present,
        exists,
        last_error: db.last_error.clone(),
    })
}

/// Provision the site database, write its credential, read the credential
/// back and compare. Any write failure or mismatch undoes what this call
/// created (database, role, credential) and fails with a consistency error.
pub async fn enable_db(ctx: &Context, site: &SiteRef, req: &EnableDbRequest) -> Result<DbStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, enable_inner(ctx, site, req)).await
}

async fn enable_inner(ctx: &Context, site: &SiteRef, req: &EnableDbRequest) -> Result<DbStatus> {
    let ns = site.namespace();
    let cluster = ctx.cluster.as_ref();
    let mut record = load_required(ctx, site).await?;

    let pick = |kind: &str, requested: &Option<String>, stored: &str, default: String| -> Result<String> {
        match requested.as_deref().filter(|v| !v.is_empty()) {
            Some(v) => {
                validate_db_ident(kind, v, &site.tenant_id)?;
                Ok(v.to_string())
            }
            None if !stored.is_empty() => Ok(stored.to_string()),
            None => Ok(default),
        }
    };
    let name = pick("dbName", &req.db_name, &record.db.name, site_db_name(&site.tenant_id, &site.slug))?;
    let user = pick("dbUser", &req.db_user, &record.db.user, site_db_user(&site.tenant_id, &site.slug))?;

    let secret_name = db_secret_name(&site.slug);
    let password = match req.password.as_deref() {
        Some(pw) if pw.len() < 12 => {
            return Err(Error::validation("password must be at least 12 characters"));
        }
        Some(pw) => pw.to_string(),
        None => credentials::get_values(cluster, &ns, &secret_name)
            .await?
            .and_then(|v| v.get("DB_PASSWORD").cloned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| generate_password(24)),
    };

    let provision = ctx.db.ensure_site_database(&name, &user, &password).await?;
    let endpoint = ctx.db.endpoint();
    let wanted = BTreeMap::from([
        ("DB_HOST".to_string(), endpoint.host.clone()),
        ("DB_PORT".to_string(), endpoint.port.to_string()),
        ("DB_NAME".to_string(), name.clone()),
        ("DB_USER".to_string(), user.clone()),
        ("DB_PASSWORD".to_string(), password.clone()),
        (
            "DATABASE_URL".to_string(),
            connection_url(&endpoint, &name, &user, &password),
        ),
    ]);

    let labels = site_labels(&site.slug, Some(&site.tenant_id));
    let verified = match credentials::put_values(cluster, &ns, &secret_name, labels, &wanted).await {
        Err(e) => Err(format!("writing credential {secret_name}: {e}")),
        Ok(()) => match credentials::get_values(cluster, &ns, &secret_name).await {
            Ok(Some(stored)) if stored == wanted => Ok(()),
            Ok(Some(_)) => Err(format!("credential {secret_name} does not match what was written")),
            Ok(None) => Err(format!("credential {secret_name} missing after write")),
            Err(e) => Err(format!("reading back credential {secret_name}: {e}")),
        },
    };
    if let Err(msg) = verified {
        rollback(ctx, &ns, &secret_name, &name, &user, provision).await;
        return Err(Error::consistency(msg));
    }

    record.db = DbFields {
        enabled: true,
        name,
        user,
        host: endpoint.host,
        port: endpoint.port,
        secret_name,
        last_error: String::new(),
    };
    metadata::save_site(cluster, &ns, &record).await?;
    refresh_schedule(ctx, site, &record).await?;
    info!(%site, db = %record.db.name, "database add-on enabled");
    status_of(ctx, site, &record.db).await
}

async fn rollback(
    ctx: &Context,
    ns: &str,
    secret_name: &str,
    database: &str,
    user: &str,
    provision: SiteDbProvision,
) {
    warn!(%ns, %database, ?provision, "rolling back database provisioning");
    if provision.database_created {
        if let Err(e) = ctx.db.drop_database(database).await {
            warn!(%database, %e, "rollback: drop database failed");
        }
    }
    if provision.role_created {
        if let Err(e) = ctx.db.drop_role(user).await {
            warn!(%user, %e, "rollback: drop role failed");
        }
    }
    if let Err(e) = credentials::delete(ctx.cluster.as_ref(), ns, secret_name).await {
        warn!(%secret_name, %e, "rollback: delete credential failed");
    }
}

/// Remove the credential; the database and its stored name/user survive.
pub async fn disable_db(ctx: &Context, site: &SiteRef) -> Result<DbStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        record.db.enabled = false;
        record.db.last_error.clear();
        refresh_schedule(ctx, site, &record).await?;
        credentials::delete(ctx.cluster.as_ref(), &ns, &db_secret_name(&site.slug)).await?;
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "database add-on disabled");
        status_of(ctx, site, &record.db).await
    })
    .await
}

/// Drop the database and role and forget them.
pub async fn purge_db(ctx: &Context, site: &SiteRef) -> Result<DbStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        let dropped = std::mem::take(&mut record.db);
        refresh_schedule(ctx, site, &record).await?;
        credentials::delete(ctx.cluster.as_ref(), &ns, &db_secret_name(&site.slug)).await?;
        if !dropped.name.is_empty() {
            ctx.db.drop_site_database(&dropped.name, &dropped.user).await?;
        }
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "database add-on purged");
        status_of(ctx, site, &record.db).await
    })
    .await
}

pub struct Database;

#[async_trait]
impl AddOn for Database {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_db(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, _: Value) -> Result<Value> {
        to_json(&disable_db(ctx, site).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_db(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&db_status(ctx, site).await?)
    }
}
