//! TLS add-on: toggles the site's route between plain HTTP and HTTPS with a
//! certificate requested from a cluster issuer.

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::cluster::{ManagedObject, ObjectKind};
use crate::context::{Context, SiteRef};
use crate::credentials;
use crate::error::{Error, Result};
use crate::helpers::ControlPlaneDefaults;
use crate::metadata::{self, SiteRecord};
use crate::resources::workload::apply_route_tls;
use crate::resources::{route_name, tls_secret_name};
use crate::site::load_required;

use super::{params, to_json, tracked, AddOn};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableTlsRequest {
    pub issuer: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisableTlsRequest {
    /// Also delete the certificate secret.
    pub cleanup: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsStatus {
    pub enabled: bool,
    pub issuer: String,
    pub route_tls: bool,
    pub secret_present: bool,
    pub last_error: String,
}

/// Pick the issuer: the requested one if it is known, the default if none
/// was requested.
pub fn resolve_issuer(defaults: &ControlPlaneDefaults, requested: Option<&str>) -> Result<String> {
    match requested.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(defaults.default_tls_issuer.clone()),
        Some(r) if defaults.tls_issuers.iter().any(|i| i == r) => Ok(r.to_string()),
        Some(r) => Err(Error::validation(format!(
            "unknown TLS issuer {r:?}, expected one of {}",
            defaults.tls_issuers.join(", ")
        ))),
    }
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.tls_last_error = msg;
}

async fn live_route(ctx: &Context, site: &SiteRef) -> Result<Option<Ingress>> {
    Ok(ctx
        .cluster
        .get(ObjectKind::Ingress, &site.namespace(), &route_name(&site.slug))
        .await?
        .and_then(ManagedObject::into_ingress))
}

async fn switch_route(ctx: &Context, site: &SiteRef, record: &SiteRecord) -> Result<()> {
    let mut route = live_route(ctx, site).await?.ok_or_else(|| {
        Error::conflict(format!("site {} has no route to configure", site.slug))
    })?;
    apply_route_tls(
        &mut route,
        &site.slug,
        &record.domain,
        record.tls_enabled,
        &record.tls_issuer,
    );
    ctx.cluster.replace(&ManagedObject::Ingress(route)).await?;
    Ok(())
}

pub async fn tls_status(ctx: &Context, site: &SiteRef) -> Result<TlsStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, site, &record).await
}

async fn status_of(ctx: &Context, site: &SiteRef, record: &SiteRecord) -> Result<TlsStatus> {
    let route_tls = live_route(ctx, site)
        .await?
        .and_then(|r| r.spec)
        .and_then(|s| s.tls)
        .is_some_and(|tls| !tls.is_empty());
    let secret_present =
        credentials::exists(ctx.cluster.as_ref(), &site.namespace(), &tls_secret_name(&site.slug))
            .await?;
    Ok(TlsStatus {
        enabled: record.tls_enabled,
        issuer: record.tls_issuer.clone(),
        route_tls,
        secret_present,
        last_error: record.tls_last_error.clone(),
    })
}

pub async fn enable_tls(ctx: &Context, site: &SiteRef, req: &EnableTlsRequest) -> Result<TlsStatus> {
    let issuer = resolve_issuer(&ctx.defaults, req.issuer.as_deref())?;
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let mut record = load_required(ctx, site).await?;
        record.tls_enabled = true;
        record.tls_issuer = issuer.clone();
        switch_route(ctx, site, &record).await?;
        record.tls_last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &site.namespace(), &record).await?;
        info!(%site, %issuer, "tls enabled");
        status_of(ctx, site, &record).await
    })
    .await
}

/// Back to plain HTTP. The certificate secret is only removed on request.
pub async fn disable_tls(ctx: &Context, site: &SiteRef, req: &DisableTlsRequest) -> Result<TlsStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, disable_inner(ctx, site, req.cleanup)).await
}

async fn disable_inner(ctx: &Context, site: &SiteRef, cleanup: bool) -> Result<TlsStatus> {
    let mut record = load_required(ctx, site).await?;
    record.tls_enabled = false;
    switch_route(ctx, site, &record).await?;
    if cleanup {
        credentials::delete(
            ctx.cluster.as_ref(),
            &site.namespace(),
            &tls_secret_name(&site.slug),
        )
        .await?;
    }
    record.tls_last_error.clear();
    metadata::save_site(ctx.cluster.as_ref(), &site.namespace(), &record).await?;
    info!(%site, cleanup, "tls disabled");
    status_of(ctx, site, &record).await
}

pub async fn purge_tls(ctx: &Context, site: &SiteRef) -> Result<TlsStatus> {
    disable_tls(ctx, site, &DisableTlsRequest { cleanup: true }).await
}

pub struct Tls;

#[async_trait]
impl AddOn for Tls {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_tls(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&disable_tls(ctx, site, &params(p)?).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_tls(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&tls_status(ctx, site).await?)
    }
}
