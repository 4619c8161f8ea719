//! DNS add-on: a zone for the site's domain with apex and `www` records.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::metadata::{self, DnsFields, SiteRecord};
use crate::site::load_required;

use super::{params, to_json, tracked, AddOn};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableDnsRequest {
    /// IPv4 address the records point at; the control-plane default if unset.
    pub target: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsStatus {
    pub enabled: bool,
    pub domain: String,
    pub target: String,
    pub zone_exists: bool,
    pub last_error: String,
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.dns.last_error = msg;
}

async fn status_of(ctx: &Context, dns: &DnsFields) -> Result<DnsStatus> {
    let zone_exists = !dns.domain.is_empty() && ctx.dns.zone_exists(&dns.domain).await?;
    Ok(DnsStatus {
        enabled: dns.enabled,
        domain: dns.domain.clone(),
        target: dns.target.clone(),
        zone_exists,
        last_error: dns.last_error.clone(),
    })
}

pub async fn dns_status(ctx: &Context, site: &SiteRef) -> Result<DnsStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, &record.dns).await
}

pub async fn enable_dns(ctx: &Context, site: &SiteRef, req: &EnableDnsRequest) -> Result<DnsStatus> {
    let target = req
        .target
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| ctx.defaults.dns_target.clone());
    target
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::validation(format!("dns target {target:?} is not an IPv4 address")))?;

    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        ctx.dns.ensure_zone(&record.domain, &target).await?;
        record.dns = DnsFields {
            enabled: true,
            domain: record.domain.clone(),
            target: target.clone(),
            last_error: String::new(),
        };
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, domain = %record.dns.domain, %target, "dns add-on enabled");
        status_of(ctx, &record.dns).await
    })
    .await
}

/// Remove the zone; domain and target stay recorded for re-enabling.
pub async fn disable_dns(ctx: &Context, site: &SiteRef) -> Result<DnsStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        if !record.dns.domain.is_empty() {
            ctx.dns.remove_zone(&record.dns.domain).await?;
        }
        record.dns.enabled = false;
        record.dns.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "dns add-on disabled");
        status_of(ctx, &record.dns).await
    })
    .await
}

pub async fn purge_dns(ctx: &Context, site: &SiteRef) -> Result<DnsStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        if !record.dns.domain.is_empty() {
            ctx.dns.remove_zone(&record.dns.domain).await?;
        }
        record.dns = DnsFields::default();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "dns add-on purged");
        status_of(ctx, &record.dns).await
    })
    .await
}

pub struct Dns;

#[async_trait]
impl AddOn for Dns {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_dns(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, _: Value) -> Result<Value> {
        to_json(&disable_dns(ctx, site).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_dns(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&dns_status(ctx, site).await?)
    }
}
