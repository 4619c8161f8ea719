//! Site lifecycle inside an existing tenant: create, list, resize, deploy,
//! delete and purge.

use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addons::tls::resolve_issuer;
use crate::cluster::{delete_site_objects, upsert, ManagedObject, ObjectKind};
use crate::context::{Context, SiteRef};
use crate::credentials;
use crate::error::{Error, Result};
use crate::helpers::{
    slugify, tenant_id_from_namespace, tenant_namespace, utc_now, validate_domain,
    validate_tenant_id,
};
use crate::metadata::{self, BackupFields, SiteRecord};
use crate::resources::workload::{parse_workload_identity, ready_replicas, set_deployment_resources};
use crate::resources::{
    build_deployment, build_ingress, build_service, deployment_name, site_pull_secret_name,
    tenant_labels, tenant_selector, tls_secret_name, SiteWorkloadSpec,
};
use crate::snapshots;

// ── Request / response shapes ───────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSiteRequest {
    pub domain: String,
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_ram_gi")]
    pub ram_gi: f64,
    #[serde(default = "default_disk_gi")]
    pub disk_gi: u32,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_issuer: Option<String>,
}

fn default_cpu() -> f64 {
    0.5
}

fn default_ram_gi() -> f64 {
    0.5
}

fn default_disk_gi() -> u32 {
    1
}

impl CreateSiteRequest {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            cpu: default_cpu(),
            ram_gi: default_ram_gi(),
            disk_gi: default_disk_gi(),
            tls_enabled: false,
            tls_issuer: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteLimits {
    pub cpu: f64,
    pub ram_gi: f64,
    pub disk_gi: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSite {
    pub domain: String,
    pub slug: String,
    pub tenant_id: String,
    pub namespace: String,
    pub limits: SiteLimits,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsPatch {
    pub cpu: Option<f64>,
    pub ram_gi: Option<f64>,
    pub disk_gi: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub image: String,
    pub container_port: i32,
    /// Images that must start as root set this; it sticks for later deploys.
    #[serde(default)]
    pub run_as_root: Option<bool>,
}

/// A site as reported to callers: stored state plus live readiness.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteView {
    #[serde(flatten)]
    pub record: SiteRecord,
    pub namespace: String,
    pub ready: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub slug: String,
    pub existed: bool,
    pub database_dropped: bool,
    pub mail_purged: bool,
    pub dns_removed: bool,
    pub snapshots_purged: bool,
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Smallest amounts that still render as a non-zero quantity (`1m`, `1Mi`).
const MIN_CPU: f64 = 0.001;
const MIN_RAM_GI: f64 = 1.0 / 1024.0;

fn validate_limits(cpu: f64, ram_gi: f64, disk_gi: u32) -> Result<()> {
    if !(MIN_CPU..=64.0).contains(&cpu) {
        return Err(Error::validation(format!("cpu must be in [{MIN_CPU}, 64], got {cpu}")));
    }
    if !(MIN_RAM_GI..=256.0).contains(&ram_gi) {
        return Err(Error::validation(format!("ramGi must be in [1/1024, 256], got {ram_gi}")));
    }
    if !(1..=1024).contains(&disk_gi) {
        return Err(Error::validation(format!("diskGi must be in 1..=1024, got {disk_gi}")));
    }
    Ok(())
}

fn validate_image(image: &str) -> Result<()> {
    if image.is_empty() || image.len() > 512 || image.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!("invalid image reference {image:?}")));
    }
    Ok(())
}

fn validate_port(port: i32) -> Result<()> {
    if !(1..=65535).contains(&port) {
        return Err(Error::validation(format!("containerPort must be in 1..=65535, got {port}")));
    }
    Ok(())
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Load a site that must exist.
pub async fn load_required(ctx: &Context, site: &SiteRef) -> Result<SiteRecord> {
    metadata::load_site(ctx.cluster.as_ref(), &site.namespace(), &site.tenant_id, &site.slug)
        .await?
        .ok_or_else(|| Error::not_found(format!("site {}", site.slug)))
}

/// Best-effort readiness: absent unit or a failed query is simply not ready.
pub async fn site_ready(ctx: &Context, ns: &str, slug: &str) -> bool {
    match ctx
        .cluster
        .get(ObjectKind::Deployment, ns, &deployment_name(slug))
        .await
    {
        Ok(Some(obj)) => obj.into_deployment().is_some_and(|d| {
            parse_workload_identity(&d).is_some_and(|(owner, _)| owner == slug) && ready_replicas(&d) > 0
        }),
        Ok(None) => false,
        Err(e) => {
            debug!(%ns, %slug, %e, "readiness query failed");
            false
        }
    }
}

/// Make sure the tenant holds a copy of the shared registry pull secret.
/// `None` when the control plane has none configured.
async fn ensure_registry_pull(ctx: &Context, tenant_id: &str, ns: &str) -> Result<Option<String>> {
    let name = ctx.defaults.registry_pull_secret.as_str();
    if name.is_empty() {
        return Ok(None);
    }
    let cluster = ctx.cluster.as_ref();
    if credentials::exists(cluster, ns, name).await? {
        return Ok(Some(name.to_string()));
    }
    let Some(source) = credentials::get_secret(cluster, &ctx.defaults.control_namespace, name).await?
    else {
        warn!(%ns, secret = %name, "no shared registry pull secret to copy");
        return Ok(None);
    };
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            labels: Some(tenant_labels(tenant_id)),
            ..Default::default()
        },
        type_: source.type_,
        data: source.data,
        ..Default::default()
    };
    credentials::put_secret(cluster, copy).await?;
    info!(%ns, secret = %name, "copied registry pull secret into tenant");
    Ok(Some(name.to_string()))
}

/// Pull secret a site's workload should use: its own (stored by the CI
/// add-on) if present, otherwise the tenant's shared one.
async fn resolve_pull_secret(ctx: &Context, site: &SiteRef) -> Result<Option<String>> {
    let ns = site.namespace();
    let own = site_pull_secret_name(&site.slug);
    if credentials::exists(ctx.cluster.as_ref(), &ns, &own).await? {
        return Ok(Some(own));
    }
    ensure_registry_pull(ctx, &site.tenant_id, &ns).await
}

fn workload_spec(
    ctx: &Context,
    site: &SiteRef,
    record: &SiteRecord,
    pull_secret: Option<String>,
) -> SiteWorkloadSpec {
    SiteWorkloadSpec {
        namespace: site.namespace(),
        slug: site.slug.clone(),
        host: record.domain.clone(),
        image: record.image.clone(),
        port: record.container_port,
        cpu: record.cpu,
        ram_gi: record.ram_gi,
        tls_enabled: record.tls_enabled,
        tls_issuer: record.tls_issuer.clone(),
        run_as_root: record.run_as_root,
        pull_secret,
        user_id: Some(site.tenant_id.clone()),
        ingress_class: Some(ctx.defaults.ingress_class.clone()).filter(|c| !c.is_empty()),
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

/// Create a site for `domain` in the tenant of `tenant_id`. A slug already
/// used in the tenant, or a domain any tenant already hosts, is rejected
/// with a conflict.
pub async fn create_site(ctx: &Context, tenant_id: &str, req: &CreateSiteRequest) -> Result<CreatedSite> {
    validate_tenant_id(tenant_id)?;
    let domain = req.domain.trim().trim_end_matches('.').to_ascii_lowercase();
    validate_domain(&domain)?;
    validate_limits(req.cpu, req.ram_gi, req.disk_gi)?;
    let tls_issuer = resolve_issuer(&ctx.defaults, req.tls_issuer.as_deref())?;
    let slug = slugify(&domain);
    let site = SiteRef::new(tenant_id, &slug)?;
    let ns = site.namespace();
    let _creating = ctx.locks.lock_creation().await;
    let _guard = ctx.locks.lock(&site).await;

    let existing = metadata::load_sites(ctx.cluster.as_ref(), &ns, tenant_id).await?;
    if let Some(other) = existing.iter().find(|s| s.slug == slug) {
        return Err(Error::conflict(format!(
            "slug {slug} is already used by site {} in this tenant",
            other.domain
        )));
    }
    if domain_hosted(ctx, &domain).await? {
        return Err(Error::conflict(format!("domain {domain} is already hosted")));
    }

    let record = SiteRecord {
        slug: slug.clone(),
        tenant_id: tenant_id.to_string(),
        domain: domain.clone(),
        image: ctx.defaults.placeholder_image.clone(),
        container_port: ctx.defaults.placeholder_port,
        cpu: req.cpu,
        ram_gi: req.ram_gi,
        disk_gi: req.disk_gi,
        created_at: utc_now(),
        tls_enabled: req.tls_enabled,
        tls_issuer,
        backup: BackupFields {
            retention_days: ctx.defaults.backup_retention_days,
            schedule: ctx.defaults.backup_schedule.clone(),
            ..Default::default()
        },
        ..Default::default()
    };
    metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;

    let pull_secret = ensure_registry_pull(ctx, tenant_id, &ns).await?;
    let spec = workload_spec(ctx, &site, &record, pull_secret);
    let cluster = ctx.cluster.as_ref();
    upsert(cluster, &ManagedObject::Deployment(build_deployment(&spec))).await?;
    upsert(cluster, &ManagedObject::Service(build_service(&spec))).await?;
    upsert(cluster, &ManagedObject::Ingress(build_ingress(&spec))).await?;
    info!(%ns, %slug, %domain, "site created");

    Ok(CreatedSite {
        domain,
        slug,
        tenant_id: tenant_id.to_string(),
        namespace: ns,
        limits: SiteLimits {
            cpu: record.cpu,
            ram_gi: record.ram_gi,
            disk_gi: record.disk_gi,
        },
    })
}

/// Whether any tenant already has a site for `domain`. Mail and DNS are
/// keyed by domain, so a domain belongs to one site only.
async fn domain_hosted(ctx: &Context, domain: &str) -> Result<bool> {
    let namespaces = ctx.cluster.list_namespaces(&tenant_selector()).await?;
    Ok(namespaces.iter().any(|ns| {
        tenant_id_from_namespace(&ns.name).is_some_and(|tenant_id| {
            metadata::sites_from_annotations(tenant_id, &ns.annotations)
                .iter()
                .any(|s| s.domain == domain)
        })
    }))
}

async fn view(ctx: &Context, ns: &str, record: SiteRecord) -> SiteView {
    let ready = site_ready(ctx, ns, &record.slug).await;
    SiteView {
        record,
        namespace: ns.to_string(),
        ready,
    }
}

/// Every site of every tenant.
pub async fn list_sites(ctx: &Context) -> Result<Vec<SiteView>> {
    let namespaces = ctx.cluster.list_namespaces(&tenant_selector()).await?;
    let views = namespaces.iter().flat_map(|ns| {
        tenant_id_from_namespace(&ns.name)
            .map(|tenant_id| metadata::sites_from_annotations(tenant_id, &ns.annotations))
            .unwrap_or_default()
            .into_iter()
            .map(move |record| view(ctx, &ns.name, record))
    });
    Ok(join_all(views).await)
}

/// Sites of one tenant.
pub async fn list_tenant_sites(ctx: &Context, tenant_id: &str) -> Result<Vec<SiteView>> {
    validate_tenant_id(tenant_id)?;
    let ns = tenant_namespace(tenant_id);
    let records = metadata::load_sites(ctx.cluster.as_ref(), &ns, tenant_id).await?;
    Ok(join_all(records.into_iter().map(|record| view(ctx, &ns, record))).await)
}

pub async fn get_site(ctx: &Context, site: &SiteRef) -> Result<SiteView> {
    let record = load_required(ctx, site).await?;
    Ok(view(ctx, &site.namespace(), record).await)
}

/// Merge new limits over the stored ones. A live compute unit is resized in
/// place; without one the change is only recorded.
pub async fn update_site_limits(ctx: &Context, site: &SiteRef, patch: &LimitsPatch) -> Result<SiteLimits> {
    let _guard = ctx.locks.lock(site).await;
    let ns = site.namespace();
    let mut record = load_required(ctx, site).await?;

    let cpu = patch.cpu.unwrap_or(record.cpu);
    let ram_gi = patch.ram_gi.unwrap_or(record.ram_gi);
    let disk_gi = patch.disk_gi.unwrap_or(record.disk_gi);
    validate_limits(cpu, ram_gi, disk_gi)?;

    if cpu != record.cpu || ram_gi != record.ram_gi {
        let live = ctx
            .cluster
            .get(ObjectKind::Deployment, &ns, &deployment_name(&site.slug))
            .await?
            .and_then(ManagedObject::into_deployment);
        match live {
            Some(mut dep) => {
                set_deployment_resources(&mut dep, cpu, ram_gi);
                ctx.cluster.replace(&ManagedObject::Deployment(dep)).await?;
                info!(%ns, slug = %site.slug, cpu, ram_gi, "site resources updated");
            }
            None => {
                debug!(%ns, slug = %site.slug, "no compute unit yet, limits recorded only");
            }
        }
    }

    record.cpu = cpu;
    record.ram_gi = ram_gi;
    record.disk_gi = disk_gi;
    metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
    Ok(SiteLimits { cpu, ram_gi, disk_gi })
}

/// Roll the site onto a new image and port.
pub async fn deploy_site(ctx: &Context, site: &SiteRef, req: &DeployRequest) -> Result<SiteView> {
    validate_image(&req.image)?;
    validate_port(req.container_port)?;
    let _guard = ctx.locks.lock(site).await;
    let ns = site.namespace();
    let mut record = load_required(ctx, site).await?;
    record.image = req.image.clone();
    record.container_port = req.container_port;
    if let Some(root) = req.run_as_root {
        record.run_as_root = root;
    }

    let pull_secret = resolve_pull_secret(ctx, site).await?;
    let spec = workload_spec(ctx, site, &record, pull_secret);
    upsert(ctx.cluster.as_ref(), &ManagedObject::Deployment(build_deployment(&spec))).await?;
    upsert(ctx.cluster.as_ref(), &ManagedObject::Service(build_service(&spec))).await?;
    metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
    info!(
        %ns,
        slug = %site.slug,
        image = %req.image,
        port = req.container_port,
        run_as_root = record.run_as_root,
        "site deployed"
    );
    Ok(view(ctx, &ns, record).await)
}

/// Remove the site's workload and every labelled object, then its metadata.
pub async fn delete_site(ctx: &Context, site: &SiteRef) -> Result<()> {
    let _guard = ctx.locks.lock(site).await;
    load_required(ctx, site).await?;
    remove_site(ctx, site).await
}

async fn remove_site(ctx: &Context, site: &SiteRef) -> Result<()> {
    let ns = site.namespace();
    let removed = delete_site_objects(ctx.cluster.as_ref(), &ns, &site.slug).await?;
    metadata::erase_site(ctx.cluster.as_ref(), &ns, &site.slug).await?;
    info!(%ns, slug = %site.slug, removed, "site deleted");
    Ok(())
}

/// Delete plus irreversible cleanup of the database, mail domain, DNS zone,
/// TLS secret and backup snapshots. Unknown slug ⇒ no-op.
///
/// Metadata is erased last so a failed purge can simply be re-run.
pub async fn purge_site(ctx: &Context, site: &SiteRef) -> Result<PurgeReport> {
    let _guard = ctx.locks.lock(site).await;
    let ns = site.namespace();
    let mut report = PurgeReport {
        slug: site.slug.clone(),
        ..Default::default()
    };
    let record = match ctx.cluster.get_namespace(&ns).await? {
        Some(record) => metadata::sites_from_annotations(&site.tenant_id, &record.annotations)
            .into_iter()
            .find(|s| s.slug == site.slug),
        None => None,
    };
    let Some(record) = record else {
        debug!(%ns, slug = %site.slug, "purge of unknown site is a no-op");
        return Ok(report);
    };
    report.existed = true;

    if !record.db.name.is_empty() {
        ctx.db
            .drop_site_database(&record.db.name, &record.db.user)
            .await?;
        report.database_dropped = true;
    }
    if !record.mail.domain.is_empty() {
        ctx.mail.purge_domain(&record.mail.domain).await?;
        report.mail_purged = true;
    }
    if !record.dns.domain.is_empty() {
        ctx.dns.remove_zone(&record.dns.domain).await?;
        report.dns_removed = true;
    }
    report.snapshots_purged = snapshots::purge_snapshots(ctx, site).await?;
    credentials::delete(ctx.cluster.as_ref(), &ns, &tls_secret_name(&site.slug)).await?;

    remove_site(ctx, site).await?;
    info!(%ns, slug = %site.slug, "site purged");
    Ok(report)
}
