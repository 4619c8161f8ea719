//! Site metadata persisted as annotations on the tenant namespace.
//!
//! Each site owns one annotation per [`SiteField`], keyed
//! `site-<slug>-<field>`. There is no other store: listing, loading and
//! erasing sites all go through this module so the field schema lives in
//! exactly one place.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::cluster::Cluster;
use crate::error::{Error, Result};

/// Every annotation field a site may own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SiteField {
    Domain,
    Image,
    ContainerPort,
    Cpu,
    RamGi,
    DiskGi,
    CreatedAt,
    RunAsRoot,
    TlsEnabled,
    TlsIssuer,
    TlsLastError,
    DbEnabled,
    DbName,
    DbUser,
    DbHost,
    DbPort,
    DbSecretName,
    DbLastError,
    MailEnabled,
    MailProvider,
    MailDomain,
    MailStatus,
    MailLastError,
    DnsEnabled,
    DnsDomain,
    DnsTarget,
    DnsLastError,
    GithubEnabled,
    GithubRepo,
    GithubBranch,
    GithubWorkflow,
    GithubImage,
    GithubLastError,
    BackupEnabled,
    BackupRetentionDays,
    BackupSchedule,
    BackupLastRunAt,
    BackupLastError,
}

impl SiteField {
    pub const ALL: [SiteField; 38] = [
        Self::Domain,
        Self::Image,
        Self::ContainerPort,
        Self::Cpu,
        Self::RamGi,
        Self::DiskGi,
        Self::CreatedAt,
        Self::RunAsRoot,
        Self::TlsEnabled,
        Self::TlsIssuer,
        Self::TlsLastError,
        Self::DbEnabled,
        Self::DbName,
        Self::DbUser,
        Self::DbHost,
        Self::DbPort,
        Self::DbSecretName,
        Self::DbLastError,
        Self::MailEnabled,
        Self::MailProvider,
        Self::MailDomain,
        Self::MailStatus,
        Self::MailLastError,
        Self::DnsEnabled,
        Self::DnsDomain,
        Self::DnsTarget,
        Self::DnsLastError,
        Self::GithubEnabled,
        Self::GithubRepo,
        Self::GithubBranch,
        Self::GithubWorkflow,
        Self::GithubImage,
        Self::GithubLastError,
        Self::BackupEnabled,
        Self::BackupRetentionDays,
        Self::BackupSchedule,
        Self::BackupLastRunAt,
        Self::BackupLastError,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Image => "image",
            Self::ContainerPort => "containerPort",
            Self::Cpu => "cpu",
            Self::RamGi => "ramGi",
            Self::DiskGi => "diskGi",
            Self::CreatedAt => "createdAt",
            Self::RunAsRoot => "runAsRoot",
            Self::TlsEnabled => "tlsEnabled",
            Self::TlsIssuer => "tlsIssuer",
            Self::TlsLastError => "tlsLastError",
            Self::DbEnabled => "dbEnabled",
            Self::DbName => "dbName",
            Self::DbUser => "dbUser",
            Self::DbHost => "dbHost",
            Self::DbPort => "dbPort",
            Self::DbSecretName => "dbSecretName",
            Self::DbLastError => "dbLastError",
            Self::MailEnabled => "mailEnabled",
            Self::MailProvider => "mailProvider",
            Self::MailDomain => "mailDomain",
            Self::MailStatus => "mailStatus",
            Self::MailLastError => "mailLastError",
            Self::DnsEnabled => "dnsEnabled",
            Self::DnsDomain => "dnsDomain",
            Self::DnsTarget => "dnsTarget",
            Self::DnsLastError => "dnsLastError",
            Self::GithubEnabled => "githubEnabled",
            Self::GithubRepo => "githubRepo",
            Self::GithubBranch => "githubBranch",
            Self::GithubWorkflow => "githubWorkflow",
            Self::GithubImage => "githubImage",
            Self::GithubLastError => "githubLastError",
            Self::BackupEnabled => "backupEnabled",
            Self::BackupRetentionDays => "backupRetentionDays",
            Self::BackupSchedule => "backupSchedule",
            Self::BackupLastRunAt => "backupLastRunAt",
            Self::BackupLastError => "backupLastError",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }
}

/// `site-<slug>-<field>`.
pub fn annotation_key(slug: &str, field: SiteField) -> String {
    format!("site-{slug}-{}", field.key())
}

/// Split an annotation key into `(slug, field)`. Field names never contain
/// `-`, so the last separator always ends the slug.
pub fn parse_annotation_key(key: &str) -> Option<(&str, SiteField)> {
    let rest = key.strip_prefix("site-")?;
    let (slug, field) = rest.rsplit_once('-')?;
    if slug.is_empty() {
        return None;
    }
    Some((slug, SiteField::from_key(field)?))
}

// ── Typed record ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbFields {
    pub enabled: bool,
    pub name: String,
    pub user: String,
    pub host: String,
    pub port: i32,
    pub secret_name: String,
    pub last_error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFields {
    pub enabled: bool,
    pub provider: String,
    pub domain: String,
    pub status: String,
    pub last_error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsFields {
    pub enabled: bool,
    pub domain: String,
    pub target: String,
    pub last_error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubFields {
    pub enabled: bool,
    pub repo: String,
    pub branch: String,
    pub workflow: String,
    pub image: String,
    pub last_error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFields {
    pub enabled: bool,
    pub retention_days: u32,
    pub schedule: String,
    pub last_run_at: String,
    pub last_error: String,
}

/// Full persisted state of one site. Readiness is not stored; see
/// [`crate::site::SiteView`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub slug: String,
    pub tenant_id: String,
    pub domain: String,
    pub image: String,
    pub container_port: i32,
    pub cpu: f64,
    pub ram_gi: f64,
    pub disk_gi: u32,
    pub created_at: String,
    pub run_as_root: bool,
    pub tls_enabled: bool,
    pub tls_issuer: String,
    pub tls_last_error: String,
    pub db: DbFields,
    pub mail: MailFields,
    pub dns: DnsFields,
    pub github: GithubFields,
    pub backup: BackupFields,
}

fn parse_or_default<T: std::str::FromStr + Default>(slug: &str, field: SiteField, raw: &str) -> T {
    if raw.is_empty() {
        return T::default();
    }
    raw.parse().unwrap_or_else(|_| {
        warn!(%slug, field = field.key(), %raw, "unparseable site annotation, using default");
        T::default()
    })
}

impl SiteRecord {
    /// Serialize every field, including empty/disabled ones, so one patch
    /// fully describes the site.
    pub fn to_fields(&self) -> BTreeMap<SiteField, String> {
        use SiteField as F;
        BTreeMap::from([
            (F::Domain, self.domain.clone()),
            (F::Image, self.image.clone()),
            (F::ContainerPort, self.container_port.to_string()),
            (F::Cpu, self.cpu.to_string()),
            (F::RamGi, self.ram_gi.to_string()),
            (F::DiskGi, self.disk_gi.to_string()),
            (F::CreatedAt, self.created_at.clone()),
            (F::RunAsRoot, self.run_as_root.to_string()),
            (F::TlsEnabled, self.tls_enabled.to_string()),
            (F::TlsIssuer, self.tls_issuer.clone()),
            (F::TlsLastError, self.tls_last_error.clone()),
            (F::DbEnabled, self.db.enabled.to_string()),
            (F::DbName, self.db.name.clone()),
            (F::DbUser, self.db.user.clone()),
            (F::DbHost, self.db.host.clone()),
            (F::DbPort, self.db.port.to_string()),
            (F::DbSecretName, self.db.secret_name.clone()),
            (F::DbLastError, self.db.last_error.clone()),
            (F::MailEnabled, self.mail.enabled.to_string()),
            (F::MailProvider, self.mail.provider.clone()),
            (F::MailDomain, self.mail.domain.clone()),
            (F::MailStatus, self.mail.status.clone()),
            (F::MailLastError, self.mail.last_error.clone()),
            (F::DnsEnabled, self.dns.enabled.to_string()),
            (F::DnsDomain, self.dns.domain.clone()),
            (F::DnsTarget, self.dns.target.clone()),
            (F::DnsLastError, self.dns.last_error.clone()),
            (F::GithubEnabled, self.github.enabled.to_string()),
            (F::GithubRepo, self.github.repo.clone()),
            (F::GithubBranch, self.github.branch.clone()),
            (F::GithubWorkflow, self.github.workflow.clone()),
            (F::GithubImage, self.github.image.clone()),
            (F::GithubLastError, self.github.last_error.clone()),
            (F::BackupEnabled, self.backup.enabled.to_string()),
            (F::BackupRetentionDays, self.backup.retention_days.to_string()),
            (F::BackupSchedule, self.backup.schedule.clone()),
            (F::BackupLastRunAt, self.backup.last_run_at.clone()),
            (F::BackupLastError, self.backup.last_error.clone()),
        ])
    }

    /// Rebuild a record from its parsed fields. Missing fields take their
    /// defaults; malformed values are logged and defaulted.
    pub fn from_fields(tenant_id: &str, slug: &str, fields: &BTreeMap<SiteField, String>) -> Self {
        use SiteField as F;
        let s = |f: F| fields.get(&f).cloned().unwrap_or_default();
        let b = |f: F| fields.get(&f).is_some_and(|v| v == "true");
        let n = |f: F| fields.get(&f).map(String::as_str).unwrap_or_default();
        SiteRecord {
            slug: slug.to_string(),
            tenant_id: tenant_id.to_string(),
            domain: s(F::Domain),
            image: s(F::Image),
            container_port: parse_or_default(slug, F::ContainerPort, n(F::ContainerPort)),
            cpu: parse_or_default(slug, F::Cpu, n(F::Cpu)),
            ram_gi: parse_or_default(slug, F::RamGi, n(F::RamGi)),
            disk_gi: parse_or_default(slug, F::DiskGi, n(F::DiskGi)),
            created_at: s(F::CreatedAt),
            run_as_root: b(F::RunAsRoot),
            tls_enabled: b(F::TlsEnabled),
            tls_issuer: s(F::TlsIssuer),
            tls_last_error: s(F::TlsLastError),
            db: DbFields {
                enabled: b(F::DbEnabled),
                name: s(F::DbName),
                user: s(F::DbUser),
                host: s(F::DbHost),
                port: parse_or_default(slug, F::DbPort, n(F::DbPort)),
                secret_name: s(F::DbSecretName),
                last_error: s(F::DbLastError),
            },
            mail: MailFields {
                enabled: b(F::MailEnabled),
                provider: s(F::MailProvider),
                domain: s(F::MailDomain),
                status: s(F::MailStatus),
                last_error: s(F::MailLastError),
            },
            dns: DnsFields {
                enabled: b(F::DnsEnabled),
                domain: s(F::DnsDomain),
                target: s(F::DnsTarget),
                last_error: s(F::DnsLastError),
            },
            github: GithubFields {
                enabled: b(F::GithubEnabled),
                repo: s(F::GithubRepo),
                branch: s(F::GithubBranch),
                workflow: s(F::GithubWorkflow),
                image: s(F::GithubImage),
                last_error: s(F::GithubLastError),
            },
            backup: BackupFields {
                enabled: b(F::BackupEnabled),
                retention_days: parse_or_default(slug, F::BackupRetentionDays, n(F::BackupRetentionDays)),
                schedule: s(F::BackupSchedule),
                last_run_at: s(F::BackupLastRunAt),
                last_error: s(F::BackupLastError),
            },
        }
    }

    /// Annotation patch writing every field of this record.
    pub fn to_annotation_patch(&self) -> BTreeMap<String, Option<String>> {
        self.to_fields()
            .into_iter()
            .map(|(f, v)| (annotation_key(&self.slug, f), Some(v)))
            .collect()
    }
}

/// Group a namespace's annotations by site slug, ignoring unrelated keys.
pub fn group_site_fields(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, BTreeMap<SiteField, String>> {
    let mut sites: BTreeMap<String, BTreeMap<SiteField, String>> = BTreeMap::new();
    for (key, value) in annotations {
        if let Some((slug, field)) = parse_annotation_key(key) {
            sites
                .entry(slug.to_string())
                .or_default()
                .insert(field, value.clone());
        }
    }
    // A slug only counts as a site once its domain is recorded.
    sites.retain(|_, fields| fields.contains_key(&SiteField::Domain));
    sites
}

/// Decode every site stored on a tenant namespace's annotations.
pub fn sites_from_annotations(
    tenant_id: &str,
    annotations: &BTreeMap<String, String>,
) -> Vec<SiteRecord> {
    group_site_fields(annotations)
        .iter()
        .map(|(slug, fields)| SiteRecord::from_fields(tenant_id, slug, fields))
        .collect()
}

/// Patch nulling every annotation owned by `slug`: the full schema plus any
/// stray key that parses as belonging to it.
pub fn erase_patch(
    slug: &str,
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    let mut patch: BTreeMap<String, Option<String>> = SiteField::ALL
        .into_iter()
        .map(|f| (annotation_key(slug, f), None))
        .collect();
    for key in annotations.keys() {
        if matches!(parse_annotation_key(key), Some((s, _)) if s == slug) {
            patch.insert(key.clone(), None);
        }
    }
    patch
}

// ── Store operations over the cluster ───────────────────────────────────────

/// Load all sites of one tenant namespace. Missing namespace ⇒ `NotFound`.
pub async fn load_sites(cluster: &dyn Cluster, ns: &str, tenant_id: &str) -> Result<Vec<SiteRecord>> {
    let record = cluster
        .get_namespace(ns)
        .await?
        .ok_or_else(|| Error::not_found(format!("tenant {tenant_id}")))?;
    Ok(sites_from_annotations(tenant_id, &record.annotations))
}

/// Load one site; `None` when the tenant has no such slug.
pub async fn load_site(
    cluster: &dyn Cluster,
    ns: &str,
    tenant_id: &str,
    slug: &str,
) -> Result<Option<SiteRecord>> {
    Ok(load_sites(cluster, ns, tenant_id)
        .await?
        .into_iter()
        .find(|s| s.slug == slug))
}

/// Write every field of the record in a single annotation patch.
pub async fn save_site(cluster: &dyn Cluster, ns: &str, record: &SiteRecord) -> Result<()> {
    cluster
        .patch_namespace_annotations(ns, &record.to_annotation_patch())
        .await
}

/// Remove every annotation owned by the slug.
pub async fn erase_site(cluster: &dyn Cluster, ns: &str, slug: &str) -> Result<()> {
    let annotations = match cluster.get_namespace(ns).await? {
        Some(record) => record.annotations,
        None => return Ok(()),
    };
    cluster
        .patch_namespace_annotations(ns, &erase_patch(slug, &annotations))
        .await
}
