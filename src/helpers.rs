use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Value of the `managed-by` label on every object this control plane owns.
pub const MANAGER: &str = "tenant-plane";

/// Longest slug we accept; keeps `site-<slug>-<field>` annotation keys
/// inside the 63-character name limit.
pub const MAX_SLUG_LEN: usize = 38;

/// Longest user id accepted as a tenant id.
pub const MAX_TENANT_ID_LEN: usize = 40;

/// Return the current UTC time as an RFC 3339 string (second precision).
pub fn utc_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Compact UTC timestamp used in job names and snapshot ids: `20260120T030000Z`.
pub fn utc_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

// ── Runtime defaults (injected via CLI flags / env) ───────────────────────────

/// Cluster-specific configuration injected at startup via CLI flags.
#[derive(Clone, Debug)]
pub struct ControlPlaneDefaults {
    pub control_namespace: String,
    pub placeholder_image: String,
    pub placeholder_port: i32,
    pub registry_pull_secret: String,
    pub storage_class: String,
    pub home_volume_size: String,
    pub backup_volume_size: String,
    pub ingress_class: String,
    pub tls_issuers: Vec<String>,
    pub default_tls_issuer: String,
    pub quota_cpu: String,
    pub quota_memory: String,
    pub quota_pods: String,
    pub quota_storage: String,
    pub router_namespace: String,
    pub database_port: i32,
    pub backup_image: String,
    pub backup_schedule: String,
    pub backup_retention_days: u32,
    pub dns_target: String,
    pub ci_workflow: String,
    pub ci_branch: String,
    /// Interval between phase checks of a snapshot pod.
    pub snapshot_poll_interval: Duration,
    /// Ceiling after which a snapshot pod is abandoned with a timeout.
    pub snapshot_timeout: Duration,
}

impl Default for ControlPlaneDefaults {
    fn default() -> Self {
        Self {
            control_namespace: "tenant-plane".into(),
            placeholder_image: "nginxinc/nginx-unprivileged:stable-alpine".into(),
            placeholder_port: 8080,
            registry_pull_secret: "registry-pull".into(),
            storage_class: "standard".into(),
            home_volume_size: "10Gi".into(),
            backup_volume_size: "20Gi".into(),
            ingress_class: "traefik".into(),
            tls_issuers: vec!["letsencrypt-prod".into(), "letsencrypt-staging".into()],
            default_tls_issuer: "letsencrypt-prod".into(),
            quota_cpu: "4".into(),
            quota_memory: "8Gi".into(),
            quota_pods: "20".into(),
            quota_storage: "50Gi".into(),
            router_namespace: "kube-system".into(),
            database_port: 5432,
            backup_image: "postgres:16-alpine".into(),
            backup_schedule: "0 3 * * *".into(),
            backup_retention_days: 7,
            dns_target: "127.0.0.1".into(),
            ci_workflow: "deploy.yml".into(),
            ci_branch: "main".into(),
            snapshot_poll_interval: Duration::from_secs(2),
            snapshot_timeout: Duration::from_secs(30 * 60),
        }
    }
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Validate a user id before it is used to name a tenant.
pub fn validate_tenant_id(user_id: &str) -> Result<()> {
    let ok = !user_id.is_empty()
        && user_id.len() <= MAX_TENANT_ID_LEN
        && user_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !user_id.starts_with('-')
        && !user_id.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid tenant id {user_id:?}")))
    }
}

/// Namespace that holds everything belonging to one tenant.
pub fn tenant_namespace(user_id: &str) -> String {
    format!("tenant-{user_id}")
}

/// Inverse of [`tenant_namespace`].
pub fn tenant_id_from_namespace(ns: &str) -> Option<&str> {
    ns.strip_prefix("tenant-").filter(|id| !id.is_empty())
}

/// Replace anything that is not lowercase alphanumeric with underscores,
/// giving a safe PostgreSQL identifier component.
pub fn sanitise_ident(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// PostgreSQL role (and schema) owned by a tenant: `t_<tenant>` with each
/// `-` written as `__`. Slugs contribute at most single underscores, so the
/// first lone `_` after the tenant part always marks where it ends and no
/// two tenants can share a database identifier.
pub fn tenant_role(user_id: &str) -> String {
    format!("t_{}", sanitise_ident(&user_id.replace('-', "__")))
}

/// Prefix every database name and user of a tenant starts with.
pub fn tenant_db_prefix(user_id: &str) -> String {
    format!("{}_", tenant_role(user_id))
}

/// Whether `ident` is inside the tenant's own namespace of identifiers:
/// the prefix followed by an alphanumeric, never by another `_`.
pub fn owns_db_ident(user_id: &str, ident: &str) -> bool {
    ident
        .strip_prefix(tenant_db_prefix(user_id).as_str())
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Default database name for a site: `t_<tenant>_<slug>`, shortened with a
/// hash suffix when it would exceed PostgreSQL's 63-byte identifier limit.
pub fn site_db_name(user_id: &str, slug: &str) -> String {
    fit_ident(&format!("{}_{}", tenant_role(user_id), sanitise_ident(slug)))
}

/// Default database user for a site.
pub fn site_db_user(user_id: &str, slug: &str) -> String {
    fit_ident(&format!("{}_{}_u", tenant_role(user_id), sanitise_ident(slug)))
}

fn fit_ident(ident: &str) -> String {
    const LIMIT: usize = 63;
    if ident.len() <= LIMIT {
        return ident.to_string();
    }
    let suffix = &sha256_hex(ident)[..8];
    format!("{}_{suffix}", &ident[..LIMIT - 9])
}

/// Derive a site slug from its domain: lowercase, runs of non-alphanumerics
/// collapsed to a single `-`, no leading/trailing separator. Longer slugs
/// are cut and end in a hash of the full slug to stay within [`MAX_SLUG_LEN`].
pub fn slugify(domain: &str) -> String {
    let mut slug = String::with_capacity(domain.len());
    let mut pending_sep = false;
    for c in domain.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }
    }
    if slug.len() > MAX_SLUG_LEN {
        let suffix = &sha256_hex(&slug)[..8];
        slug.truncate(MAX_SLUG_LEN - suffix.len() - 1);
        while slug.ends_with('-') {
            slug.pop();
        }
        slug.push('-');
        slug.push_str(suffix);
    }
    slug
}

/// Validate a slug received from a caller (path parameter etc).
pub fn validate_slug(slug: &str) -> Result<()> {
    if !slug.is_empty() && slug.len() <= MAX_SLUG_LEN && slugify(slug) == slug {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid site slug {slug:?}")))
    }
}

/// Minimal hostname check: dot-separated labels of alphanumerics and dashes.
pub fn validate_domain(domain: &str) -> Result<()> {
    let valid_label = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    let labels: Vec<&str> = domain.split('.').collect();
    if domain.len() <= 253 && labels.len() >= 2 && labels.iter().all(|l| valid_label(l)) {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid domain {domain:?}")))
    }
}

/// Generate a cryptographically random password from `len` random bytes,
/// hex-encoded.
pub fn generate_password(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// SHA-256 hash of a string, returned as hex.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
