//! Pure builders turning desired state into platform objects. No I/O.
//!
//! Naming is deterministic from the slug so later lookups never need to
//! search: `app-<slug>` (Deployment), `web-<slug>` (Service and Ingress).
//! Every site-scoped object carries the `managed-by` and `site-slug` labels
//! used for bulk selection and deletion.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::helpers::MANAGER;

pub mod jobs;
pub mod secrets;
pub mod tenant;
pub mod workload;

pub use jobs::SiteJobBuilder;
pub use workload::{build_deployment, build_ingress, build_service, SiteWorkloadSpec};

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_SITE_SLUG: &str = "site-slug";
pub const LABEL_TENANT_ID: &str = "tenant-id";

pub fn deployment_name(slug: &str) -> String {
    format!("app-{slug}")
}

pub fn service_name(slug: &str) -> String {
    format!("web-{slug}")
}

pub fn route_name(slug: &str) -> String {
    format!("web-{slug}")
}

pub fn tls_secret_name(slug: &str) -> String {
    format!("tls-{slug}")
}

pub fn db_secret_name(slug: &str) -> String {
    format!("db-{slug}")
}

pub fn github_secret_name(slug: &str) -> String {
    format!("github-{slug}")
}

pub fn site_pull_secret_name(slug: &str) -> String {
    format!("pull-{slug}")
}

pub fn backup_cronjob_name(slug: &str) -> String {
    format!("backup-{slug}")
}

/// Identifying labels carried by every site-scoped object.
pub fn site_labels(slug: &str, user_id: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_SITE_SLUG.to_string(), slug.to_string()),
    ]);
    if let Some(uid) = user_id {
        labels.insert(LABEL_TENANT_ID.to_string(), uid.to_string());
    }
    labels
}

/// Labels for tenant-level objects (namespace, quota, policies, volumes).
pub fn tenant_labels(user_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_TENANT_ID.to_string(), user_id.to_string()),
    ])
}

/// Label selector matching every object owned by one site.
pub fn site_selector(slug: &str) -> String {
    format!("{LABEL_MANAGED_BY}={MANAGER},{LABEL_SITE_SLUG}={slug}")
}

/// Label selector matching every tenant namespace.
pub fn tenant_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGER},{LABEL_TENANT_ID}")
}

/// CPU cores as a millicore quantity (`0.5` → `500m`).
pub fn cpu_quantity(cores: f64) -> Quantity {
    Quantity(format!("{}m", (cores * 1000.0).round() as i64))
}

/// Memory in GiB as a MiB quantity (`0.5` → `512Mi`).
pub fn memory_quantity(gib: f64) -> Quantity {
    Quantity(format!("{}Mi", (gib * 1024.0).round() as i64))
}
