//! Shared state handed to every operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::cluster::Cluster;
use crate::error::Result;
use crate::helpers::{tenant_namespace, validate_slug, validate_tenant_id, ControlPlaneDefaults};
use crate::postgres::DatabaseAdmin;
use crate::providers::{CiDispatcher, DnsProvider, MailProvider};

pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub db: Arc<dyn DatabaseAdmin>,
    pub mail: Arc<dyn MailProvider>,
    pub dns: Arc<dyn DnsProvider>,
    pub ci: Arc<dyn CiDispatcher>,
    pub defaults: ControlPlaneDefaults,
    pub locks: SiteLocks,
}

/// A validated `(tenant, slug)` pair addressing one site.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SiteRef {
    pub tenant_id: String,
    pub slug: String,
}

impl SiteRef {
    pub fn new(tenant_id: &str, slug: &str) -> Result<Self> {
        validate_tenant_id(tenant_id)?;
        validate_slug(slug)?;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            slug: slug.to_string(),
        })
    }

    pub fn namespace(&self) -> String {
        tenant_namespace(&self.tenant_id)
    }
}

impl std::fmt::Display for SiteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.slug)
    }
}

/// One async mutex per site, so mutating operations on the same site run
/// one at a time inside this process. Different sites never contend, except
/// while being created: creation also takes a process-wide lock because
/// domain uniqueness spans every tenant.
#[derive(Clone, Default)]
pub struct SiteLocks {
    inner: Arc<Mutex<HashMap<SiteRef, Arc<tokio::sync::Mutex<()>>>>>,
    creation: Arc<tokio::sync::Mutex<()>>,
}

impl SiteLocks {
    pub async fn lock_creation(&self) -> OwnedMutexGuard<()> {
        self.creation.clone().lock_owned().await
    }

    pub async fn lock(&self, site: &SiteRef) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Drop slots nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(site.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }
}
