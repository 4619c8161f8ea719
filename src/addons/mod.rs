//! Per-site add-ons: database, mail, DNS, TLS, CI deploy and backup.
//!
//! Each add-on is a zero-sized struct implementing [`AddOn`]. The
//! `addon_for()` function maps an [`AddOnKind`] to a `&'static dyn AddOn`,
//! so callers dispatch on the family without branching on its name. Every
//! module also exposes typed functions (`enable_db`, `dispatch`, ...) that
//! the trait impls wrap.
//!
//! Shared contract: `enable` validates, calls one external system and
//! records success, or records `<family>LastError` and returns the error.
//! `disable` is reversible and keeps the metadata needed to re-enable.
//! `purge` additionally destroys the external resource.

use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::metadata::{self, SiteRecord};

pub mod backup;
pub mod database;
pub mod dns;
pub mod github;
pub mod mail;
pub mod tls;

pub use backup::Backup;
pub use database::Database;
pub use dns::Dns;
pub use github::Github;
pub use mail::Mail;
pub use tls::Tls;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddOnKind {
    Db,
    Mail,
    Dns,
    Tls,
    Github,
    Backup,
}

impl AddOnKind {
    pub const ALL: [AddOnKind; 6] = [
        Self::Db,
        Self::Mail,
        Self::Dns,
        Self::Tls,
        Self::Github,
        Self::Backup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Mail => "mail",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Github => "github",
            Self::Backup => "backup",
        }
    }
}

impl std::fmt::Display for AddOnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AddOnKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown add-on {s:?}")))
    }
}

/// Capability every add-on family implements. Parameters and results are
/// JSON so one dispatch path serves every family.
#[async_trait]
pub trait AddOn: Send + Sync {
    async fn enable(&self, ctx: &Context, site: &SiteRef, params: Value) -> Result<Value>;

    async fn disable(&self, ctx: &Context, site: &SiteRef, params: Value) -> Result<Value>;

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value>;

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value>;
}

/// Map an add-on family to its static implementation.
pub fn addon_for(kind: AddOnKind) -> &'static dyn AddOn {
    match kind {
        AddOnKind::Db => &Database,
        AddOnKind::Mail => &Mail,
        AddOnKind::Dns => &Dns,
        AddOnKind::Tls => &Tls,
        AddOnKind::Github => &Github,
        AddOnKind::Backup => &Backup,
    }
}

/// Decode request parameters; `null` means "all defaults".
pub(crate) fn params<T: DeserializeOwned + Default>(value: Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| Error::validation(format!("invalid parameters: {e}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run `op`; on failure write the message into the site's last-error
/// field(s) via `mark` before returning the error. Recording is best effort.
pub(crate) async fn tracked<T, F>(
    ctx: &Context,
    site: &SiteRef,
    mark: fn(&mut SiteRecord, String),
    op: F,
) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    let err = match op.await {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    if !matches!(err, Error::NotFound(_)) {
        let ns = site.namespace();
        let cluster = ctx.cluster.as_ref();
        match metadata::load_site(cluster, &ns, &site.tenant_id, &site.slug).await {
            Ok(Some(mut record)) => {
                mark(&mut record, err.to_string());
                if let Err(e) = metadata::save_site(cluster, &ns, &record).await {
                    warn!(%site, %e, "could not record add-on failure");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%site, %e, "could not load site to record add-on failure"),
        }
    }
    warn!(%site, %err, "add-on operation failed");
    Err(err)
}
