//! Mail add-on: a mail domain equal to the site's domain on the mail
//! server, plus mailbox and alias management under it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::metadata::{self, MailFields, SiteRecord};
use crate::providers::{Alias, Mailbox, NewMailbox};
use crate::site::load_required;

use super::{params, to_json, tracked, AddOn};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DISABLED: &str = "disabled";
pub const STATUS_ERROR: &str = "error";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableMailRequest {
    /// Must equal the site's domain when given.
    pub domain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailStatus {
    pub enabled: bool,
    pub provider: String,
    pub domain: String,
    pub status: String,
    /// Live state on the mail server; `None` when the domain is unknown there
    /// or no domain is recorded.
    pub provider_active: Option<bool>,
    pub last_error: String,
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.mail.status = STATUS_ERROR.to_string();
    record.mail.last_error = msg;
}

pub async fn mail_status(ctx: &Context, site: &SiteRef) -> Result<MailStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, &record.mail).await
}

async fn status_of(ctx: &Context, mail: &MailFields) -> Result<MailStatus> {
    let provider_active = if mail.domain.is_empty() {
        None
    } else {
        ctx.mail.domain_active(&mail.domain).await?
    };
    Ok(MailStatus {
        enabled: mail.enabled,
        provider: mail.provider.clone(),
        domain: mail.domain.clone(),
        status: if mail.status.is_empty() {
            STATUS_DISABLED.to_string()
        } else {
            mail.status.clone()
        },
        provider_active,
        last_error: mail.last_error.clone(),
    })
}

pub async fn enable_mail(ctx: &Context, site: &SiteRef, req: &EnableMailRequest) -> Result<MailStatus> {
    let _guard = ctx.locks.lock(site).await;
    let site_domain = load_required(ctx, site).await?.domain;
    let domain = req
        .domain
        .as_deref()
        .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
        .unwrap_or_else(|| site_domain.clone());
    if domain != site_domain {
        return Err(Error::validation(format!(
            "mail domain {domain} must equal the site domain {site_domain}"
        )));
    }
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        ctx.mail.ensure_domain(&domain).await?;
        if ctx.mail.domain_active(&domain).await? != Some(true) {
            ctx.mail.activate_domain(&domain).await?;
        }

        record.mail = MailFields {
            enabled: true,
            provider: ctx.mail.name().to_string(),
            domain: domain.clone(),
            status: STATUS_ACTIVE.to_string(),
            last_error: String::new(),
        };
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, domain = %record.mail.domain, "mail add-on enabled");
        status_of(ctx, &record.mail).await
    })
    .await
}

/// Deactivate the domain on the mail server; mailboxes are kept.
pub async fn disable_mail(ctx: &Context, site: &SiteRef) -> Result<MailStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        if !record.mail.domain.is_empty()
            && ctx.mail.domain_active(&record.mail.domain).await?.is_some()
        {
            ctx.mail.deactivate_domain(&record.mail.domain).await?;
        }
        record.mail.enabled = false;
        record.mail.status = STATUS_DISABLED.to_string();
        record.mail.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "mail add-on disabled");
        status_of(ctx, &record.mail).await
    })
    .await
}

/// Delete the domain with every mailbox and alias.
pub async fn purge_mail(ctx: &Context, site: &SiteRef) -> Result<MailStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        if !record.mail.domain.is_empty() {
            ctx.mail.purge_domain(&record.mail.domain).await?;
        }
        record.mail = MailFields {
            status: STATUS_DISABLED.to_string(),
            ..Default::default()
        };
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "mail add-on purged");
        status_of(ctx, &record.mail).await
    })
    .await
}

// ── Mailboxes and aliases ───────────────────────────────────────────────────

/// Mail domain of a site whose mail add-on is enabled.
async fn enabled_domain(ctx: &Context, site: &SiteRef) -> Result<String> {
    let record = load_required(ctx, site).await?;
    if !record.mail.enabled || record.mail.domain.is_empty() {
        return Err(Error::conflict(format!(
            "mail is not enabled for site {}",
            site.slug
        )));
    }
    Ok(record.mail.domain)
}

fn validate_local_part(local: &str) -> Result<()> {
    let ok = !local.is_empty()
        && local.len() <= 64
        && !local.starts_with('.')
        && !local.ends_with('.')
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid mailbox name {local:?}")))
    }
}

/// `address` must be `<local>@<domain>` for exactly this domain.
fn validate_address(address: &str, domain: &str) -> Result<()> {
    match address.rsplit_once('@') {
        Some((local, d)) if d.eq_ignore_ascii_case(domain) => validate_local_part(local),
        _ => Err(Error::validation(format!(
            "address {address:?} is not in mail domain {domain}"
        ))),
    }
}

pub async fn list_mailboxes(ctx: &Context, site: &SiteRef) -> Result<Vec<Mailbox>> {
    let domain = enabled_domain(ctx, site).await?;
    ctx.mail.list_mailboxes(&domain).await
}

pub async fn create_mailbox(ctx: &Context, site: &SiteRef, req: &NewMailbox) -> Result<Mailbox> {
    validate_local_part(&req.local_part)?;
    if req.password.len() < 10 {
        return Err(Error::validation("mailbox password must be at least 10 characters"));
    }
    let domain = enabled_domain(ctx, site).await?;
    let address = format!("{}@{domain}", req.local_part);
    if ctx
        .mail
        .list_mailboxes(&domain)
        .await?
        .iter()
        .any(|m| m.address.eq_ignore_ascii_case(&address))
    {
        return Err(Error::conflict(format!("mailbox {address} already exists")));
    }
    let mailbox = ctx.mail.create_mailbox(&domain, req).await?;
    info!(%site, %address, "mailbox created");
    Ok(mailbox)
}

pub async fn delete_mailbox(ctx: &Context, site: &SiteRef, address: &str) -> Result<()> {
    let domain = enabled_domain(ctx, site).await?;
    validate_address(address, &domain)?;
    if !ctx
        .mail
        .list_mailboxes(&domain)
        .await?
        .iter()
        .any(|m| m.address.eq_ignore_ascii_case(address))
    {
        return Err(Error::not_found(format!("mailbox {address}")));
    }
    ctx.mail.delete_mailbox(address).await?;
    info!(%site, %address, "mailbox deleted");
    Ok(())
}

pub async fn list_aliases(ctx: &Context, site: &SiteRef) -> Result<Vec<Alias>> {
    let domain = enabled_domain(ctx, site).await?;
    ctx.mail.list_aliases(&domain).await
}

pub async fn create_alias(ctx: &Context, site: &SiteRef, alias: &Alias) -> Result<Alias> {
    let domain = enabled_domain(ctx, site).await?;
    validate_address(&alias.address, &domain)?;
    if alias.goto.is_empty() || alias.goto.iter().any(|g| !g.contains('@')) {
        return Err(Error::validation("alias needs at least one destination address"));
    }
    if ctx
        .mail
        .list_aliases(&domain)
        .await?
        .iter()
        .any(|a| a.address.eq_ignore_ascii_case(&alias.address))
    {
        return Err(Error::conflict(format!("alias {} already exists", alias.address)));
    }
    let created = ctx.mail.create_alias(alias).await?;
    info!(%site, address = %alias.address, "alias created");
    Ok(created)
}

pub async fn delete_alias(ctx: &Context, site: &SiteRef, address: &str) -> Result<()> {
    let domain = enabled_domain(ctx, site).await?;
    validate_address(address, &domain)?;
    if !ctx
        .mail
        .list_aliases(&domain)
        .await?
        .iter()
        .any(|a| a.address.eq_ignore_ascii_case(address))
    {
        return Err(Error::not_found(format!("alias {address}")));
    }
    ctx.mail.delete_alias(address).await?;
    info!(%site, %address, "alias deleted");
    Ok(())
}

pub struct Mail;

#[async_trait]
impl AddOn for Mail {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_mail(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, _: Value) -> Result<Value> {
        to_json(&disable_mail(ctx, site).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_mail(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&mail_status(ctx, site).await?)
    }
}
