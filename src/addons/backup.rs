//! Backup add-on: a recurring CronJob and on-demand Jobs writing archives
//! of the site's files and database to the tenant's backup volume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::cluster::{create_if_absent, upsert, ManagedObject, ObjectKind};
use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::helpers::{utc_now, utc_stamp};
use crate::metadata::{self, BackupFields, SiteRecord};
use crate::resources::jobs::backup_container;
use crate::resources::tenant::{build_shared_volume, BACKUP_VOLUME_CLAIM};
use crate::resources::{backup_cronjob_name, SiteJobBuilder};
use crate::site::load_required;
use crate::snapshots;

use super::{params, to_json, tracked, AddOn};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableBackupRequest {
    pub retention_days: Option<u32>,
    pub schedule: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub enabled: bool,
    pub retention_days: u32,
    pub schedule: String,
    pub last_run_at: String,
    pub cron_job_present: bool,
    pub last_error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRun {
    pub job_name: String,
    pub started_at: String,
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.backup.last_error = msg;
}

/// Five whitespace-separated cron fields from the usual character set.
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let ok = fields.len() == 5
        && fields.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-'))
        });
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid cron schedule {schedule:?}")))
    }
}

pub fn validate_retention(days: u32) -> Result<()> {
    if (1..=365).contains(&days) {
        Ok(())
    } else {
        Err(Error::validation(format!("retentionDays must be in 1..=365, got {days}")))
    }
}

async fn status_of(ctx: &Context, site: &SiteRef, backup: &BackupFields) -> Result<BackupStatus> {
    let cron_job_present = ctx
        .cluster
        .get(ObjectKind::CronJob, &site.namespace(), &backup_cronjob_name(&site.slug))
        .await?
        .is_some();
    Ok(BackupStatus {
        enabled: backup.enabled,
        retention_days: backup.retention_days,
        schedule: backup.schedule.clone(),
        last_run_at: backup.last_run_at.clone(),
        cron_job_present,
        last_error: backup.last_error.clone(),
    })
}

pub async fn backup_status(ctx: &Context, site: &SiteRef) -> Result<BackupStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, site, &record.backup).await
}

async fn ensure_backup_volume(ctx: &Context, site: &SiteRef) -> Result<()> {
    let d = &ctx.defaults;
    create_if_absent(
        ctx.cluster.as_ref(),
        &ManagedObject::PersistentVolumeClaim(build_shared_volume(
            &site.namespace(),
            BACKUP_VOLUME_CLAIM,
            &site.tenant_id,
            &d.backup_volume_size,
            &d.storage_class,
        )),
    )
    .await?;
    Ok(())
}

fn job_builder(ctx: &Context, site: &SiteRef, name: &str, record: &SiteRecord) -> SiteJobBuilder {
    SiteJobBuilder::new(name, &site.namespace(), &site.slug).container(backup_container(
        &ctx.defaults.backup_image,
        &site.slug,
        record.backup.retention_days,
        record.db.enabled,
    ))
}

/// Rewrite the recurring job from `record` so its `DB_ENABLED` follows the
/// database add-on. No-op while backups are off.
pub(crate) async fn refresh_schedule(ctx: &Context, site: &SiteRef, record: &SiteRecord) -> Result<()> {
    if !record.backup.enabled {
        return Ok(());
    }
    let cron = job_builder(ctx, site, &backup_cronjob_name(&site.slug), record)
        .build_cron_job(&record.backup.schedule);
    upsert(ctx.cluster.as_ref(), &ManagedObject::CronJob(cron)).await?;
    debug!(%site, db_enabled = record.db.enabled, "backup schedule refreshed");
    Ok(())
}

pub async fn enable_backup(
    ctx: &Context,
    site: &SiteRef,
    req: &EnableBackupRequest,
) -> Result<BackupStatus> {
    let retention = req.retention_days.unwrap_or(ctx.defaults.backup_retention_days);
    let schedule = req
        .schedule
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| ctx.defaults.backup_schedule.clone());
    validate_retention(retention)?;
    validate_schedule(&schedule)?;

    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        record.backup.enabled = true;
        record.backup.retention_days = retention;
        record.backup.schedule = schedule.clone();

        ensure_backup_volume(ctx, site).await?;
        let cron = job_builder(ctx, site, &backup_cronjob_name(&site.slug), &record)
            .build_cron_job(&schedule);
        upsert(ctx.cluster.as_ref(), &ManagedObject::CronJob(cron)).await?;

        record.backup.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, %schedule, retention, "backups enabled");
        status_of(ctx, site, &record.backup).await
    })
    .await
}

/// Start a one-shot backup with the recurring job's parameters.
pub async fn run_backup(ctx: &Context, site: &SiteRef) -> Result<BackupRun> {
    let _guard = ctx.locks.lock(site).await;
    let record = load_required(ctx, site).await?;
    if !record.backup.enabled {
        return Err(Error::conflict(format!(
            "backups are not enabled for site {}",
            site.slug
        )));
    }
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        ensure_backup_volume(ctx, site).await?;
        let job_name = format!(
            "{}-{}",
            backup_cronjob_name(&site.slug),
            utc_stamp().to_ascii_lowercase()
        );
        let job = job_builder(ctx, site, &job_name, &record).build_job();
        ctx.cluster.create(&ManagedObject::Job(job)).await?;

        let started_at = utc_now();
        let mut record = record.clone();
        record.backup.last_run_at = started_at.clone();
        record.backup.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, %job_name, "backup job started");
        Ok(BackupRun {
            job_name,
            started_at,
        })
    })
    .await
}

/// Stop scheduling; existing archives stay.
pub async fn disable_backup(ctx: &Context, site: &SiteRef) -> Result<BackupStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        ctx.cluster
            .delete(ObjectKind::CronJob, &ns, &backup_cronjob_name(&site.slug))
            .await?;
        record.backup.enabled = false;
        record.backup.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "backups disabled");
        status_of(ctx, site, &record.backup).await
    })
    .await
}

/// Stop scheduling and delete every archive of the site.
pub async fn purge_backup(ctx: &Context, site: &SiteRef) -> Result<BackupStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        ctx.cluster
            .delete(ObjectKind::CronJob, &ns, &backup_cronjob_name(&site.slug))
            .await?;
        snapshots::purge_snapshots(ctx, site).await?;
        record.backup = BackupFields {
            retention_days: ctx.defaults.backup_retention_days,
            schedule: ctx.defaults.backup_schedule.clone(),
            ..Default::default()
        };
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "backups purged");
        status_of(ctx, site, &record.backup).await
    })
    .await
}

pub struct Backup;

#[async_trait]
impl AddOn for Backup {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_backup(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, _: Value) -> Result<Value> {
        to_json(&disable_backup(ctx, site).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_backup(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&backup_status(ctx, site).await?)
    }
}
