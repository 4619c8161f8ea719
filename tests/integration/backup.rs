use tenant_plane::addons::backup::{
    backup_status, disable_backup, enable_backup, purge_backup, run_backup, EnableBackupRequest,
};
use tenant_plane::addons::database::{disable_db, enable_db, purge_db, EnableDbRequest};
use tenant_plane::cluster::{ManagedObject, ObjectKind};
use tenant_plane::resources::backup_cronjob_name;
use tenant_plane::resources::tenant::BACKUP_VOLUME_CLAIM;

use super::common::*;

fn cron_env(env: &TestEnv, key: &str) -> Option<String> {
    let Some(ManagedObject::CronJob(cron)) =
        env.cluster
            .object(ObjectKind::CronJob, NS, &backup_cronjob_name(SLUG))
    else {
        return None;
    };
    cron.spec?
        .job_template
        .spec?
        .template
        .spec?
        .containers
        .into_iter()
        .flat_map(|c| c.env.unwrap_or_default())
        .find(|e| e.name == key)
        .and_then(|e| e.value)
}

#[tokio::test]
async fn enable_backup_creates_volume_and_schedule() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let status = enable_backup(&env.ctx, &env.site(), &EnableBackupRequest::default()).await?;

    assert!(status.enabled);
    assert!(status.cron_job_present);
    assert_eq!(status.schedule, "0 3 * * *");
    assert_eq!(status.retention_days, 7);
    assert!(env
        .cluster
        .has(ObjectKind::PersistentVolumeClaim, NS, BACKUP_VOLUME_CLAIM));
    assert_eq!(cron_env(&env, "RETENTION_DAYS").as_deref(), Some("7"));
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("false"));
    Ok(())
}

#[tokio::test]
async fn re_enable_refreshes_job_parameters() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_backup(&env.ctx, &site, &EnableBackupRequest::default()).await?;
    enable_db(&env.ctx, &site, &EnableDbRequest::default()).await?;

    let req = EnableBackupRequest {
        retention_days: Some(30),
        schedule: Some("15 2 * * 1-5".into()),
    };
    let status = enable_backup(&env.ctx, &site, &req).await?;
    assert_eq!(status.schedule, "15 2 * * 1-5");
    assert_eq!(cron_env(&env, "RETENTION_DAYS").as_deref(), Some("30"));
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("true"));
    Ok(())
}

#[tokio::test]
async fn schedule_follows_database_enabled_after_backups() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    let req = EnableBackupRequest {
        retention_days: Some(10),
        schedule: Some("30 1 * * *".into()),
    };
    enable_backup(&env.ctx, &site, &req).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("false"));

    enable_db(&env.ctx, &site, &EnableDbRequest::default()).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("true"));
    assert_eq!(cron_env(&env, "RETENTION_DAYS").as_deref(), Some("10"));
    assert_eq!(backup_status(&env.ctx, &site).await?.schedule, "30 1 * * *");
    Ok(())
}

#[tokio::test]
async fn schedule_stops_dumping_once_database_goes_away() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_db(&env.ctx, &site, &EnableDbRequest::default()).await?;
    enable_backup(&env.ctx, &site, &EnableBackupRequest::default()).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("true"));

    disable_db(&env.ctx, &site).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("false"));

    enable_db(&env.ctx, &site, &EnableDbRequest::default()).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("true"));

    purge_db(&env.ctx, &site).await?;
    assert_eq!(cron_env(&env, "DB_ENABLED").as_deref(), Some("false"));
    Ok(())
}

#[tokio::test]
async fn database_changes_without_backups_create_no_schedule() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    enable_db(&env.ctx, &env.site(), &EnableDbRequest::default()).await?;
    disable_db(&env.ctx, &env.site()).await?;
    assert!(!env.cluster.has(ObjectKind::CronJob, NS, &backup_cronjob_name(SLUG)));
    Ok(())
}

#[tokio::test]
async fn invalid_schedule_or_retention_is_rejected() {
    let env = TestEnv::with_site().await;
    let bad_schedule = EnableBackupRequest {
        schedule: Some("every night".into()),
        ..Default::default()
    };
    assert_eq!(
        enable_backup(&env.ctx, &env.site(), &bad_schedule)
            .await
            .unwrap_err()
            .status_code(),
        400
    );
    let bad_retention = EnableBackupRequest {
        retention_days: Some(0),
        ..Default::default()
    };
    assert_eq!(
        enable_backup(&env.ctx, &env.site(), &bad_retention)
            .await
            .unwrap_err()
            .status_code(),
        400
    );
    assert!(!env.cluster.has(ObjectKind::CronJob, NS, &backup_cronjob_name(SLUG)));
}

#[tokio::test]
async fn run_requires_backups_enabled() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let err = run_backup(&env.ctx, &env.site()).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    enable_backup(&env.ctx, &env.site(), &EnableBackupRequest::default()).await?;
    let run = run_backup(&env.ctx, &env.site()).await?;
    assert!(run.job_name.starts_with("backup-app-example-com-"));
    assert!(env.cluster.has(ObjectKind::Job, NS, &run.job_name));

    let status = backup_status(&env.ctx, &env.site()).await?;
    assert_eq!(status.last_run_at, run.started_at);
    Ok(())
}

#[tokio::test]
async fn disable_keeps_archives_purge_deletes_them() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_backup(&env.ctx, &site, &EnableBackupRequest::default()).await?;
    env.cluster.seed_archives(NS, SLUG, &[("20260120T030000Z.tar.gz", 100)]);

    let status = disable_backup(&env.ctx, &site).await?;
    assert!(!status.enabled);
    assert!(!status.cron_job_present);
    assert_eq!(env.cluster.archives(NS, SLUG).len(), 1);

    let status = purge_backup(&env.ctx, &site).await?;
    assert!(!status.enabled);
    assert_eq!(status.schedule, "0 3 * * *");
    assert!(env.cluster.archives(NS, SLUG).is_empty());
    assert_eq!(env.cluster.count(ObjectKind::Pod, NS), 0);
    Ok(())
}
