use std::time::Duration;

use tenant_plane::addons::backup::{enable_backup, EnableBackupRequest};
use tenant_plane::addons::database::{enable_db, EnableDbRequest};
use tenant_plane::cluster::ObjectKind;
use tenant_plane::snapshots::{delete_snapshot, list_snapshots, restore_snapshot, RestoreRequest};

use super::common::*;

const OLD: &str = "20260119T030000Z";
const NEW: &str = "20260120T030000Z";

async fn env_with_archives() -> TestEnv {
    let env = TestEnv::with_site().await;
    enable_backup(&env.ctx, &env.site(), &EnableBackupRequest::default())
        .await
        .unwrap();
    env.cluster.seed_archives(
        NS,
        SLUG,
        &[
            ("20260119T030000Z.tgz", 70),
            ("20260120T030000Z.tar.gz", 100),
            ("20260120T030000Z.sql.gz", 20),
            ("notes.txt", 1),
        ],
    );
    env
}

#[tokio::test]
async fn no_backup_volume_means_no_snapshots() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    assert!(list_snapshots(&env.ctx, &env.site()).await?.is_empty());
    assert!(env.cluster.lock().pods_started.is_empty(), "no pod without a volume");
    Ok(())
}

#[tokio::test]
async fn listing_groups_parts_newest_first() -> anyhow::Result<()> {
    let env = env_with_archives().await;
    let snaps = list_snapshots(&env.ctx, &env.site()).await?;

    assert_eq!(snaps.len(), 2);
    assert_eq!(snaps[0].id, NEW);
    assert!(snaps[0].has_files && snaps[0].has_db);
    assert_eq!(snaps[0].size_bytes, 120);
    assert_eq!(snaps[1].id, OLD);
    assert!(snaps[1].has_files && !snaps[1].has_db);
    assert_eq!(snaps[1].files_archive(), Some("20260119T030000Z.tgz"));

    assert_eq!(env.cluster.count(ObjectKind::Pod, NS), 0, "listing pod is removed");
    assert!(env.cluster.lock().pods_started[0].starts_with("snap-list-app-example-com-"));
    Ok(())
}

#[tokio::test]
async fn restore_runs_selected_parts() -> anyhow::Result<()> {
    let env = env_with_archives().await;
    let site = env.site();
    enable_db(&env.ctx, &site, &EnableDbRequest::default()).await?;

    let report = restore_snapshot(&env.ctx, &site, NEW, RestoreRequest::default()).await?;
    assert_eq!(report.files_restored.as_deref(), Some("20260120T030000Z.tar.gz"));
    assert_eq!(report.db_restored.as_deref(), Some("20260120T030000Z.sql.gz"));

    let files_only = RestoreRequest { files: true, db: false };
    let report = restore_snapshot(&env.ctx, &site, OLD, files_only).await?;
    assert_eq!(report.files_restored.as_deref(), Some("20260119T030000Z.tgz"));
    assert_eq!(report.db_restored, None);

    let restores = env.cluster.lock().restores.clone();
    assert_eq!(restores.len(), 2);
    assert_eq!(restores[0].db_dump, "20260120T030000Z.sql.gz");
    assert_eq!(restores[1].files_archive, "20260119T030000Z.tgz");
    assert!(restores[1].db_dump.is_empty());
    assert_eq!(env.cluster.count(ObjectKind::Pod, NS), 0);
    Ok(())
}

#[tokio::test]
async fn restore_preconditions() -> anyhow::Result<()> {
    let env = env_with_archives().await;
    let site = env.site();

    // The dump cannot land anywhere without the database add-on.
    let err = restore_snapshot(&env.ctx, &site, NEW, RestoreRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);

    let nothing = RestoreRequest { files: false, db: false };
    let err = restore_snapshot(&env.ctx, &site, NEW, nothing).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = restore_snapshot(&env.ctx, &site, "20250101T000000Z", RestoreRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);

    let err = restore_snapshot(&env.ctx, &site, "../etc", RestoreRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    // Files-only snapshot with db requested but the files half declined.
    let db_only = RestoreRequest { files: false, db: true };
    let err = restore_snapshot(&env.ctx, &site, OLD, db_only).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    assert!(env.cluster.lock().restores.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_removes_both_parts() -> anyhow::Result<()> {
    let env = env_with_archives().await;
    delete_snapshot(&env.ctx, &env.site(), NEW).await?;

    let remaining = env.cluster.archives(NS, SLUG);
    assert!(remaining.iter().all(|n| !n.starts_with(NEW)));
    assert!(remaining.iter().any(|n| n.starts_with(OLD)));

    let err = delete_snapshot(&env.ctx, &env.site(), NEW).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    Ok(())
}

#[tokio::test]
async fn failed_pod_is_an_error_and_is_cleaned_up() {
    let env = env_with_archives().await;
    env.cluster.lock().failing_ops.insert("list".to_string());

    let err = list_snapshots(&env.ctx, &env.site()).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert!(err.to_string().contains("simulated failure"));
    assert_eq!(env.cluster.count(ObjectKind::Pod, NS), 0);
}

#[tokio::test]
async fn stuck_pod_times_out_and_is_cleaned_up() {
    let mut defaults = test_defaults();
    defaults.snapshot_timeout = Duration::from_millis(50);
    let env = TestEnv::with_defaults(defaults);
    tenant_plane::tenant::create_tenant(&env.ctx, USER).await.unwrap();
    tenant_plane::site::create_site(
        &env.ctx,
        USER,
        &tenant_plane::site::CreateSiteRequest::new(DOMAIN),
    )
    .await
    .unwrap();
    enable_backup(&env.ctx, &env.site(), &EnableBackupRequest::default())
        .await
        .unwrap();
    env.cluster.lock().stuck_ops.insert("list".to_string());

    let err = list_snapshots(&env.ctx, &env.site()).await.unwrap_err();
    assert_eq!(err.status_code(), 504);
    assert_eq!(env.cluster.count(ObjectKind::Pod, NS), 0);
}
