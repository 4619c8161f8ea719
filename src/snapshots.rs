//! Backup snapshots on the tenant's shared backup volume.
//!
//! The control plane never touches that volume itself. Listing, restoring
//! and deleting run as short-lived pods that report through their logs;
//! [`run_ephemeral_pod`] owns the create → poll → delete sequence so the pod
//! is removed on every exit path.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{ManagedObject, ObjectKind};
use crate::context::{Context, SiteRef};
use crate::error::{Error, Result};
use crate::resources::jobs::{delete_container, list_container, purge_container, restore_container};
use crate::resources::tenant::BACKUP_VOLUME_CLAIM;
use crate::resources::SiteJobBuilder;
use crate::site::load_required;

pub const FILES_EXTENSIONS: [&str; 2] = [".tar.gz", ".tgz"];
pub const DB_EXTENSION: &str = ".sql.gz";

/// One archive file belonging to a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPart {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub has_files: bool,
    pub has_db: bool,
    pub size_bytes: u64,
    pub parts: Vec<SnapshotPart>,
}

impl Snapshot {
    /// The file-tree archive, whichever extension it was written with.
    pub fn files_archive(&self) -> Option<&str> {
        FILES_EXTENSIONS.iter().find_map(|ext| {
            self.parts
                .iter()
                .find(|p| p.name.strip_suffix(ext) == Some(self.id.as_str()))
                .map(|p| p.name.as_str())
        })
    }

    pub fn db_dump(&self) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.name.strip_suffix(DB_EXTENSION) == Some(self.id.as_str()))
            .map(|p| p.name.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(default = "yes")]
    pub files: bool,
    #[serde(default = "yes")]
    pub db: bool,
}

fn yes() -> bool {
    true
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self { files: true, db: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub id: String,
    pub files_restored: Option<String>,
    pub db_restored: Option<String>,
}

/// `20260120T030000Z`
pub fn validate_snapshot_id(id: &str) -> Result<()> {
    let b = id.as_bytes();
    let ok = b.len() == 16
        && b[..8].iter().all(u8::is_ascii_digit)
        && b[8] == b'T'
        && b[9..15].iter().all(u8::is_ascii_digit)
        && b[15] == b'Z';
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid snapshot id {id:?}")))
    }
}

fn split_archive_name(name: &str) -> Option<(&str, bool)> {
    if let Some(id) = name.strip_suffix(DB_EXTENSION) {
        return Some((id, false));
    }
    FILES_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .map(|id| (id, true))
}

/// Turn listing pod output (`FILE <name> <size> <sha256>` lines) into
/// snapshots, newest first. Unrelated lines and files are ignored.
pub fn parse_snapshot_listing(logs: &str) -> Vec<Snapshot> {
    let mut by_id: BTreeMap<String, Snapshot> = BTreeMap::new();
    for line in logs.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("FILE") {
            continue;
        }
        let (Some(name), Some(size), sha) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        let Ok(size_bytes) = size.parse::<u64>() else {
            continue;
        };
        let Some((id, is_files)) = split_archive_name(name) else {
            continue;
        };
        if validate_snapshot_id(id).is_err() {
            continue;
        }
        let snap = by_id.entry(id.to_string()).or_insert_with(|| Snapshot {
            id: id.to_string(),
            has_files: false,
            has_db: false,
            size_bytes: 0,
            parts: vec![],
        });
        if is_files {
            snap.has_files = true;
        } else {
            snap.has_db = true;
        }
        snap.size_bytes += size_bytes;
        snap.parts.push(SnapshotPart {
            name: name.to_string(),
            size_bytes,
            sha256: sha.unwrap_or_default().to_string(),
        });
    }
    by_id.into_values().rev().collect()
}

// ── Ephemeral pod runner ────────────────────────────────────────────────────

/// Terminal result of a snapshot pod.
#[derive(Clone, Debug)]
pub struct PodOutcome {
    pub phase: String,
    pub logs: String,
}

fn pod_name(op: &str, slug: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("snap-{op}-{slug}-{suffix:06x}")
}

async fn wait_for_terminal_phase(ctx: &Context, ns: &str, name: &str) -> Result<String> {
    let poll = async {
        loop {
            let phase = ctx
                .cluster
                .get(ObjectKind::Pod, ns, name)
                .await?
                .and_then(ManagedObject::into_pod)
                .and_then(|p| p.status)
                .and_then(|s| s.phase);
            match phase {
                Some(p) if p == "Succeeded" || p == "Failed" => return Ok::<_, Error>(p),
                Some(_) => {}
                None => debug!(%ns, %name, "pod not reporting a phase yet"),
            }
            tokio::time::sleep(ctx.defaults.snapshot_poll_interval).await;
        }
    };
    tokio::time::timeout(ctx.defaults.snapshot_timeout, poll)
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "pod {ns}/{name} did not finish within {:?}",
                ctx.defaults.snapshot_timeout
            ))
        })?
}

/// Create the pod, wait for it to finish, collect its logs and delete it.
/// The delete runs whatever the wait produced (success, failure, timeout).
/// A failed pod is reported as an error carrying its logs.
pub async fn run_ephemeral_pod(ctx: &Context, builder: SiteJobBuilder) -> Result<PodOutcome> {
    let pod = builder.build_pod();
    let ns = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    ctx.cluster.create(&ManagedObject::Pod(pod)).await?;
    debug!(%ns, %name, "snapshot pod started");

    let result = async {
        let phase = wait_for_terminal_phase(ctx, &ns, &name).await?;
        let logs = ctx.cluster.pod_logs(&ns, &name).await?;
        Ok::<_, Error>(PodOutcome { phase, logs })
    }
    .await;

    if let Err(e) = ctx.cluster.delete(ObjectKind::Pod, &ns, &name).await {
        warn!(%ns, %name, %e, "failed to delete snapshot pod");
    }

    let outcome = result?;
    if outcome.phase != "Succeeded" {
        return Err(Error::Platform(format!(
            "pod {ns}/{name} ended in phase {}: {}",
            outcome.phase,
            outcome.logs.trim()
        )));
    }
    Ok(outcome)
}

async fn backup_volume_exists(ctx: &Context, ns: &str) -> Result<bool> {
    Ok(ctx
        .cluster
        .get(ObjectKind::PersistentVolumeClaim, ns, BACKUP_VOLUME_CLAIM)
        .await?
        .is_some())
}

/// Pod for one snapshot operation; its deadline equals the wait timeout.
fn snapshot_pod(ctx: &Context, op: &str, site: &SiteRef) -> SiteJobBuilder {
    let deadline = ctx.defaults.snapshot_timeout.as_secs().max(1);
    SiteJobBuilder::new(&pod_name(op, &site.slug), &site.namespace(), &site.slug)
        .active_deadline(i64::try_from(deadline).unwrap_or(i64::MAX))
}

// ── Operations ──────────────────────────────────────────────────────────────

/// Snapshots on the backup volume, newest first. No volume ⇒ none.
pub async fn list_snapshots(ctx: &Context, site: &SiteRef) -> Result<Vec<Snapshot>> {
    load_required(ctx, site).await?;
    list_unchecked(ctx, site).await
}

async fn list_unchecked(ctx: &Context, site: &SiteRef) -> Result<Vec<Snapshot>> {
    if !backup_volume_exists(ctx, &site.namespace()).await? {
        return Ok(vec![]);
    }
    let outcome = run_ephemeral_pod(
        ctx,
        snapshot_pod(ctx, "list", site).container(list_container(&ctx.defaults.backup_image, &site.slug)),
    )
    .await?;
    Ok(parse_snapshot_listing(&outcome.logs))
}

async fn find_snapshot(ctx: &Context, site: &SiteRef, id: &str) -> Result<Snapshot> {
    validate_snapshot_id(id)?;
    list_unchecked(ctx, site)
        .await?
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| Error::not_found(format!("snapshot {id}")))
}

/// Restore the selected halves of one snapshot over the live site.
pub async fn restore_snapshot(
    ctx: &Context,
    site: &SiteRef,
    id: &str,
    req: RestoreRequest,
) -> Result<RestoreReport> {
    validate_snapshot_id(id)?;
    if !req.files && !req.db {
        return Err(Error::validation("nothing to restore: files and db both false"));
    }
    let _guard = ctx.locks.lock(site).await;
    let record = load_required(ctx, site).await?;
    let snapshot = find_snapshot(ctx, site, id).await?;

    let files = if req.files { snapshot.files_archive() } else { None };
    let db = if req.db { snapshot.db_dump() } else { None };
    if db.is_some() && !record.db.enabled {
        return Err(Error::conflict(
            "snapshot contains a database dump but the database add-on is disabled",
        ));
    }
    if files.is_none() && db.is_none() {
        return Err(Error::conflict(format!(
            "snapshot {id} has none of the requested parts"
        )));
    }

    run_ephemeral_pod(
        ctx,
        snapshot_pod(ctx, "restore", site)
            .container(restore_container(&ctx.defaults.backup_image, &site.slug, files, db)),
    )
    .await?;
    info!(ns = %site.namespace(), slug = %site.slug, %id, ?files, ?db, "snapshot restored");
    Ok(RestoreReport {
        id: id.to_string(),
        files_restored: files.map(String::from),
        db_restored: db.map(String::from),
    })
}

/// Remove both parts of one snapshot.
pub async fn delete_snapshot(ctx: &Context, site: &SiteRef, id: &str) -> Result<()> {
    validate_snapshot_id(id)?;
    let _guard = ctx.locks.lock(site).await;
    load_required(ctx, site).await?;
    find_snapshot(ctx, site, id).await?;
    run_ephemeral_pod(
        ctx,
        snapshot_pod(ctx, "delete", site)
            .container(delete_container(&ctx.defaults.backup_image, &site.slug, id)),
    )
    .await?;
    info!(ns = %site.namespace(), slug = %site.slug, %id, "snapshot deleted");
    Ok(())
}

/// Delete every archive of the site. Returns false when there is no backup
/// volume to clean. Callers hold the site lock.
pub async fn purge_snapshots(ctx: &Context, site: &SiteRef) -> Result<bool> {
    if !backup_volume_exists(ctx, &site.namespace()).await? {
        return Ok(false);
    }
    run_ephemeral_pod(
        ctx,
        snapshot_pod(ctx, "purge", site).container(purge_container(&ctx.defaults.backup_image, &site.slug)),
    )
    .await?;
    info!(ns = %site.namespace(), slug = %site.slug, "snapshots purged");
    Ok(true)
}
