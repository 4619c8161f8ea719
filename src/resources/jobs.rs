//! Batch work against the tenant's shared volumes: the recurring backup
//! CronJob, one-shot backup Jobs and short-lived snapshot pods.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec},
    core::v1::{
        Container, EnvFromSource, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
        PodTemplateSpec, SecretEnvSource, Volume, VolumeMount,
    },
};
use kube::api::ObjectMeta;

use super::tenant::{BACKUP_VOLUME_CLAIM, HOME_VOLUME_CLAIM};
use super::{db_secret_name, site_labels};

const BACKUP_SCRIPT: &str = include_str!("../../scripts/backup.sh");
const LIST_SCRIPT: &str = include_str!("../../scripts/list-snapshots.sh");
const RESTORE_SCRIPT: &str = include_str!("../../scripts/restore.sh");
const DELETE_SCRIPT: &str = include_str!("../../scripts/delete-snapshot.sh");
const PURGE_SCRIPT: &str = include_str!("../../scripts/purge-snapshots.sh");

pub const BACKUP_MOUNT: &str = "/backups";
pub const HOME_MOUNT: &str = "/srv/home";

/// Shorthand for a plain-value `EnvVar`.
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mounts(home_read_only: bool) -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: "home".into(),
            mount_path: HOME_MOUNT.into(),
            read_only: Some(home_read_only),
            ..Default::default()
        },
        VolumeMount {
            name: "backups".into(),
            mount_path: BACKUP_MOUNT.into(),
            ..Default::default()
        },
    ]
}

/// Database credentials are injected from the site's optional db secret.
fn db_env_from(slug: &str) -> Vec<EnvFromSource> {
    vec![EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: db_secret_name(slug),
            optional: Some(true),
        }),
        ..Default::default()
    }]
}

fn shell_container(name: &str, image: &str, script: &str, env: Vec<EnvVar>) -> Container {
    Container {
        name: name.into(),
        image: Some(image.into()),
        command: Some(vec!["/bin/sh".into(), "-c".into(), script.into()]),
        env: Some(env),
        ..Default::default()
    }
}

pub fn backup_container(image: &str, slug: &str, retention_days: u32, db_enabled: bool) -> Container {
    Container {
        env_from: Some(db_env_from(slug)),
        volume_mounts: Some(mounts(true)),
        ..shell_container(
            "backup",
            image,
            BACKUP_SCRIPT,
            vec![
                env("SITE_SLUG", slug),
                env("RETENTION_DAYS", retention_days.to_string()),
                env("DB_ENABLED", db_enabled.to_string()),
            ],
        )
    }
}

pub fn list_container(image: &str, slug: &str) -> Container {
    Container {
        volume_mounts: Some(mounts(true)),
        ..shell_container("list", image, LIST_SCRIPT, vec![env("SITE_SLUG", slug)])
    }
}

/// `files_archive` / `db_dump` are file names inside the site's backup
/// directory; `None` skips that half of the restore.
pub fn restore_container(
    image: &str,
    slug: &str,
    files_archive: Option<&str>,
    db_dump: Option<&str>,
) -> Container {
    Container {
        env_from: Some(db_env_from(slug)),
        volume_mounts: Some(mounts(false)),
        ..shell_container(
            "restore",
            image,
            RESTORE_SCRIPT,
            vec![
                env("SITE_SLUG", slug),
                env("FILES_ARCHIVE", files_archive.unwrap_or_default()),
                env("DB_DUMP", db_dump.unwrap_or_default()),
            ],
        )
    }
}

pub fn delete_container(image: &str, slug: &str, snapshot_id: &str) -> Container {
    Container {
        volume_mounts: Some(mounts(true)),
        ..shell_container(
            "delete",
            image,
            DELETE_SCRIPT,
            vec![env("SITE_SLUG", slug), env("SNAPSHOT_ID", snapshot_id)],
        )
    }
}

pub fn purge_container(image: &str, slug: &str) -> Container {
    Container {
        volume_mounts: Some(mounts(true)),
        ..shell_container("purge", image, PURGE_SCRIPT, vec![env("SITE_SLUG", slug)])
    }
}

// ── SiteJobBuilder ──────────────────────────────────────────────────────────

/// Builder for the batch objects that touch a site's backups.
///
/// Encapsulates what every such object shares (site labels, the home and
/// backup volume pair, never-restart policy) and lets callers specify only
/// the container and deadline, then pick the object kind:
///
/// ```ignore
/// let pod = SiteJobBuilder::new("snap-list-app-1", ns, "app")
///     .container(list_container(image, "app"))
///     .build_pod();
/// ```
pub struct SiteJobBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    containers: Vec<Container>,
    active_deadline: Option<i64>,
}

impl SiteJobBuilder {
    pub fn new(name: &str, ns: &str, slug: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: ns.to_string(),
            labels: site_labels(slug, None),
            containers: vec![],
            active_deadline: None,
        }
    }

    pub fn container(mut self, container: Container) -> Self {
        self.containers.push(container);
        self
    }

    /// Set `activeDeadlineSeconds` on the pod (or job).
    pub fn active_deadline(mut self, seconds: i64) -> Self {
        self.active_deadline = Some(seconds);
        self
    }

    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            ..Default::default()
        }
    }

    fn pod_spec(&self) -> PodSpec {
        PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![
                claim_volume("home", HOME_VOLUME_CLAIM),
                claim_volume("backups", BACKUP_VOLUME_CLAIM),
            ]),
            containers: self.containers.clone(),
            ..Default::default()
        }
    }

    fn job_spec(&self) -> JobSpec {
        JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(3600),
            active_deadline_seconds: self.active_deadline,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(self.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(self.pod_spec()),
            },
            ..Default::default()
        }
    }

    pub fn build_job(self) -> Job {
        Job {
            metadata: self.meta(),
            spec: Some(self.job_spec()),
            ..Default::default()
        }
    }

    pub fn build_cron_job(self, schedule: &str) -> CronJob {
        CronJob {
            metadata: self.meta(),
            spec: Some(CronJobSpec {
                schedule: schedule.to_string(),
                concurrency_policy: Some("Forbid".to_string()),
                successful_jobs_history_limit: Some(3),
                failed_jobs_history_limit: Some(3),
                job_template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(self.job_spec()),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build_pod(self) -> Pod {
        let mut spec = self.pod_spec();
        spec.active_deadline_seconds = self.active_deadline;
        Pod {
            metadata: self.meta(),
            spec: Some(spec),
            ..Default::default()
        }
    }
}
