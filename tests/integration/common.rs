//! Shared harness for the integration tests.
//!
//! Every collaborator of the control plane is replaced by an in-memory fake
//! so tests run without a cluster, a database server or network access.
//! Each test builds its own [`TestEnv`], so tests are independent and can run
//! in parallel.
//!
//! The fake cluster has no kubelet. Snapshot pods are "executed" the moment
//! they are created: the fake reads the operation from the pod name, applies
//! it to a simulated backup volume and stores the logs the real scripts would
//! have printed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::ByteString;
use tracing_subscriber::EnvFilter;

use tenant_plane::cluster::{Cluster, ManagedObject, NamespaceRecord, ObjectKind};
use tenant_plane::context::{Context, SiteLocks, SiteRef};
use tenant_plane::error::{Error, Result};
use tenant_plane::helpers::ControlPlaneDefaults;
use tenant_plane::postgres::{DatabaseAdmin, DatabaseEndpoint, SiteDbProvision};
use tenant_plane::providers::{
    Alias, CiDispatcher, DnsProvider, MailProvider, Mailbox, NewMailbox, WorkflowDispatch,
};
use tenant_plane::resources::LABEL_SITE_SLUG;
use tenant_plane::site::{self, CreateSiteRequest};
use tenant_plane::tenant;

// ═══════════════════════════════════════════════════════════════════════════════
// Fake cluster
// ═══════════════════════════════════════════════════════════════════════════════

type ObjectKey = (ObjectKind, String, String);

/// One archive file on the simulated backup volume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveFile {
    pub name: String,
    pub size: u64,
}

/// What a restore pod was asked to restore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreCall {
    pub ns: String,
    pub slug: String,
    pub files_archive: String,
    pub db_dump: String,
}

#[derive(Default)]
pub struct ClusterState {
    pub namespaces: BTreeMap<String, NamespaceEntry>,
    pub objects: BTreeMap<ObjectKey, ManagedObject>,
    revision: u64,
    /// `(namespace, slug)` → files in that site's backup directory.
    pub backups: BTreeMap<(String, String), Vec<ArchiveFile>>,
    /// Names of every snapshot pod ever created, in order.
    pub pods_started: Vec<String>,
    pub pod_logs: BTreeMap<(String, String), String>,
    pub restores: Vec<RestoreCall>,
    /// Snapshot operations (`list`, `restore`, ...) whose pods fail.
    pub failing_ops: BTreeSet<String>,
    /// Snapshot operations whose pods never leave `Pending`.
    pub stuck_ops: BTreeSet<String>,
    /// Secrets whose reads return a tampered `DB_PASSWORD`.
    pub tampered_secrets: BTreeSet<String>,
    /// How many upcoming replaces lose an optimistic-concurrency race.
    pub replace_conflicts: usize,
    /// Every replace attempted, including the ones that conflicted.
    pub replace_calls: usize,
}

/// The 409 the API server returns when a resourceVersion is stale.
fn stale_version(what: String) -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{what} was modified, please apply your changes to the latest version"),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

#[derive(Clone, Debug, Default)]
pub struct NamespaceEntry {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|l| l == v),
            None => labels.contains_key(term),
        })
}

fn key_of(obj: &ManagedObject) -> ObjectKey {
    (obj.kind(), obj.namespace().to_string(), obj.name().to_string())
}

fn pod_env(pod: &Pod) -> BTreeMap<String, String> {
    pod.spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .flat_map(|c| c.env.iter().flatten())
        .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
        .collect()
}

impl ClusterState {
    /// Apply a snapshot pod's operation to the simulated volume. Returns the
    /// resulting phase; logs are stored for `pod_logs`.
    fn execute_pod(&mut self, ns: &str, pod: &Pod) -> String {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods_started.push(name.clone());
        let op = name
            .strip_prefix("snap-")
            .and_then(|rest| rest.split('-').next())
            .unwrap_or_default()
            .to_string();
        let slug = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SITE_SLUG))
            .cloned()
            .unwrap_or_default();
        let env = pod_env(pod);

        if self.stuck_ops.contains(&op) {
            return "Pending".to_string();
        }
        if self.failing_ops.contains(&op) {
            self.pod_logs
                .insert((ns.to_string(), name), "ERROR simulated failure\n".to_string());
            return "Failed".to_string();
        }

        let files = self.backups.entry((ns.to_string(), slug.clone())).or_default();
        let logs = match op.as_str() {
            "list" => files
                .iter()
                .map(|f| format!("FILE {} {} {:064x}\n", f.name, f.size, f.size))
                .collect(),
            "delete" => {
                let id = env.get("SNAPSHOT_ID").cloned().unwrap_or_default();
                files.retain(|f| !f.name.starts_with(&id));
                format!("DELETED {id}\n")
            }
            "purge" => {
                files.clear();
                "PURGED\n".to_string()
            }
            "restore" => {
                self.restores.push(RestoreCall {
                    ns: ns.to_string(),
                    slug,
                    files_archive: env.get("FILES_ARCHIVE").cloned().unwrap_or_default(),
                    db_dump: env.get("DB_DUMP").cloned().unwrap_or_default(),
                });
                "RESTORED\n".to_string()
            }
            _ => String::new(),
        };
        self.pod_logs.insert((ns.to_string(), name), logs);
        "Succeeded".to_string()
    }
}

impl FakeCluster {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn annotations(&self, ns: &str) -> BTreeMap<String, String> {
        self.lock()
            .namespaces
            .get(ns)
            .map(|n| n.annotations.clone())
            .unwrap_or_default()
    }

    pub fn has_namespace(&self, ns: &str) -> bool {
        self.lock().namespaces.contains_key(ns)
    }

    pub fn object(&self, kind: ObjectKind, ns: &str, name: &str) -> Option<ManagedObject> {
        self.lock()
            .objects
            .get(&(kind, ns.to_string(), name.to_string()))
            .cloned()
    }

    pub fn has(&self, kind: ObjectKind, ns: &str, name: &str) -> bool {
        self.object(kind, ns, name).is_some()
    }

    pub fn count(&self, kind: ObjectKind, ns: &str) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|(k, n, _)| *k == kind && n == ns)
            .count()
    }

    pub fn seed_archives(&self, ns: &str, slug: &str, files: &[(&str, u64)]) {
        let mut state = self.lock();
        let dir = state
            .backups
            .entry((ns.to_string(), slug.to_string()))
            .or_default();
        for (name, size) in files {
            dir.push(ArchiveFile {
                name: name.to_string(),
                size: *size,
            });
        }
    }

    pub fn archives(&self, ns: &str, slug: &str) -> Vec<String> {
        self.lock()
            .backups
            .get(&(ns.to_string(), slug.to_string()))
            .map(|files| files.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Mark a deployment as having `ready` ready replicas.
    pub fn set_ready_replicas(&self, ns: &str, name: &str, ready: i32) {
        let mut state = self.lock();
        let key = (ObjectKind::Deployment, ns.to_string(), name.to_string());
        if let Some(ManagedObject::Deployment(dep)) = state.objects.get_mut(&key) {
            dep.status.get_or_insert_with(Default::default).ready_replicas = Some(ready);
        }
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn ensure_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<bool> {
        let mut state = self.lock();
        if state.namespaces.contains_key(name) {
            return Ok(false);
        }
        state.namespaces.insert(
            name.to_string(),
            NamespaceEntry {
                labels: labels.clone(),
                annotations: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.namespaces.remove(name);
        state.objects.retain(|(_, ns, _), _| ns != name);
        state.backups.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>> {
        Ok(self.lock().namespaces.get(name).map(|n| NamespaceRecord {
            name: name.to_string(),
            annotations: n.annotations.clone(),
        }))
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        changes: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("namespace {name}")))?;
        for (k, v) in changes {
            match v {
                Some(v) => {
                    entry.annotations.insert(k.clone(), v.clone());
                }
                None => {
                    entry.annotations.remove(k);
                }
            }
        }
        Ok(())
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<NamespaceRecord>> {
        Ok(self
            .lock()
            .namespaces
            .iter()
            .filter(|(_, n)| matches_selector(&n.labels, label_selector))
            .map(|(name, n)| NamespaceRecord {
                name: name.clone(),
                annotations: n.annotations.clone(),
            })
            .collect())
    }

    async fn get(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<Option<ManagedObject>> {
        let state = self.lock();
        let Some(mut obj) = state
            .objects
            .get(&(kind, ns.to_string(), name.to_string()))
            .cloned()
        else {
            return Ok(None);
        };
        if let ManagedObject::Secret(secret) = &mut obj {
            if state.tampered_secrets.contains(name) {
                if let Some(data) = secret.data.as_mut() {
                    data.insert(
                        "DB_PASSWORD".to_string(),
                        ByteString(b"tampered".to_vec()),
                    );
                }
            }
        }
        Ok(Some(obj))
    }

    async fn list(
        &self,
        kind: ObjectKind,
        ns: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((k, n, _), obj)| {
                *k == kind && n == ns && matches_selector(&obj.labels(), label_selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let mut state = self.lock();
        let key = key_of(obj);
        if !state.namespaces.contains_key(&key.1) {
            return Err(Error::not_found(format!("namespace {}", key.1)));
        }
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(format!("{} {}/{} already exists", key.0, key.1, key.2)));
        }
        state.revision += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(state.revision.to_string());
        if let ManagedObject::Pod(pod) = &mut stored {
            let phase = state.execute_pod(&key.1, pod);
            pod.status = Some(PodStatus {
                phase: Some(phase),
                ..Default::default()
            });
        }
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let mut state = self.lock();
        let key = key_of(obj);
        state.replace_calls += 1;
        if state.replace_conflicts > 0 {
            state.replace_conflicts -= 1;
            return Err(stale_version(format!("{} {}/{}", key.0, key.1, key.2)));
        }
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found(format!("{} {}/{}", key.0, key.1, key.2)))?;
        if obj.meta().resource_version != current.meta().resource_version {
            return Err(stale_version(format!("{} {}/{}", key.0, key.1, key.2)));
        }
        state.revision += 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(state.revision.to_string());
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<()> {
        self.lock()
            .objects
            .remove(&(kind, ns.to_string(), name.to_string()));
        Ok(())
    }

    async fn pod_logs(&self, ns: &str, name: &str) -> Result<String> {
        Ok(self
            .lock()
            .pod_logs
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake database server
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct DbState {
    /// Tenant role → password.
    pub tenants: BTreeMap<String, String>,
    pub roles: BTreeSet<String>,
    /// Database → owner.
    pub databases: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct FakeDb {
    pub state: Mutex<DbState>,
    pub fail_tenant: AtomicBool,
}

impl FakeDb {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDb {
    fn endpoint(&self) -> DatabaseEndpoint {
        DatabaseEndpoint {
            host: "postgres.shared.svc".to_string(),
            port: 5432,
            database: "tenants".to_string(),
        }
    }

    async fn ensure_tenant(&self, role: &str, password: &str) -> Result<()> {
        if self.fail_tenant.load(Ordering::SeqCst) {
            return Err(Error::Platform("simulated database outage".to_string()));
        }
        self.lock()
            .tenants
            .insert(role.to_string(), password.to_string());
        Ok(())
    }

    async fn drop_tenant(&self, role: &str) -> Result<()> {
        self.lock().tenants.remove(role);
        Ok(())
    }

    async fn ensure_site_database(
        &self,
        database: &str,
        user: &str,
        _password: &str,
    ) -> Result<SiteDbProvision> {
        let mut state = self.lock();
        let role_created = state.roles.insert(user.to_string());
        let database_created = !state.databases.contains_key(database);
        state
            .databases
            .insert(database.to_string(), user.to_string());
        Ok(SiteDbProvision {
            role_created,
            database_created,
        })
    }

    async fn drop_site_database(&self, database: &str, user: &str) -> Result<()> {
        let mut state = self.lock();
        state.databases.remove(database);
        state.roles.remove(user);
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool> {
        Ok(self.lock().databases.contains_key(database))
    }

    async fn drop_database(&self, database: &str) -> Result<()> {
        self.lock().databases.remove(database);
        Ok(())
    }

    async fn drop_role(&self, role: &str) -> Result<()> {
        self.lock().roles.remove(role);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake mail, DNS and CI providers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MailState {
    /// Domain → active.
    pub domains: BTreeMap<String, bool>,
    pub mailboxes: BTreeMap<String, Mailbox>,
    pub aliases: BTreeMap<String, Alias>,
}

#[derive(Default)]
pub struct FakeMail {
    pub state: Mutex<MailState>,
    pub fail: AtomicBool,
}

impl FakeMail {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, MailState> {
        self.state.lock().unwrap()
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::provider("mail", "simulated outage"));
        }
        Ok(())
    }
}

fn in_domain(address: &str, domain: &str) -> bool {
    address.rsplit_once('@').is_some_and(|(_, d)| d == domain)
}

#[async_trait]
impl MailProvider for FakeMail {
    fn name(&self) -> &str {
        "mailcow"
    }

    async fn ensure_domain(&self, domain: &str) -> Result<()> {
        self.check()?;
        self.lock().domains.entry(domain.to_string()).or_insert(false);
        Ok(())
    }

    async fn domain_active(&self, domain: &str) -> Result<Option<bool>> {
        self.check()?;
        Ok(self.lock().domains.get(domain).copied())
    }

    async fn activate_domain(&self, domain: &str) -> Result<()> {
        self.check()?;
        self.lock().domains.insert(domain.to_string(), true);
        Ok(())
    }

    async fn deactivate_domain(&self, domain: &str) -> Result<()> {
        self.check()?;
        self.lock().domains.insert(domain.to_string(), false);
        Ok(())
    }

    async fn purge_domain(&self, domain: &str) -> Result<()> {
        self.check()?;
        let mut state = self.lock();
        state.domains.remove(domain);
        state.mailboxes.retain(|a, _| !in_domain(a, domain));
        state.aliases.retain(|a, _| !in_domain(a, domain));
        Ok(())
    }

    async fn list_mailboxes(&self, domain: &str) -> Result<Vec<Mailbox>> {
        self.check()?;
        Ok(self
            .lock()
            .mailboxes
            .values()
            .filter(|m| in_domain(&m.address, domain))
            .cloned()
            .collect())
    }

    async fn create_mailbox(&self, domain: &str, mailbox: &NewMailbox) -> Result<Mailbox> {
        self.check()?;
        let created = Mailbox {
            address: format!("{}@{domain}", mailbox.local_part),
            name: mailbox.name.clone(),
            quota_mb: mailbox.quota_mb,
            active: true,
        };
        self.lock()
            .mailboxes
            .insert(created.address.clone(), created.clone());
        Ok(created)
    }

    async fn delete_mailbox(&self, address: &str) -> Result<()> {
        self.check()?;
        self.lock().mailboxes.remove(address);
        Ok(())
    }

    async fn list_aliases(&self, domain: &str) -> Result<Vec<Alias>> {
        self.check()?;
        Ok(self
            .lock()
            .aliases
            .values()
            .filter(|a| in_domain(&a.address, domain))
            .cloned()
            .collect())
    }

    async fn create_alias(&self, alias: &Alias) -> Result<Alias> {
        self.check()?;
        self.lock()
            .aliases
            .insert(alias.address.clone(), alias.clone());
        Ok(alias.clone())
    }

    async fn delete_alias(&self, address: &str) -> Result<()> {
        self.check()?;
        self.lock().aliases.remove(address);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDns {
    /// Zone → target address.
    pub zones: Mutex<BTreeMap<String, String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn ensure_zone(&self, domain: &str, target: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::provider("dns", "simulated outage"));
        }
        self.zones
            .lock()
            .unwrap()
            .insert(domain.to_string(), target.to_string());
        Ok(())
    }

    async fn zone_exists(&self, domain: &str) -> Result<bool> {
        Ok(self.zones.lock().unwrap().contains_key(domain))
    }

    async fn remove_zone(&self, domain: &str) -> Result<()> {
        self.zones.lock().unwrap().remove(domain);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCi {
    /// Every dispatched run with the token it was sent with.
    pub runs: Mutex<Vec<(WorkflowDispatch, String)>>,
}

#[async_trait]
impl CiDispatcher for FakeCi {
    async fn dispatch(&self, run: &WorkflowDispatch, token: &str) -> Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((run.clone(), token.to_string()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-test environment
// ═══════════════════════════════════════════════════════════════════════════════

pub const USER: &str = "u1";
pub const DOMAIN: &str = "app.example.com";
pub const SLUG: &str = "app-example-com";
pub const NS: &str = "tenant-u1";

pub fn test_defaults() -> ControlPlaneDefaults {
    ControlPlaneDefaults {
        snapshot_poll_interval: Duration::from_millis(5),
        snapshot_timeout: Duration::from_secs(5),
        dns_target: "203.0.113.10".to_string(),
        ..Default::default()
    }
}

pub struct TestEnv {
    pub ctx: Arc<Context>,
    pub cluster: Arc<FakeCluster>,
    pub db: Arc<FakeDb>,
    pub mail: Arc<FakeMail>,
    pub dns: Arc<FakeDns>,
    pub ci: Arc<FakeCi>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_defaults(test_defaults())
    }

    pub fn with_defaults(defaults: ControlPlaneDefaults) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new("warn,tenant_plane=debug"))
            .with_test_writer()
            .try_init();

        let cluster = Arc::new(FakeCluster::default());
        let db = Arc::new(FakeDb::default());
        let mail = Arc::new(FakeMail::default());
        let dns = Arc::new(FakeDns::default());
        let ci = Arc::new(FakeCi::default());
        let ctx = Arc::new(Context {
            cluster: cluster.clone(),
            db: db.clone(),
            mail: mail.clone(),
            dns: dns.clone(),
            ci: ci.clone(),
            defaults,
            locks: SiteLocks::default(),
        });
        Self {
            ctx,
            cluster,
            db,
            mail,
            dns,
            ci,
        }
    }

    pub fn site(&self) -> SiteRef {
        SiteRef::new(USER, SLUG).unwrap()
    }

    /// Tenant `u1` with the site `app.example.com`.
    pub async fn with_site() -> Self {
        let env = Self::new();
        tenant::create_tenant(&env.ctx, USER).await.unwrap();
        site::create_site(&env.ctx, USER, &CreateSiteRequest::new(DOMAIN))
            .await
            .unwrap();
        env
    }
}
