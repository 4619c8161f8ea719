//! tenant-plane — control plane for multi-tenant site hosting on Kubernetes.
//!
//! One process serving the HTTP API; every state change happens inside a
//! request, there is no background reconciliation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::info;
use warp::Filter;

use tenant_plane::api;
use tenant_plane::cluster::{Cluster, KubeCluster};
use tenant_plane::context::{Context, SiteLocks};
use tenant_plane::helpers::ControlPlaneDefaults;
use tenant_plane::postgres::{load_server_config, PgDatabaseAdmin};
use tenant_plane::providers::{GithubDispatcher, MailcowClient, PowerDnsClient};

#[derive(Parser, Debug)]
#[command(
    name = "tenant-plane",
    about = "Control plane for multi-tenant site hosting"
)]
struct Args {
    /// Namespace the control plane runs in (shared secrets live here).
    #[arg(long, env = "CONTROL_NAMESPACE")]
    control_namespace: String,

    /// Image every new site runs until its first deploy.
    #[arg(
        long,
        default_value = "nginxinc/nginx-unprivileged:stable-alpine",
        env = "PLACEHOLDER_IMAGE"
    )]
    placeholder_image: String,

    #[arg(long, default_value = "8080", env = "PLACEHOLDER_PORT")]
    placeholder_port: i32,

    /// Registry pull secret copied from the control namespace into tenants.
    /// Empty disables copying.
    #[arg(long, default_value = "registry-pull", env = "REGISTRY_PULL_SECRET")]
    registry_pull_secret: String,

    /// StorageClass for tenant home and backup volumes.
    #[arg(long, default_value = "standard", env = "STORAGE_CLASS")]
    storage_class: String,

    #[arg(long, default_value = "10Gi", env = "HOME_VOLUME_SIZE")]
    home_volume_size: String,

    #[arg(long, default_value = "20Gi", env = "BACKUP_VOLUME_SIZE")]
    backup_volume_size: String,

    /// IngressClass for site routes.
    #[arg(long, default_value = "traefik", env = "INGRESS_CLASS")]
    ingress_class: String,

    /// Accepted cert-manager ClusterIssuers, comma separated.
    #[arg(
        long,
        default_value = "letsencrypt-prod,letsencrypt-staging",
        env = "TLS_ISSUERS",
        value_delimiter = ','
    )]
    tls_issuers: Vec<String>,

    #[arg(long, default_value = "letsencrypt-prod", env = "DEFAULT_TLS_ISSUER")]
    default_tls_issuer: String,

    #[arg(long, default_value = "4", env = "TENANT_QUOTA_CPU")]
    quota_cpu: String,

    #[arg(long, default_value = "8Gi", env = "TENANT_QUOTA_MEMORY")]
    quota_memory: String,

    #[arg(long, default_value = "20", env = "TENANT_QUOTA_PODS")]
    quota_pods: String,

    #[arg(long, default_value = "50Gi", env = "TENANT_QUOTA_STORAGE")]
    quota_storage: String,

    /// Namespace of the ingress router allowed through tenant isolation.
    #[arg(long, default_value = "kube-system", env = "ROUTER_NAMESPACE")]
    router_namespace: String,

    /// Image for backup, restore and snapshot pods.
    #[arg(long, default_value = "postgres:16-alpine", env = "BACKUP_IMAGE")]
    backup_image: String,

    #[arg(long, default_value = "0 3 * * *", env = "BACKUP_SCHEDULE")]
    backup_schedule: String,

    #[arg(long, default_value = "7", env = "BACKUP_RETENTION_DAYS")]
    backup_retention_days: u32,

    /// Ceiling for one snapshot list/restore/delete pod, in seconds.
    #[arg(long, default_value = "1800", env = "SNAPSHOT_TIMEOUT_SECONDS")]
    snapshot_timeout_seconds: u64,

    /// IPv4 address DNS records point at unless a site asks otherwise.
    #[arg(long, default_value = "127.0.0.1", env = "DNS_TARGET")]
    dns_target: String,

    #[arg(long, env = "MAIL_API_URL")]
    mail_api_url: String,

    #[arg(long, env = "MAIL_API_KEY", hide_env_values = true)]
    mail_api_key: String,

    #[arg(long, env = "DNS_API_URL")]
    dns_api_url: String,

    #[arg(long, env = "DNS_API_KEY", hide_env_values = true)]
    dns_api_key: String,

    /// Nameservers written into new zones, comma separated.
    #[arg(long, default_value = "", env = "DNS_NAMESERVERS", value_delimiter = ',')]
    dns_nameservers: Vec<String>,

    #[arg(long, default_value = "https://api.github.com", env = "GITHUB_API_URL")]
    github_api_url: String,

    #[arg(long, default_value = "deploy.yml", env = "CI_WORKFLOW")]
    ci_workflow: String,

    #[arg(long, default_value = "main", env = "CI_BRANCH")]
    ci_branch: String,

    /// Secret in the control namespace holding the PostgreSQL server config.
    #[arg(long, default_value = "postgres-server", env = "POSTGRES_SECRET")]
    postgres_secret: String,

    /// Bind address for the API and the health probes.
    #[arg(long, default_value = ":8080", env = "BIND_ADDRESS")]
    bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

impl Args {
    fn defaults(&self) -> ControlPlaneDefaults {
        ControlPlaneDefaults {
            control_namespace: self.control_namespace.clone(),
            placeholder_image: self.placeholder_image.clone(),
            placeholder_port: self.placeholder_port,
            registry_pull_secret: self.registry_pull_secret.clone(),
            storage_class: self.storage_class.clone(),
            home_volume_size: self.home_volume_size.clone(),
            backup_volume_size: self.backup_volume_size.clone(),
            ingress_class: self.ingress_class.clone(),
            tls_issuers: self.tls_issuers.clone(),
            default_tls_issuer: self.default_tls_issuer.clone(),
            quota_cpu: self.quota_cpu.clone(),
            quota_memory: self.quota_memory.clone(),
            quota_pods: self.quota_pods.clone(),
            quota_storage: self.quota_storage.clone(),
            router_namespace: self.router_namespace.clone(),
            backup_image: self.backup_image.clone(),
            backup_schedule: self.backup_schedule.clone(),
            backup_retention_days: self.backup_retention_days,
            dns_target: self.dns_target.clone(),
            ci_workflow: self.ci_workflow.clone(),
            ci_branch: self.ci_branch.clone(),
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_seconds),
            ..Default::default()
        }
    }
}

/// Accepts ":8080" as shorthand for "0.0.0.0:8080".
fn parse_bind_address(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| raw.to_string())
        .parse()
        .with_context(|| format!("invalid --bind-address {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let mut defaults = args.defaults();
    let addr = parse_bind_address(&args.bind_address)?;

    let client = Client::try_default().await?;
    let cluster: Arc<dyn Cluster> = Arc::new(KubeCluster::new(client));

    let pg_config = load_server_config(
        cluster.as_ref(),
        &defaults.control_namespace,
        &args.postgres_secret,
    )
    .await
    .context("loading PostgreSQL server config")?;
    defaults.database_port = pg_config.port;

    info!(
        ns = %defaults.control_namespace,
        pg_host = %pg_config.host,
        %addr,
        "starting tenant-plane"
    );

    let ctx = Arc::new(Context {
        cluster,
        db: Arc::new(PgDatabaseAdmin::new(pg_config)),
        mail: Arc::new(MailcowClient::new(&args.mail_api_url, &args.mail_api_key)?),
        dns: Arc::new(PowerDnsClient::new(
            &args.dns_api_url,
            &args.dns_api_key,
            args.dns_nameservers
                .iter()
                .filter(|ns| !ns.is_empty())
                .cloned()
                .collect(),
        )?),
        ci: Arc::new(GithubDispatcher::new(&args.github_api_url)?),
        defaults,
        locks: SiteLocks::default(),
    });

    let routes = api::routes(ctx)
        .recover(api::handle_rejection)
        .with(warp::trace::request());

    tokio::select! {
        _ = warp::serve(routes).run(addr) => {},
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
