//! CI-deploy add-on: stores a deploy token and triggers a workflow run
//! that builds and ships a new image for the site.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::context::{Context, SiteRef};
use crate::credentials;
use crate::error::{Error, Result};
use crate::metadata::{self, GithubFields, SiteRecord};
use crate::providers::github::validate_repo;
use crate::providers::WorkflowDispatch;
use crate::resources::secrets::registry_secret;
use crate::resources::{github_secret_name, site_labels, site_pull_secret_name};
use crate::site::load_required;

use super::{params, to_json, tracked, AddOn};

const TOKEN_KEY: &str = "GITHUB_TOKEN";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableGithubRequest {
    pub repo: String,
    pub token: String,
    pub branch: Option<String>,
    pub workflow: Option<String>,
    pub image: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchRequest {
    /// Branch or tag; the stored branch when unset.
    pub git_ref: Option<String>,
    /// Image the workflow should publish; the stored image when unset.
    pub image: Option<String>,
    /// Stored as the site's pull secret for this and later deploys.
    pub registry: Option<RegistryCredentials>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubStatus {
    pub enabled: bool,
    pub repo: String,
    pub branch: String,
    pub workflow: String,
    pub image: String,
    pub token_present: bool,
    pub pull_secret_present: bool,
    pub last_error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub repo: String,
    pub workflow: String,
    pub git_ref: String,
    pub image: String,
    pub dispatched_at: String,
}

fn mark_failed(record: &mut SiteRecord, msg: String) {
    record.github.last_error = msg;
}

async fn status_of(ctx: &Context, site: &SiteRef, gh: &GithubFields) -> Result<GithubStatus> {
    let ns = site.namespace();
    let cluster = ctx.cluster.as_ref();
    Ok(GithubStatus {
        enabled: gh.enabled,
        repo: gh.repo.clone(),
        branch: gh.branch.clone(),
        workflow: gh.workflow.clone(),
        image: gh.image.clone(),
        token_present: credentials::exists(cluster, &ns, &github_secret_name(&site.slug)).await?,
        pull_secret_present: credentials::exists(cluster, &ns, &site_pull_secret_name(&site.slug))
            .await?,
        last_error: gh.last_error.clone(),
    })
}

pub async fn github_status(ctx: &Context, site: &SiteRef) -> Result<GithubStatus> {
    let record = load_required(ctx, site).await?;
    status_of(ctx, site, &record.github).await
}

fn default_image(repo: &str) -> String {
    format!("ghcr.io/{}:latest", repo.to_ascii_lowercase())
}

pub async fn enable_github(
    ctx: &Context,
    site: &SiteRef,
    req: &EnableGithubRequest,
) -> Result<GithubStatus> {
    validate_repo(&req.repo)?;
    if req.token.trim().is_empty() {
        return Err(Error::validation("a deploy token is required"));
    }
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        credentials::put_values(
            ctx.cluster.as_ref(),
            &ns,
            &github_secret_name(&site.slug),
            site_labels(&site.slug, Some(&site.tenant_id)),
            &BTreeMap::from([(TOKEN_KEY.to_string(), req.token.trim().to_string())]),
        )
        .await?;
        record.github = GithubFields {
            enabled: true,
            repo: req.repo.clone(),
            branch: req
                .branch
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| ctx.defaults.ci_branch.clone()),
            workflow: req
                .workflow
                .clone()
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| ctx.defaults.ci_workflow.clone()),
            image: req
                .image
                .clone()
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| default_image(&req.repo)),
            last_error: String::new(),
        };
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, repo = %req.repo, "ci deploy enabled");
        status_of(ctx, site, &record.github).await
    })
    .await
}

/// Trigger the configured workflow with `slug`, `namespace` and `image`
/// inputs.
pub async fn dispatch(ctx: &Context, site: &SiteRef, req: &DispatchRequest) -> Result<DispatchReport> {
    let _guard = ctx.locks.lock(site).await;
    let record = load_required(ctx, site).await?;
    if !record.github.enabled {
        return Err(Error::conflict(format!(
            "ci deploy is not enabled for site {}",
            site.slug
        )));
    }
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let cluster = ctx.cluster.as_ref();
        let token = credentials::get_values(cluster, &ns, &github_secret_name(&site.slug))
            .await?
            .and_then(|v| v.get(TOKEN_KEY).cloned())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::conflict("deploy token missing, re-enable ci deploy"))?;

        if let Some(reg) = &req.registry {
            if reg.server.is_empty() || reg.username.is_empty() || reg.password.is_empty() {
                return Err(Error::validation("registry server, username and password are required"));
            }
            credentials::put_secret(
                cluster,
                registry_secret(
                    &ns,
                    &site_pull_secret_name(&site.slug),
                    site_labels(&site.slug, Some(&site.tenant_id)),
                    &reg.server,
                    &reg.username,
                    &reg.password,
                ),
            )
            .await?;
            info!(%site, server = %reg.server, "registry credentials stored");
        }

        let git_ref = req
            .git_ref
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| record.github.branch.clone());
        let image = req
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| record.github.image.clone());
        let run = WorkflowDispatch {
            repo: record.github.repo.clone(),
            git_ref: git_ref.clone(),
            workflow: record.github.workflow.clone(),
            inputs: BTreeMap::from([
                ("slug".to_string(), site.slug.clone()),
                ("namespace".to_string(), ns.clone()),
                ("image".to_string(), image.clone()),
            ]),
        };
        ctx.ci.dispatch(&run, &token).await?;

        let mut record = record.clone();
        record.github.last_error.clear();
        metadata::save_site(cluster, &ns, &record).await?;
        Ok(DispatchReport {
            repo: run.repo,
            workflow: run.workflow,
            git_ref,
            image,
            dispatched_at: crate::helpers::utc_now(),
        })
    })
    .await
}

/// Forget the token; repository settings stay for re-enabling.
pub async fn disable_github(ctx: &Context, site: &SiteRef) -> Result<GithubStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let mut record = load_required(ctx, site).await?;
        credentials::delete(ctx.cluster.as_ref(), &ns, &github_secret_name(&site.slug)).await?;
        record.github.enabled = false;
        record.github.last_error.clear();
        metadata::save_site(ctx.cluster.as_ref(), &ns, &record).await?;
        info!(%site, "ci deploy disabled");
        status_of(ctx, site, &record.github).await
    })
    .await
}

/// Drop the token, the stored registry credentials and all settings.
pub async fn purge_github(ctx: &Context, site: &SiteRef) -> Result<GithubStatus> {
    let _guard = ctx.locks.lock(site).await;
    tracked(ctx, site, mark_failed, async {
        let ns = site.namespace();
        let cluster = ctx.cluster.as_ref();
        let mut record = load_required(ctx, site).await?;
        credentials::delete(cluster, &ns, &github_secret_name(&site.slug)).await?;
        credentials::delete(cluster, &ns, &site_pull_secret_name(&site.slug)).await?;
        record.github = GithubFields::default();
        metadata::save_site(cluster, &ns, &record).await?;
        info!(%site, "ci deploy purged");
        status_of(ctx, site, &record.github).await
    })
    .await
}

pub struct Github;

#[async_trait]
impl AddOn for Github {
    async fn enable(&self, ctx: &Context, site: &SiteRef, p: Value) -> Result<Value> {
        to_json(&enable_github(ctx, site, &params(p)?).await?)
    }

    async fn disable(&self, ctx: &Context, site: &SiteRef, _: Value) -> Result<Value> {
        to_json(&disable_github(ctx, site).await?)
    }

    async fn purge(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&purge_github(ctx, site).await?)
    }

    async fn status(&self, ctx: &Context, site: &SiteRef) -> Result<Value> {
        to_json(&github_status(ctx, site).await?)
    }
}
