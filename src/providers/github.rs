//! CI seam and the GitHub Actions `workflow_dispatch` client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

use crate::error::{Error, Result};

use super::{Auth, HttpApi};

/// One workflow run request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowDispatch {
    /// `owner/name`
    pub repo: String,
    pub git_ref: String,
    /// Workflow file name or id, e.g. `deploy.yml`.
    pub workflow: String,
    pub inputs: BTreeMap<String, String>,
}

#[async_trait]
pub trait CiDispatcher: Send + Sync {
    async fn dispatch(&self, run: &WorkflowDispatch, token: &str) -> Result<()>;
}

/// `owner/name` with both halves non-empty and free of path separators.
pub fn validate_repo(repo: &str) -> Result<()> {
    let ok = repo.split_once('/').is_some_and(|(owner, name)| {
        let part = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        part(owner) && part(name)
    });
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid repository {repo:?}, expected owner/name")))
    }
}

pub struct GithubDispatcher {
    api: HttpApi,
}

impl GithubDispatcher {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            api: HttpApi::new("github", base_url)?,
        })
    }
}

#[async_trait]
impl CiDispatcher for GithubDispatcher {
    async fn dispatch(&self, run: &WorkflowDispatch, token: &str) -> Result<()> {
        let path = format!(
            "/repos/{}/actions/workflows/{}/dispatches",
            run.repo, run.workflow
        );
        let req = self
            .api
            .request(Method::POST, &path, &Auth::Bearer(token.to_string()))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&json!({ "ref": run.git_ref, "inputs": run.inputs }));
        self.api.send(req).await?;
        info!(repo = %run.repo, workflow = %run.workflow, git_ref = %run.git_ref, "workflow dispatched");
        Ok(())
    }
}
