use tenant_plane::addons::github::{
    disable_github, dispatch, enable_github, github_status, purge_github, DispatchRequest,
    EnableGithubRequest, RegistryCredentials,
};
use tenant_plane::cluster::ObjectKind;
use tenant_plane::credentials;
use tenant_plane::resources::{deployment_name, github_secret_name, site_pull_secret_name};
use tenant_plane::site::{deploy_site, DeployRequest};

use super::common::*;

fn enable_req() -> EnableGithubRequest {
    EnableGithubRequest {
        repo: "acme/shop".into(),
        token: "ghp_example".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn enable_stores_token_and_defaults() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let status = enable_github(&env.ctx, &env.site(), &enable_req()).await?;

    assert!(status.enabled);
    assert!(status.token_present);
    assert!(!status.pull_secret_present);
    assert_eq!(status.branch, "main");
    assert_eq!(status.workflow, "deploy.yml");
    assert_eq!(status.image, "ghcr.io/acme/shop:latest");

    let values = credentials::get_values(env.cluster.as_ref(), NS, &github_secret_name(SLUG))
        .await?
        .unwrap();
    assert_eq!(values["GITHUB_TOKEN"], "ghp_example");
    Ok(())
}

#[tokio::test]
async fn enable_requires_repo_and_token() {
    let env = TestEnv::with_site().await;
    let mut req = enable_req();
    req.token = "  ".into();
    assert_eq!(
        enable_github(&env.ctx, &env.site(), &req).await.unwrap_err().status_code(),
        400
    );

    let mut req = enable_req();
    req.repo = "no-slash".into();
    assert_eq!(
        enable_github(&env.ctx, &env.site(), &req).await.unwrap_err().status_code(),
        400
    );
    assert!(!env.cluster.has(ObjectKind::Secret, NS, &github_secret_name(SLUG)));
}

#[tokio::test]
async fn dispatch_before_enable_is_a_conflict() {
    let env = TestEnv::with_site().await;
    let err = dispatch(&env.ctx, &env.site(), &DispatchRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert!(env.ci.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_sends_site_inputs_with_token() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    enable_github(&env.ctx, &env.site(), &enable_req()).await?;

    let req = DispatchRequest {
        git_ref: Some("v1.2.0".into()),
        ..Default::default()
    };
    let report = dispatch(&env.ctx, &env.site(), &req).await?;
    assert_eq!(report.repo, "acme/shop");
    assert_eq!(report.git_ref, "v1.2.0");
    assert_eq!(report.image, "ghcr.io/acme/shop:latest");

    let runs = env.ci.runs.lock().unwrap();
    let (run, token) = &runs[0];
    assert_eq!(token, "ghp_example");
    assert_eq!(run.workflow, "deploy.yml");
    assert_eq!(run.inputs["slug"], SLUG);
    assert_eq!(run.inputs["namespace"], NS);
    assert_eq!(run.inputs["image"], "ghcr.io/acme/shop:latest");
    Ok(())
}

#[tokio::test]
async fn registry_credentials_feed_later_deploys() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_github(&env.ctx, &site, &enable_req()).await?;

    let req = DispatchRequest {
        registry: Some(RegistryCredentials {
            server: "ghcr.io".into(),
            username: "acme-bot".into(),
            password: "registry-secret".into(),
        }),
        ..Default::default()
    };
    dispatch(&env.ctx, &site, &req).await?;
    assert!(env.cluster.has(ObjectKind::Secret, NS, &site_pull_secret_name(SLUG)));
    assert!(github_status(&env.ctx, &site).await?.pull_secret_present);

    deploy_site(
        &env.ctx,
        &site,
        &DeployRequest {
            image: "ghcr.io/acme/shop:v2".into(),
            container_port: 8080,
            run_as_root: None,
        },
    )
    .await?;
    let pull = env
        .cluster
        .object(ObjectKind::Deployment, NS, &deployment_name(SLUG))
        .and_then(|o| o.into_deployment())
        .and_then(|d| d.spec)
        .and_then(|s| s.template.spec)
        .and_then(|p| p.image_pull_secrets)
        .unwrap_or_default();
    assert_eq!(pull.len(), 1);
    assert_eq!(pull[0].name, "pull-app-example-com");
    Ok(())
}

#[tokio::test]
async fn incomplete_registry_credentials_are_rejected() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    enable_github(&env.ctx, &env.site(), &enable_req()).await?;
    let req = DispatchRequest {
        registry: Some(RegistryCredentials {
            server: "ghcr.io".into(),
            username: String::new(),
            password: "registry-secret".into(),
        }),
        ..Default::default()
    };
    let err = dispatch(&env.ctx, &env.site(), &req).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(env.ci.runs.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn disable_drops_token_purge_drops_everything() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_github(&env.ctx, &site, &enable_req()).await?;

    let status = disable_github(&env.ctx, &site).await?;
    assert!(!status.enabled);
    assert!(!status.token_present);
    assert_eq!(status.repo, "acme/shop");
    assert_eq!(
        dispatch(&env.ctx, &site, &DispatchRequest::default())
            .await
            .unwrap_err()
            .status_code(),
        409
    );

    let status = purge_github(&env.ctx, &site).await?;
    assert!(status.repo.is_empty());
    assert!(!status.pull_secret_present);
    Ok(())
}
