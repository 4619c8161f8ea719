use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;
use tenant_plane::addons::tls::{
    disable_tls, enable_tls, purge_tls, tls_status, DisableTlsRequest, EnableTlsRequest,
};
use tenant_plane::cluster::ObjectKind;
use tenant_plane::credentials;
use tenant_plane::metadata::load_site;
use tenant_plane::resources::workload::{ANN_CLUSTER_ISSUER, ANN_ENTRYPOINTS, ANN_ROUTER_TLS};
use tenant_plane::resources::{route_name, tls_secret_name};

use super::common::*;

fn route(env: &TestEnv) -> Ingress {
    env.cluster
        .object(ObjectKind::Ingress, NS, &route_name(SLUG))
        .and_then(|o| o.into_ingress())
        .expect("route exists")
}

/// Stand-in for the certificate the issuer would write.
async fn issue_certificate(env: &TestEnv) {
    let values = BTreeMap::from([
        ("tls.crt".to_string(), "cert".to_string()),
        ("tls.key".to_string(), "key".to_string()),
    ]);
    credentials::put_values(env.cluster.as_ref(), NS, &tls_secret_name(SLUG), BTreeMap::new(), &values)
        .await
        .unwrap();
}

#[tokio::test]
async fn enable_tls_switches_route_to_https() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let status = enable_tls(&env.ctx, &env.site(), &EnableTlsRequest::default()).await?;
    assert!(status.enabled);
    assert!(status.route_tls);
    assert_eq!(status.issuer, "letsencrypt-prod");

    let ing = route(&env);
    let annotations = ing.metadata.annotations.unwrap();
    assert_eq!(annotations[ANN_ENTRYPOINTS], "websecure");
    assert_eq!(annotations[ANN_ROUTER_TLS], "true");
    assert_eq!(annotations[ANN_CLUSTER_ISSUER], "letsencrypt-prod");
    let tls = ing.spec.unwrap().tls.unwrap();
    assert_eq!(tls[0].secret_name.as_deref(), Some("tls-app-example-com"));
    assert_eq!(tls[0].hosts.as_deref(), Some(&[DOMAIN.to_string()][..]));

    let record = load_site(env.cluster.as_ref(), NS, USER, SLUG).await?.unwrap();
    assert!(record.tls_enabled);
    Ok(())
}

#[tokio::test]
async fn staging_issuer_is_accepted_unknown_is_not() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let staging = EnableTlsRequest {
        issuer: Some("letsencrypt-staging".into()),
    };
    assert_eq!(enable_tls(&env.ctx, &env.site(), &staging).await?.issuer, "letsencrypt-staging");

    let unknown = EnableTlsRequest {
        issuer: Some("self-signed".into()),
    };
    let err = enable_tls(&env.ctx, &env.site(), &unknown).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(
        route(&env).metadata.annotations.unwrap()[ANN_CLUSTER_ISSUER],
        "letsencrypt-staging"
    );
    Ok(())
}

#[tokio::test]
async fn disable_keeps_certificate_unless_cleanup() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_tls(&env.ctx, &site, &EnableTlsRequest::default()).await?;
    issue_certificate(&env).await;

    let status = disable_tls(&env.ctx, &site, &DisableTlsRequest::default()).await?;
    assert!(!status.enabled);
    assert!(!status.route_tls);
    assert!(status.secret_present);
    let annotations = route(&env).metadata.annotations.unwrap();
    assert_eq!(annotations[ANN_ENTRYPOINTS], "web");
    assert!(!annotations.contains_key(ANN_CLUSTER_ISSUER));

    let status = disable_tls(&env.ctx, &site, &DisableTlsRequest { cleanup: true }).await?;
    assert!(!status.secret_present);
    Ok(())
}

#[tokio::test]
async fn purge_removes_certificate() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    enable_tls(&env.ctx, &env.site(), &EnableTlsRequest::default()).await?;
    issue_certificate(&env).await;

    let status = purge_tls(&env.ctx, &env.site()).await?;
    assert!(!status.enabled);
    assert!(!env.cluster.has(ObjectKind::Secret, NS, &tls_secret_name(SLUG)));
    Ok(())
}

#[tokio::test]
async fn missing_route_is_a_conflict() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    env.cluster
        .lock()
        .objects
        .retain(|(kind, _, _), _| *kind != ObjectKind::Ingress);

    let err = enable_tls(&env.ctx, &env.site(), &EnableTlsRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);

    let status = tls_status(&env.ctx, &env.site()).await?;
    assert!(!status.route_tls);
    assert!(status.last_error.contains("no route"));
    Ok(())
}
