use std::sync::atomic::Ordering;

use tenant_plane::addons::dns::{disable_dns, dns_status, enable_dns, purge_dns, EnableDnsRequest};
use tenant_plane::metadata::load_site;

use super::common::*;

#[tokio::test]
async fn enable_dns_uses_default_target() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let status = enable_dns(&env.ctx, &env.site(), &EnableDnsRequest::default()).await?;

    assert!(status.enabled);
    assert!(status.zone_exists);
    assert_eq!(status.domain, DOMAIN);
    assert_eq!(status.target, "203.0.113.10");
    assert_eq!(env.dns.zones.lock().unwrap()[DOMAIN], "203.0.113.10");
    Ok(())
}

#[tokio::test]
async fn explicit_target_must_be_ipv4() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let bad = EnableDnsRequest {
        target: Some("not-an-ip".into()),
    };
    let err = enable_dns(&env.ctx, &env.site(), &bad).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(env.dns.zones.lock().unwrap().is_empty());

    let good = EnableDnsRequest {
        target: Some("198.51.100.7".into()),
    };
    assert_eq!(enable_dns(&env.ctx, &env.site(), &good).await?.target, "198.51.100.7");
    Ok(())
}

#[tokio::test]
async fn provider_failure_is_recorded() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    env.dns.fail.store(true, Ordering::SeqCst);

    let err = enable_dns(&env.ctx, &env.site(), &EnableDnsRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 502);

    let record = load_site(env.cluster.as_ref(), NS, USER, SLUG).await?.unwrap();
    assert!(!record.dns.enabled);
    assert!(!record.dns.last_error.is_empty());
    assert!(dns_status(&env.ctx, &env.site()).await?.last_error.contains("simulated"));
    Ok(())
}

#[tokio::test]
async fn disable_removes_zone_but_remembers_target() -> anyhow::Result<()> {
    let env = TestEnv::with_site().await;
    let site = env.site();
    enable_dns(&env.ctx, &site, &EnableDnsRequest::default()).await?;

    let status = disable_dns(&env.ctx, &site).await?;
    assert!(!status.enabled);
    assert!(!status.zone_exists);
    assert_eq!(status.target, "203.0.113.10");

    let status = purge_dns(&env.ctx, &site).await?;
    assert!(status.domain.is_empty());
    assert!(status.target.is_empty());
    assert!(env.dns.zones.lock().unwrap().is_empty());
    Ok(())
}
