//! DNS server seam and the PowerDNS HTTP API client.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use tracing::info;

use crate::error::Result;

use super::{Auth, HttpApi};

const RECORD_TTL: u32 = 300;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create the zone if absent and point the apex and `www` A records at
    /// `target`.
    async fn ensure_zone(&self, domain: &str, target: &str) -> Result<()>;

    async fn zone_exists(&self, domain: &str) -> Result<bool>;

    /// Delete the zone. Absent ⇒ no-op.
    async fn remove_zone(&self, domain: &str) -> Result<()>;
}

/// Fully qualified zone name with the trailing dot PowerDNS expects.
pub fn canonical_zone(domain: &str) -> String {
    format!("{}.", domain.trim_end_matches('.'))
}

pub struct PowerDnsClient {
    api: HttpApi,
    auth: Auth,
    server_id: String,
    nameservers: Vec<String>,
}

impl PowerDnsClient {
    pub fn new(base_url: &str, api_key: &str, nameservers: Vec<String>) -> Result<Self> {
        Ok(Self {
            api: HttpApi::new("dns", base_url)?,
            auth: Auth::XApiKey(api_key.to_string()),
            server_id: "localhost".to_string(),
            nameservers: nameservers.iter().map(|ns| canonical_zone(ns)).collect(),
        })
    }

    fn zone_path(&self, zone: &str) -> String {
        format!("/api/v1/servers/{}/zones/{zone}", self.server_id)
    }
}

#[async_trait]
impl DnsProvider for PowerDnsClient {
    async fn ensure_zone(&self, domain: &str, target: &str) -> Result<()> {
        let zone = canonical_zone(domain);
        if !self.zone_exists(domain).await? {
            let body = json!({
                "name": zone,
                "kind": "Native",
                "nameservers": self.nameservers,
            });
            let path = format!("/api/v1/servers/{}/zones", self.server_id);
            self.api
                .send(self.api.request(Method::POST, &path, &self.auth).json(&body))
                .await?;
            info!(%zone, "created dns zone");
        }

        let record = |name: String| {
            json!({
                "name": name,
                "type": "A",
                "ttl": RECORD_TTL,
                "changetype": "REPLACE",
                "records": [{ "content": target, "disabled": false }],
            })
        };
        let body = json!({ "rrsets": [record(zone.clone()), record(format!("www.{zone}"))] });
        self.api
            .send(
                self.api
                    .request(Method::PATCH, &self.zone_path(&zone), &self.auth)
                    .json(&body),
            )
            .await?;
        info!(%zone, %target, "dns records set");
        Ok(())
    }

    async fn zone_exists(&self, domain: &str) -> Result<bool> {
        let zone = canonical_zone(domain);
        let resp = self
            .api
            .send_allow_missing(self.api.request(Method::GET, &self.zone_path(&zone), &self.auth))
            .await?;
        Ok(resp.is_some())
    }

    async fn remove_zone(&self, domain: &str) -> Result<()> {
        let zone = canonical_zone(domain);
        if self
            .api
            .send_allow_missing(self.api.request(Method::DELETE, &self.zone_path(&zone), &self.auth))
            .await?
            .is_some()
        {
            info!(%zone, "removed dns zone");
        }
        Ok(())
    }
}
