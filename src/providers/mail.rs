//! Mail server seam and the mailcow API client.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::Result;

use super::{Auth, HttpApi};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mailbox {
    pub address: String,
    pub name: String,
    pub quota_mb: u64,
    pub active: bool,
}

/// Request to create a mailbox under the site's mail domain.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMailbox {
    pub local_part: String,
    #[serde(default)]
    pub name: String,
    pub password: String,
    #[serde(default = "default_quota_mb")]
    pub quota_mb: u64,
}

fn default_quota_mb() -> u64 {
    1024
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alias {
    pub address: String,
    pub goto: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Contract over the mail server's administrative API.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider name recorded in site metadata.
    fn name(&self) -> &str;

    /// Create the domain if absent (active).
    async fn ensure_domain(&self, domain: &str) -> Result<()>;

    /// `None` when the domain does not exist.
    async fn domain_active(&self, domain: &str) -> Result<Option<bool>>;

    async fn activate_domain(&self, domain: &str) -> Result<()>;

    async fn deactivate_domain(&self, domain: &str) -> Result<()>;

    /// Delete the domain with all of its mailboxes and aliases. Absent ⇒ no-op.
    async fn purge_domain(&self, domain: &str) -> Result<()>;

    async fn list_mailboxes(&self, domain: &str) -> Result<Vec<Mailbox>>;

    async fn create_mailbox(&self, domain: &str, mailbox: &NewMailbox) -> Result<Mailbox>;

    async fn delete_mailbox(&self, address: &str) -> Result<()>;

    async fn list_aliases(&self, domain: &str) -> Result<Vec<Alias>>;

    async fn create_alias(&self, alias: &Alias) -> Result<Alias>;

    async fn delete_alias(&self, address: &str) -> Result<()>;
}

/// mailcow `api/v1` client, authenticated with `X-API-Key`.
pub struct MailcowClient {
    api: HttpApi,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct MailcowMailbox {
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    quota: u64,
    #[serde(default)]
    active: Value,
}

#[derive(Debug, Deserialize)]
struct MailcowAlias {
    id: Value,
    address: String,
    #[serde(default)]
    goto: String,
    #[serde(default)]
    active: Value,
}

/// mailcow reports flags as `1`, `"1"` or `true` depending on the endpoint.
fn flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => s == "1" || s == "true",
        _ => false,
    }
}

fn id_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn domain_of(address: &str) -> &str {
    address.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
}

impl MailcowClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Ok(Self {
            api: HttpApi::new("mail", base_url)?,
            auth: Auth::XApiKey(api_key.to_string()),
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .api
            .send(self.api.request(Method::GET, path, &self.auth))
            .await?;
        self.api.json(resp).await
    }

    /// POST a mutation; mailcow answers 200 with `[{type, msg}]` even on
    /// failure, so the body is checked too.
    async fn post(&self, path: &str, body: &Value) -> Result<()> {
        let resp = self
            .api
            .send(self.api.request(Method::POST, path, &self.auth).json(body))
            .await?;
        let result: Value = self.api.json(resp).await?;
        let entries = match &result {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        for entry in entries {
            let kind = entry.get("type").and_then(Value::as_str).unwrap_or("success");
            if kind == "danger" || kind == "error" {
                let msg = entry.get("msg").map(Value::to_string).unwrap_or_default();
                return Err(self.api.error(format!("{path}: {msg}")));
            }
        }
        debug!(%path, "mailcow call succeeded");
        Ok(())
    }

    async fn raw_aliases(&self, domain: &str) -> Result<Vec<MailcowAlias>> {
        let all: Vec<MailcowAlias> = serde_json::from_value(self.get("/api/v1/get/alias/all").await?)
            .map_err(|e| self.api.error(format!("unparseable alias list: {e}")))?;
        Ok(all
            .into_iter()
            .filter(|a| domain_of(&a.address) == domain)
            .collect())
    }
}

#[async_trait]
impl MailProvider for MailcowClient {
    fn name(&self) -> &str {
        "mailcow"
    }

    async fn ensure_domain(&self, domain: &str) -> Result<()> {
        if self.domain_active(domain).await?.is_some() {
            return Ok(());
        }
        self.post(
            "/api/v1/add/domain",
            &json!({
                "domain": domain,
                "active": "1",
                "restart_sogo": "10",
            }),
        )
        .await?;
        info!(%domain, "created mail domain");
        Ok(())
    }

    async fn domain_active(&self, domain: &str) -> Result<Option<bool>> {
        let value = self.get(&format!("/api/v1/get/domain/{domain}")).await?;
        // Unknown domains come back as `{}` or `[]`.
        match value.get("active") {
            Some(active) => Ok(Some(flag(active))),
            None => Ok(None),
        }
    }

    async fn activate_domain(&self, domain: &str) -> Result<()> {
        self.post(
            "/api/v1/edit/domain",
            &json!({ "items": [domain], "attr": { "active": "1" } }),
        )
        .await
    }

    async fn deactivate_domain(&self, domain: &str) -> Result<()> {
        self.post(
            "/api/v1/edit/domain",
            &json!({ "items": [domain], "attr": { "active": "0" } }),
        )
        .await
    }

    async fn purge_domain(&self, domain: &str) -> Result<()> {
        if self.domain_active(domain).await?.is_none() {
            return Ok(());
        }
        let mailboxes: Vec<String> = self
            .list_mailboxes(domain)
            .await?
            .into_iter()
            .map(|m| m.address)
            .collect();
        if !mailboxes.is_empty() {
            self.post("/api/v1/delete/mailbox", &json!(mailboxes)).await?;
        }
        let alias_ids: Vec<String> = self
            .raw_aliases(domain)
            .await?
            .iter()
            .map(|a| id_string(&a.id))
            .collect();
        if !alias_ids.is_empty() {
            self.post("/api/v1/delete/alias", &json!(alias_ids)).await?;
        }
        self.post("/api/v1/delete/domain", &json!([domain])).await?;
        info!(%domain, "purged mail domain");
        Ok(())
    }

    async fn list_mailboxes(&self, domain: &str) -> Result<Vec<Mailbox>> {
        let value = self.get(&format!("/api/v1/get/mailbox/all/{domain}")).await?;
        let raw: Vec<MailcowMailbox> = match value {
            Value::Array(_) => serde_json::from_value(value)
                .map_err(|e| self.api.error(format!("unparseable mailbox list: {e}")))?,
            _ => vec![],
        };
        Ok(raw
            .into_iter()
            .map(|m| Mailbox {
                address: m.username,
                name: m.name,
                quota_mb: m.quota / (1024 * 1024),
                active: flag(&m.active),
            })
            .collect())
    }

    async fn create_mailbox(&self, domain: &str, mailbox: &NewMailbox) -> Result<Mailbox> {
        self.post(
            "/api/v1/add/mailbox",
            &json!({
                "local_part": mailbox.local_part,
                "domain": domain,
                "name": mailbox.name,
                "quota": mailbox.quota_mb.to_string(),
                "password": mailbox.password,
                "password2": mailbox.password,
                "active": "1",
            }),
        )
        .await?;
        Ok(Mailbox {
            address: format!("{}@{domain}", mailbox.local_part),
            name: mailbox.name.clone(),
            quota_mb: mailbox.quota_mb,
            active: true,
        })
    }

    async fn delete_mailbox(&self, address: &str) -> Result<()> {
        self.post("/api/v1/delete/mailbox", &json!([address])).await
    }

    async fn list_aliases(&self, domain: &str) -> Result<Vec<Alias>> {
        Ok(self
            .raw_aliases(domain)
            .await?
            .into_iter()
            .map(|a| Alias {
                address: a.address,
                goto: a
                    .goto
                    .split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(String::from)
                    .collect(),
                active: flag(&a.active),
            })
            .collect())
    }

    async fn create_alias(&self, alias: &Alias) -> Result<Alias> {
        self.post(
            "/api/v1/add/alias",
            &json!({
                "address": alias.address,
                "goto": alias.goto.join(","),
                "active": if alias.active { "1" } else { "0" },
            }),
        )
        .await?;
        Ok(alias.clone())
    }

    async fn delete_alias(&self, address: &str) -> Result<()> {
        let ids: Vec<String> = self
            .raw_aliases(domain_of(address))
            .await?
            .iter()
            .filter(|a| a.address == address)
            .map(|a| id_string(&a.id))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.post("/api/v1/delete/alias", &json!(ids)).await
    }
}
