//! HTTP clients for the external services add-ons talk to: mail server,
//! DNS server and CI. Each sits behind a trait so tests can swap in an
//! in-memory implementation.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub mod dns;
pub mod github;
pub mod mail;

pub use dns::{DnsProvider, PowerDnsClient};
pub use github::{CiDispatcher, GithubDispatcher, WorkflowDispatch};
pub use mail::{Alias, MailProvider, MailcowClient, Mailbox, NewMailbox};

/// Authentication strategy for a provider API.
#[derive(Clone, Debug)]
pub enum Auth {
    /// `Authorization: Bearer {token}`
    Bearer(String),
    /// `X-API-Key: {key}`
    XApiKey(String),
}

/// Thin JSON-over-HTTP wrapper shared by the provider clients. Transport
/// failures and non-2xx replies become [`Error::Provider`].
#[derive(Clone, Debug)]
pub(crate) struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    provider: &'static str,
}

impl HttpApi {
    pub fn new(provider: &'static str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("tenant-plane/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("building {provider} HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider,
        })
    }

    pub fn request(&self, method: Method, path: &str, auth: &Auth) -> RequestBuilder {
        let req = self.client.request(method, format!("{}{path}", self.base_url));
        match auth {
            Auth::Bearer(token) => req.bearer_auth(token),
            Auth::XApiKey(key) => req.header("X-API-Key", key.as_str()),
        }
    }

    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::provider(self.provider, message)
    }

    /// Send and require a 2xx reply.
    pub async fn send(&self, req: RequestBuilder) -> Result<Response> {
        self.send_allow_missing(req)
            .await?
            .ok_or_else(|| self.error("resource not found (404)"))
    }

    /// Send; a 404 reply yields `None`.
    pub async fn send_allow_missing(&self, req: RequestBuilder) -> Result<Option<Response>> {
        let resp = req.send().await.map_err(|e| self.error(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(self.error(format!("request failed with status {status}: {body}")));
        }
        Ok(Some(resp))
    }

    pub async fn json<T: DeserializeOwned>(&self, resp: Response) -> Result<T> {
        resp.json()
            .await
            .map_err(|e| self.error(format!("unparseable response: {e}")))
    }
}
