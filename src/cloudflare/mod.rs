//! Cloudflare edge client: tunnels, DNS, workers, and routes.
//!
//! Every session owns a dedicated tunnel, a proxied CNAME, an auth worker,
//! and a route binding the worker to `hostname/*`. The submodules cover one
//! concern each; this module holds the shared HTTP plumbing and the v4 API
//! envelope decoding.

pub mod dns;
pub mod tunnel;
pub mod worker;

pub use tunnel::TunnelCredentials;
pub use worker::WorkerDeployment;

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use std::time::Duration;

/// Base URL for the Cloudflare v4 API.
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Everything the orchestrator needs from the edge. Implemented by
/// [`CloudflareClient`]; tests substitute a recording stub.
#[async_trait]
pub trait EdgeClient: Send + Sync {
    /// Public hostname for a session slug.
    fn hostname(&self, slug: &str) -> String;

    /// Find or create the session's dedicated tunnel and fetch its connect
    /// token.
    async fn create_tunnel(&self, name: &str, hostname: &str) -> ApiResult<TunnelCredentials>;

    /// Upsert the proxied CNAME pointing `hostname` at the tunnel.
    async fn ensure_tunnel_dns(&self, hostname: &str, tunnel_id: &str) -> ApiResult<()>;

    /// Upload the auth worker and bind it to `hostname/*`.
    async fn deploy_worker(&self, deployment: &WorkerDeployment) -> ApiResult<()>;

    /// Best-effort teardown of route, DNS records, and the worker script.
    async fn delete_worker(&self, worker_name: &str, hostname: &str);

    /// Best-effort teardown of live connections and the tunnel itself.
    async fn delete_tunnel(&self, tunnel_id: &str);
}

/// Shared HTTP client for the Cloudflare API.
pub struct CloudflareClient {
    pub(crate) api_token: String,
    pub(crate) account_id: String,
    pub(crate) zone_id: String,
    /// Apex domain session hostnames hang off of, e.g. `dev.example.com`.
    pub domain: String,
    pub(crate) base_url: String,
    pub(crate) http: reqwest::Client,
}

impl CloudflareClient {
    pub fn new(
        api_token: impl Into<String>,
        account_id: impl Into<String>,
        zone_id: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            api_token: api_token.into(),
            account_id: account_id.into(),
            zone_id: zone_id.into(),
            domain: domain.into(),
            base_url: CLOUDFLARE_API_BASE.to_string(),
            http,
        }
    }

    /// Public hostname for a session slug.
    pub fn hostname(&self, slug: &str) -> String {
        format!("{slug}.{}", self.domain)
    }

    pub(crate) fn account_url(&self, path: &str) -> String {
        format!("{}/accounts/{}{path}", self.base_url, self.account_id)
    }

    pub(crate) fn zone_url(&self, path: &str) -> String {
        format!("{}/zones/{}{path}", self.base_url, self.zone_id)
    }

    pub(crate) fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    /// Unwrap the v4 envelope `{success, errors, result}` and return
    /// `result`. A well-formed failure body still carries useful error
    /// messages, so surface those over the bare status line.
    pub(crate) async fn decode(&self, resp: reqwest::Response) -> ApiResult<serde_json::Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".to_string());

        let parsed: serde_json::Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) if status.is_success() => return Ok(serde_json::Value::Null),
            Err(_) => return Err(ApiError::from_status(status, &body)),
        };

        let success = parsed["success"].as_bool().unwrap_or(status.is_success());
        if !success || !status.is_success() {
            let messages: Vec<String> = parsed["errors"]
                .as_array()
                .map(|errs| {
                    errs.iter()
                        .filter_map(|e| e["message"].as_str().map(|m| m.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let detail = if messages.is_empty() {
                body
            } else {
                messages.join("; ")
            };
            return Err(ApiError::from_status(status, &detail));
        }

        Ok(parsed["result"].clone())
    }

    pub(crate) async fn get(&self, url: String) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .get(url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        self.decode(resp).await
    }

    pub(crate) async fn post(
        &self,
        url: String,
        body: &serde_json::Value,
    ) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .post(url)
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await?;
        self.decode(resp).await
    }

    pub(crate) async fn put(
        &self,
        url: String,
        body: &serde_json::Value,
    ) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .put(url)
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await?;
        self.decode(resp).await
    }

    pub(crate) async fn delete(&self, url: String) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        self.decode(resp).await
    }
}

#[async_trait]
impl EdgeClient for CloudflareClient {
    fn hostname(&self, slug: &str) -> String {
        CloudflareClient::hostname(self, slug)
    }

    async fn create_tunnel(&self, name: &str, hostname: &str) -> ApiResult<TunnelCredentials> {
        CloudflareClient::create_tunnel(self, name, hostname).await
    }

    async fn ensure_tunnel_dns(&self, hostname: &str, tunnel_id: &str) -> ApiResult<()> {
        CloudflareClient::ensure_tunnel_dns(self, hostname, tunnel_id).await
    }

    async fn deploy_worker(&self, deployment: &WorkerDeployment) -> ApiResult<()> {
        CloudflareClient::deploy_worker(self, deployment).await
    }

    async fn delete_worker(&self, worker_name: &str, hostname: &str) {
        CloudflareClient::delete_worker(self, worker_name, hostname).await
    }

    async fn delete_tunnel(&self, tunnel_id: &str) {
        CloudflareClient::delete_tunnel(self, tunnel_id).await
    }
}
