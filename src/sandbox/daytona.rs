//! Daytona sandbox provider — HTTP client for the Daytona REST API.
//!
//! One shared [`reqwest::Client`] handles every call: snapshot builds,
//! sandbox lifecycle, and the in-sandbox toolbox operations implemented in
//! [`super::toolbox`]. HTTP failures are classified into [`ApiError`] so the
//! orchestrator can tell an absent resource from a broken provider.

use super::{CommandOutput, CreateSandboxRequest, PtyChunkSink, SandboxClient, SandboxInfo, SnapshotInfo};
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde_json::json;
use std::time::{Duration, Instant};

/// Base URL for the Daytona REST API.
pub const DAYTONA_API_BASE: &str = "https://app.daytona.io/api";

/// Poll interval while waiting on a snapshot build.
const SNAPSHOT_POLL: Duration = Duration::from_secs(3);

/// Poll interval while waiting on a sandbox state change.
const SANDBOX_POLL: Duration = Duration::from_secs(2);

/// Shared HTTP client for the Daytona API.
pub struct DaytonaClient {
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) http: reqwest::Client,
}

impl DaytonaClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DAYTONA_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub(crate) fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// Read the response body, classify non-success statuses, and parse JSON.
    pub(crate) async fn decode(&self, resp: reqwest::Response) -> ApiResult<serde_json::Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_else(|_| "<unreadable>".to_string());

        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|_| ApiError::Server {
            status: status.as_u16(),
            message: format!("unparseable response body: {body}"),
        })
    }

    async fn get_json(&self, path: &str) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .get(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        self.decode(resp).await
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> ApiResult<serde_json::Value> {
        let resp = self
            .http
            .post(self.url(path))
            .header("Authorization", self.auth_header())
            .json(body)
            .send()
            .await?;
        self.decode(resp).await
    }

    async fn delete_path(&self, path: &str) -> ApiResult<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await?;
        self.decode(resp).await.map(|_| ())
    }

    /// List endpoints return either a bare array or `{"items": [...]}`
    /// depending on API version.
    fn list_items(value: serde_json::Value) -> Vec<serde_json::Value> {
        match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => map
                .remove("items")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl SandboxClient for DaytonaClient {
    async fn create_snapshot(
        &self,
        name: &str,
        build_file: &str,
        cpu: u32,
        memory_gib: u32,
        disk_gib: u32,
    ) -> ApiResult<SnapshotInfo> {
        let body = json!({
            "name": name,
            "buildInfo": { "dockerfileContent": build_file },
            "cpu": cpu,
            "memory": memory_gib,
            "disk": disk_gib,
        });
        let value = self.post_json("/snapshots", &body).await?;
        parse_record(value)
    }

    async fn find_snapshot_by_name(&self, name: &str) -> ApiResult<Option<SnapshotInfo>> {
        let value = self
            .get_json(&format!("/snapshots?name={}", urlencoding::encode(name)))
            .await?;
        let found = Self::list_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value::<SnapshotInfo>(v).ok())
            .find(|s| s.name.as_deref() == Some(name));
        Ok(found)
    }

    async fn wait_for_snapshot(&self, id: &str, timeout: Duration) -> ApiResult<SnapshotInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self.get_json(&format!("/snapshots/{id}")).await?;
            let snapshot: SnapshotInfo = parse_record(value)?;
            match snapshot.state.as_deref() {
                Some("ready") | Some("active") => return Ok(snapshot),
                Some(state @ ("error" | "failed" | "build_failed")) => {
                    return Err(ApiError::Server {
                        status: 500,
                        message: format!("snapshot {id} entered state '{state}'"),
                    })
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ApiError::Timeout(timeout));
            }
            tokio::time::sleep(SNAPSHOT_POLL).await;
        }
    }

    async fn delete_snapshot(&self, id: &str) -> ApiResult<()> {
        self.delete_path(&format!("/snapshots/{id}")).await
    }

    async fn create_sandbox(&self, req: &CreateSandboxRequest) -> ApiResult<SandboxInfo> {
        let body = json!({
            "snapshot": req.snapshot,
            "name": req.name,
            "env": req.env,
            "public": req.public,
            "autoStopInterval": req.auto_stop_interval,
        });
        let value = self.post_json("/sandbox", &body).await?;
        parse_record(value)
    }

    async fn get_sandbox(&self, id: &str) -> ApiResult<SandboxInfo> {
        let value = self.get_json(&format!("/sandbox/{id}")).await?;
        parse_record(value)
    }

    async fn find_sandbox_by_name(&self, name: &str) -> ApiResult<Option<SandboxInfo>> {
        Ok(self
            .list_sandboxes()
            .await?
            .into_iter()
            .find(|s| s.name.as_deref() == Some(name)))
    }

    async fn list_sandboxes(&self) -> ApiResult<Vec<SandboxInfo>> {
        let value = self.get_json("/sandbox").await?;
        Ok(Self::list_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    async fn start_sandbox(&self, id: &str) -> ApiResult<()> {
        self.post_json(&format!("/sandbox/{id}/start"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn stop_sandbox(&self, id: &str) -> ApiResult<()> {
        self.post_json(&format!("/sandbox/{id}/stop"), &json!({}))
            .await
            .map(|_| ())
    }

    async fn delete_sandbox(&self, id: &str) -> ApiResult<()> {
        self.delete_path(&format!("/sandbox/{id}?force=true")).await
    }

    async fn wait_for_sandbox(
        &self,
        id: &str,
        target_states: &[&str],
        timeout: Duration,
    ) -> ApiResult<SandboxInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let sandbox = self.get_sandbox(id).await?;
            if sandbox.state_in(target_states) {
                return Ok(sandbox);
            }
            if Instant::now() >= deadline {
                return Err(ApiError::Timeout(timeout));
            }
            tokio::time::sleep(SANDBOX_POLL).await;
        }
    }

    async fn upload_file(&self, sandbox_id: &str, path: &str, bytes: Vec<u8>) -> ApiResult<()> {
        self.toolbox_upload(sandbox_id, path, bytes).await
    }

    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ApiResult<CommandOutput> {
        self.toolbox_execute(sandbox_id, command, timeout).await
    }

    async fn git_clone(
        &self,
        sandbox_id: &str,
        url: &str,
        path: &str,
        branch: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> ApiResult<()> {
        self.toolbox_git_clone(sandbox_id, url, path, branch, username, password)
            .await
    }

    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> ApiResult<()> {
        self.toolbox_create_session(sandbox_id, session_id).await
    }

    async fn session_execute(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
    ) -> ApiResult<()> {
        self.toolbox_session_execute(sandbox_id, session_id, command)
            .await
    }

    async fn run_pty_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
        on_chunk: PtyChunkSink<'_>,
    ) -> ApiResult<()> {
        self.toolbox_run_pty(sandbox_id, command, timeout, on_chunk)
            .await
    }
}

/// Decode a single record, surfacing the body on shape mismatch.
fn parse_record<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> ApiResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| ApiError::Server {
        status: 200,
        message: format!("unexpected record shape: {e} in {value}"),
    })
}
