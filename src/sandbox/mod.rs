//! Sandbox provider abstraction.
//!
//! Defines the [`SandboxClient`] trait every provider must implement. One
//! provider exists today:
//!
//! - [`daytona::DaytonaClient`] — Daytona cloud sandboxes (requires
//!   `DAYTONA_API_KEY`)
//!
//! The orchestrator and snapshot manager only ever see the trait, so tests
//! can substitute a recording stub.

pub mod daytona;
pub mod toolbox;

pub use daytona::DaytonaClient;

use crate::error::ApiResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Provider-side immutable image record.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Provider-side sandbox record.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl SandboxInfo {
    /// True when the sandbox state matches any of `states` (case-insensitive).
    pub fn state_in(&self, states: &[&str]) -> bool {
        match &self.state {
            Some(s) => states.iter().any(|w| s.eq_ignore_ascii_case(w)),
            None => false,
        }
    }
}

/// Parameters for sandbox creation. Sessions are always non-public with
/// auto-stop disabled; the fields are explicit so the call site reads like
/// the wire request.
#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub snapshot: String,
    pub name: String,
    pub env: BTreeMap<String, String>,
    pub public: bool,
    pub auto_stop_interval: u32,
}

/// Output of a synchronous one-shot command: exit code plus combined
/// stdout+stderr as the provider returns them.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Push callback receiving raw PTY bytes as they arrive. Calls are
/// serialized; the stream ends when the command exits.
pub type PtyChunkSink<'a> = &'a mut (dyn FnMut(&[u8]) + Send);

/// Everything the orchestrator needs from a sandbox provider.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    // Snapshots.
    async fn create_snapshot(
        &self,
        name: &str,
        build_file: &str,
        cpu: u32,
        memory_gib: u32,
        disk_gib: u32,
    ) -> ApiResult<SnapshotInfo>;
    async fn find_snapshot_by_name(&self, name: &str) -> ApiResult<Option<SnapshotInfo>>;
    async fn wait_for_snapshot(&self, id: &str, timeout: Duration) -> ApiResult<SnapshotInfo>;
    async fn delete_snapshot(&self, id: &str) -> ApiResult<()>;

    // Sandboxes.
    async fn create_sandbox(&self, req: &CreateSandboxRequest) -> ApiResult<SandboxInfo>;
    async fn get_sandbox(&self, id: &str) -> ApiResult<SandboxInfo>;
    async fn find_sandbox_by_name(&self, name: &str) -> ApiResult<Option<SandboxInfo>>;
    async fn list_sandboxes(&self) -> ApiResult<Vec<SandboxInfo>>;
    async fn start_sandbox(&self, id: &str) -> ApiResult<()>;
    async fn stop_sandbox(&self, id: &str) -> ApiResult<()>;
    async fn delete_sandbox(&self, id: &str) -> ApiResult<()>;
    /// Poll until the sandbox state is one of `target_states`.
    async fn wait_for_sandbox(
        &self,
        id: &str,
        target_states: &[&str],
        timeout: Duration,
    ) -> ApiResult<SandboxInfo>;

    // In-sandbox operations.
    async fn upload_file(&self, sandbox_id: &str, path: &str, bytes: Vec<u8>) -> ApiResult<()>;
    /// Synchronous single-shot execution. No shell is involved unless the
    /// command is explicitly wrapped in one.
    async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ApiResult<CommandOutput>;
    async fn git_clone(
        &self,
        sandbox_id: &str,
        url: &str,
        path: &str,
        branch: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> ApiResult<()>;

    /// Open a named persistent background shell.
    async fn create_session(&self, sandbox_id: &str, session_id: &str) -> ApiResult<()>;
    /// Fire-and-forget execution inside a persistent shell; returns as soon
    /// as the provider has accepted the command.
    async fn session_execute(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
    ) -> ApiResult<()>;

    /// Run a command on a PTY, streaming raw bytes to `on_chunk`. Blocks
    /// until the command exits or `timeout` elapses.
    async fn run_pty_command(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
        on_chunk: PtyChunkSink<'_>,
    ) -> ApiResult<()>;
}
