//! Session orchestrator: drives the full lifecycle of one session across
//! the sandbox provider, the edge, and the AI backend.
//!
//! `start` is an ordered sequence with no automatic rollback: every
//! externally-created resource is reported through the event callback as
//! soon as it exists, so the caller can persist it and a later `delete`
//! can tear down whatever a failed `start` left behind.

use crate::cloudflare::{EdgeClient, TunnelCredentials, WorkerDeployment};
use crate::config::SessionConfig;
use crate::runner::{shell_quote, AiBackend, PtyExecutor, MISE_PATH_EXPORT};
use crate::sandbox::{CreateSandboxRequest, PtyChunkSink, SandboxClient};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Where the working copy lives inside every sandbox.
pub const CODE_PATH: &str = "/home/daytona/app";

/// Where the cloudflared connect token is written inside the sandbox.
const TUNNEL_TOKEN_PATH: &str = "/tmp/tunnel-token";

/// Persistent shell session ids. The orchestrator owns these exclusively.
const APP_SHELL: &str = "app";
const TUNNEL_SHELL: &str = "tunnel";

/// States in which a sandbox accepts work.
const RUNNING_STATES: &[&str] = &["started", "running"];

const SANDBOX_READY_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
const PTY_TIMEOUT: Duration = Duration::from_secs(600);
const LOG_FOLLOW_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Grace period after deleting a stale sandbox before reusing its name.
const DELETE_SETTLE: Duration = Duration::from_secs(3);

/// Lifecycle notifications emitted during `start`, in order. The caller
/// persists these so partial state survives a failed start.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SandboxCreated {
        sandbox_id: String,
    },
    TunnelCreated {
        tunnel_id: String,
        tunnel_token: String,
    },
    InstallStart {
        name: String,
        command: String,
    },
    InstallComplete {
        name: String,
        command: String,
        exit_code: i64,
        output: String,
    },
}

pub type EventSink<'a> = &'a mut (dyn FnMut(SessionEvent) + Send);

/// One managed process as reported by `overmind status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub status: String,
}

#[derive(Default)]
struct SessionState {
    sandbox_id: Option<String>,
    tunnel_id: Option<String>,
    tunnel_token: Option<String>,
}

/// Orchestrates one session. Owns its session's provider and edge resources
/// for the duration of any operation; concurrent operations on the same
/// slug are undefined.
pub struct Session {
    config: SessionConfig,
    sandbox: Arc<dyn SandboxClient>,
    edge: Option<Arc<dyn EdgeClient>>,
    ai: Arc<dyn AiBackend>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        sandbox: Arc<dyn SandboxClient>,
        edge: Option<Arc<dyn EdgeClient>>,
        ai: Arc<dyn AiBackend>,
    ) -> Self {
        let state = SessionState {
            sandbox_id: config.sandbox_id.clone(),
            tunnel_id: config.tunnel_id.clone(),
            tunnel_token: config.tunnel_token.clone(),
        };
        Self {
            config,
            sandbox,
            edge,
            ai,
            state: Mutex::new(state),
        }
    }

    /// Shared name for the sandbox, tunnel, and worker of this session.
    pub fn resource_name(&self) -> String {
        format!("kml-{}-{}", self.config.service_name, self.config.slug)
    }

    /// Name of the service's shared base snapshot.
    pub fn snapshot_name(&self) -> String {
        format!("kml-{}", self.config.service_name)
    }

    /// Public hostname, when an edge client is configured.
    pub fn hostname(&self) -> Option<String> {
        self.edge.as_ref().map(|edge| edge.hostname(&self.config.slug))
    }

    /// PostgreSQL database for this session.
    pub fn database_name(&self) -> String {
        format!("{}_dev", self.config.slug.replace('-', "_"))
    }

    /// Authenticated URL for the first visit, when an edge is configured.
    pub fn public_url(&self) -> Option<String> {
        self.hostname()
            .map(|host| format!("https://{host}?token={}", self.config.access_token))
    }

    fn sandbox_id(&self) -> Result<String> {
        self.state
            .lock()
            .sandbox_id
            .clone()
            .ok_or_else(|| anyhow!("session '{}' has no sandbox; start it first", self.config.slug))
    }

    /// Bring the session fully up. Steps run in order; a failure leaves
    /// already-created resources recorded (via `on_event`) for a later
    /// `delete` to clean up.
    pub async fn start(&self, on_event: EventSink<'_>) -> Result<()> {
        let name = self.resource_name();

        // A stale sandbox under this name would collide; replace it.
        if let Some(stale) = self.sandbox.find_sandbox_by_name(&name).await? {
            tracing::info!("replacing stale sandbox {} for {name}", stale.id);
            if let Err(e) = self.sandbox.delete_sandbox(&stale.id).await {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
            tokio::time::sleep(DELETE_SETTLE).await;
        }

        let mut env = self.config.env.clone();
        for (key, value) in self.ai.env_vars() {
            env.entry(key).or_insert(value);
        }
        let created = self
            .sandbox
            .create_sandbox(&CreateSandboxRequest {
                snapshot: self.snapshot_name(),
                name: name.clone(),
                env,
                public: false,
                auto_stop_interval: 0,
            })
            .await?;
        self.state.lock().sandbox_id = Some(created.id.clone());
        on_event(SessionEvent::SandboxCreated {
            sandbox_id: created.id.clone(),
        });

        self.sandbox
            .wait_for_sandbox(&created.id, RUNNING_STATES, SANDBOX_READY_TIMEOUT)
            .await?;

        if let Some(repo) = &self.config.git_repo {
            let url = normalize_git_url(repo);
            let (username, password) = match self.config.git_token.as_deref() {
                Some(token) => (Some("x-access-token"), Some(token)),
                None => (None, None),
            };
            self.sandbox
                .git_clone(
                    &created.id,
                    &url,
                    CODE_PATH,
                    self.config.git_branch(),
                    username,
                    password,
                )
                .await?;
        }

        let tunnel = match &self.edge {
            Some(edge) => Some(self.ensure_tunnel(edge.as_ref(), &name, &mut *on_event).await?),
            None => {
                tracing::info!("no edge client configured; session stays private");
                None
            }
        };

        self.sandbox
            .upload_file(
                &created.id,
                &format!("{CODE_PATH}/Procfile"),
                procfile(&self.config.processes).into_bytes(),
            )
            .await?;

        self.setup_postgres(&created.id).await?;
        self.run_install_steps(&created.id, &mut *on_event).await?;
        self.start_app_shell(&created.id).await?;

        if let (Some(edge), Some(tunnel)) = (&self.edge, tunnel) {
            self.start_tunnel_shell(&created.id, &tunnel.token).await?;

            edge.deploy_worker(&WorkerDeployment {
                worker_name: name,
                access_token: self.config.access_token.clone(),
                hostname: edge.hostname(&self.config.slug),
                files: self.config.worker_files.clone(),
                bindings: self.config.worker_bindings.clone(),
                injection: self.config.worker_injection.clone(),
            })
            .await?;
        }

        Ok(())
    }

    /// Run one prompt inside the sandbox, streaming validated JSON lines to
    /// `on_line`. Returns the conversation UUID that was used, so the caller
    /// can record it.
    pub async fn run(
        &self,
        prompt: &str,
        resume: bool,
        session_id: Option<&str>,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let sandbox_id = self.sandbox_id()?;
        let sandbox = self.sandbox.get_sandbox(&sandbox_id).await?;
        if !sandbox.state_in(RUNNING_STATES) {
            bail!(
                "sandbox for '{}' is not running (state: {}); start the session first",
                self.config.slug,
                sandbox.state.as_deref().unwrap_or("unknown")
            );
        }

        let conversation_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let executor = SandboxPty {
            client: Arc::clone(&self.sandbox),
            sandbox_id,
            timeout: PTY_TIMEOUT,
        };
        self.ai
            .run(prompt, &conversation_id, resume, CODE_PATH, &executor, on_line)
            .await?;

        Ok(conversation_id)
    }

    /// Stop the sandbox. Absence is not an error.
    pub async fn stop(&self) -> Result<()> {
        let Some(sandbox_id) = self.state.lock().sandbox_id.clone() else {
            return Ok(());
        };
        match self.sandbox.stop_sandbox(&sandbox_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Tear down everything this session created. Every step is
    /// best-effort: cleanup never fails, it only warns.
    pub async fn delete(&self) {
        let sandbox_id = self.state.lock().sandbox_id.clone();
        if let Some(sandbox_id) = sandbox_id {
            if let Err(e) = self.stop().await {
                tracing::warn!("failed to stop sandbox {sandbox_id}: {e}");
            }
            if let Err(e) = self
                .sandbox
                .wait_for_sandbox(&sandbox_id, &["stopped", "error"], STOP_WAIT_TIMEOUT)
                .await
            {
                tracing::warn!("sandbox {sandbox_id} did not reach stopped: {e}");
            }
            if let Err(e) = self.sandbox.delete_sandbox(&sandbox_id).await {
                tracing::warn!("failed to delete sandbox {sandbox_id}: {e}");
            }
        }

        if let Some(edge) = &self.edge {
            edge.delete_worker(&self.resource_name(), &edge.hostname(&self.config.slug))
                .await;
            if let Some(tunnel_id) = self.state.lock().tunnel_id.clone() {
                edge.delete_tunnel(&tunnel_id).await;
            }
        }
    }

    /// Statuses of the overmind-managed processes.
    pub async fn process_statuses(&self) -> Result<Vec<ProcessStatus>> {
        let sandbox_id = self.sandbox_id()?;
        let command = format!("cd {CODE_PATH} && {MISE_PATH_EXPORT} && overmind status");
        let out = self
            .sandbox
            .execute_command(&sandbox_id, &shell_wrap(&command), COMMAND_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            bail!("overmind status failed with exit code {}: {}", out.exit_code, out.output);
        }
        Ok(parse_process_statuses(&out.output))
    }

    pub async fn restart_process(&self, process: &str) -> Result<()> {
        let sandbox_id = self.sandbox_id()?;
        let command = format!("cd {CODE_PATH} && {MISE_PATH_EXPORT} && overmind restart {process}");
        let out = self
            .sandbox
            .execute_command(&sandbox_id, &shell_wrap(&command), STOP_WAIT_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            bail!(
                "overmind restart {process} failed with exit code {}: {}",
                out.exit_code,
                out.output
            );
        }
        Ok(())
    }

    /// A bounded window of one process's recent log output. Overmind has no
    /// one-shot dump, so the echo stream is sampled for a few seconds and
    /// tailed.
    pub async fn process_logs(&self, process: &str, lines: usize) -> Result<String> {
        let sandbox_id = self.sandbox_id()?;
        let command = format!(
            "cd {CODE_PATH} && {MISE_PATH_EXPORT} && timeout 5 overmind echo {process} | tail -n {lines}"
        );
        let out = self
            .sandbox
            .execute_command(&sandbox_id, &shell_wrap(&command), COMMAND_TIMEOUT)
            .await?;
        // `timeout` exits 124 when the window elapses; that is the expected path.
        Ok(out.output)
    }

    /// Stream one process's log output until the caller drops the stream.
    pub async fn follow_process_logs(
        &self,
        process: &str,
        on_chunk: PtyChunkSink<'_>,
    ) -> Result<()> {
        let sandbox_id = self.sandbox_id()?;
        let command = format!("cd {CODE_PATH} && {MISE_PATH_EXPORT} && overmind echo {process}");
        self.sandbox
            .run_pty_command(&sandbox_id, &command, LOG_FOLLOW_TIMEOUT, on_chunk)
            .await?;
        Ok(())
    }

    async fn ensure_tunnel(
        &self,
        edge: &dyn EdgeClient,
        name: &str,
        on_event: EventSink<'_>,
    ) -> Result<TunnelCredentials> {
        let hostname = edge.hostname(&self.config.slug);

        let existing = {
            let state = self.state.lock();
            state.tunnel_id.clone().zip(state.tunnel_token.clone())
        };
        let credentials = match existing {
            Some((tunnel_id, token)) => TunnelCredentials { tunnel_id, token },
            None => {
                let credentials = edge.create_tunnel(name, &hostname).await?;
                {
                    let mut state = self.state.lock();
                    state.tunnel_id = Some(credentials.tunnel_id.clone());
                    state.tunnel_token = Some(credentials.token.clone());
                }
                on_event(SessionEvent::TunnelCreated {
                    tunnel_id: credentials.tunnel_id.clone(),
                    tunnel_token: credentials.token.clone(),
                });
                credentials
            }
        };

        edge.ensure_tunnel_dns(&hostname, &credentials.tunnel_id).await?;
        Ok(credentials)
    }

    async fn setup_postgres(&self, sandbox_id: &str) -> Result<()> {
        let start = self
            .sandbox
            .execute_command(
                sandbox_id,
                &shell_wrap("sudo service postgresql start"),
                COMMAND_TIMEOUT,
            )
            .await?;
        if start.exit_code != 0 {
            bail!("failed to start postgresql: {}", start.output);
        }

        let user = self
            .sandbox
            .execute_command(
                sandbox_id,
                &shell_wrap("sudo -u postgres createuser --superuser \"$(whoami)\" 2>&1"),
                COMMAND_TIMEOUT,
            )
            .await?;
        if user.exit_code != 0 && !user.output.contains("already exists") {
            bail!("failed to create postgres superuser: {}", user.output);
        }

        let db = self.database_name();
        let created = self
            .sandbox
            .execute_command(
                sandbox_id,
                &shell_wrap(&format!("createdb {db} 2>&1")),
                COMMAND_TIMEOUT,
            )
            .await?;
        if created.exit_code != 0 && !created.output.contains("already exists") {
            bail!("failed to create database {db}: {}", created.output);
        }

        Ok(())
    }

    async fn run_install_steps(&self, sandbox_id: &str, on_event: EventSink<'_>) -> Result<()> {
        let db = self.database_name();
        for step in &self.config.install {
            on_event(SessionEvent::InstallStart {
                name: step.name().to_string(),
                command: step.command().to_string(),
            });

            let command = format!(
                "cd {CODE_PATH} && {MISE_PATH_EXPORT} && POSTGRES_DB={db} {}",
                step.command()
            );
            let out = self
                .sandbox
                .execute_command(sandbox_id, &shell_wrap(&command), INSTALL_TIMEOUT)
                .await?;

            on_event(SessionEvent::InstallComplete {
                name: step.name().to_string(),
                command: step.command().to_string(),
                exit_code: out.exit_code,
                output: out.output.clone(),
            });

            if out.exit_code != 0 {
                bail!(
                    "install step '{}' failed with exit code {}: {}",
                    step.command(),
                    out.exit_code,
                    out.output
                );
            }
        }
        Ok(())
    }

    async fn start_app_shell(&self, sandbox_id: &str) -> Result<()> {
        self.sandbox.create_session(sandbox_id, APP_SHELL).await?;
        let db = self.database_name();
        let command = format!(
            "cd {CODE_PATH} && {MISE_PATH_EXPORT} && POSTGRES_DB={db} PORT=3000 overmind start"
        );
        self.sandbox
            .session_execute(sandbox_id, APP_SHELL, &command)
            .await?;
        Ok(())
    }

    async fn start_tunnel_shell(&self, sandbox_id: &str, token: &str) -> Result<()> {
        self.sandbox
            .upload_file(sandbox_id, TUNNEL_TOKEN_PATH, token.as_bytes().to_vec())
            .await?;
        self.sandbox.create_session(sandbox_id, TUNNEL_SHELL).await?;
        // The sandbox network blocks the default QUIC transport; http2 is
        // the one that connects.
        let command = format!(
            "cloudflared tunnel run --protocol http2 --token-file {TUNNEL_TOKEN_PATH}"
        );
        self.sandbox
            .session_execute(sandbox_id, TUNNEL_SHELL, &command)
            .await?;
        Ok(())
    }
}

/// PTY executor bound to one sandbox, handed to the AI backend.
struct SandboxPty {
    client: Arc<dyn SandboxClient>,
    sandbox_id: String,
    timeout: Duration,
}

#[async_trait]
impl PtyExecutor for SandboxPty {
    async fn run(&self, command: &str, on_chunk: PtyChunkSink<'_>) -> Result<()> {
        self.client
            .run_pty_command(&self.sandbox_id, command, self.timeout, on_chunk)
            .await
            .map_err(anyhow::Error::from)
    }
}

/// Wrap a command for the provider's no-shell executor.
fn shell_wrap(command: &str) -> String {
    format!("sh -c {}", shell_quote(command))
}

/// `name: command` lines, one per managed process.
fn procfile(processes: &BTreeMap<String, String>) -> String {
    processes
        .iter()
        .map(|(name, command)| format!("{name}: {command}\n"))
        .collect()
}

/// Rewrite scp-style `git@host:owner/repo` remotes to HTTPS.
fn normalize_git_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            return format!("https://{host}/{path}");
        }
    }
    url.to_string()
}

/// Parse `overmind status` output: lines of `name | status`.
fn parse_process_statuses(output: &str) -> Vec<ProcessStatus> {
    output
        .lines()
        .filter_map(|line| {
            let (name, status) = line.split_once('|')?;
            let name = name.trim();
            let status = status.trim();
            if name.is_empty() || status.is_empty() || name.eq_ignore_ascii_case("process") {
                return None;
            }
            Some(ProcessStatus {
                name: name.to_string(),
                status: status.to_string(),
            })
        })
        .collect()
}
