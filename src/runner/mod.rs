//! AI runner: backend abstraction over in-sandbox coding assistants.
//!
//! A backend builds the command line for its CLI, and `run` drives it over
//! a PTY supplied by the caller, pushing one validated JSON line at a time
//! to the line callback. Currently one backend exists:
//!
//! - [`claude::ClaudeCode`] — Claude Code in stream-json mode

pub mod claude;
pub mod stream;

pub use claude::ClaudeCode;
pub use stream::JsonLineFilter;

use crate::sandbox::PtyChunkSink;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Shell prefix putting the sandbox's language-toolchain shims on PATH.
pub const MISE_PATH_EXPORT: &str =
    "export PATH=\"$HOME/.local/share/mise/shims:$HOME/.local/bin:$PATH\"";

/// One PTY execution bound to a concrete sandbox. The orchestrator supplies
/// this so backends stay ignorant of the provider.
#[async_trait]
pub trait PtyExecutor: Send + Sync {
    async fn run(&self, command: &str, on_chunk: PtyChunkSink<'_>) -> anyhow::Result<()>;
}

/// A conversational coding-assistant backend.
#[async_trait]
pub trait AiBackend: Send + Sync {
    /// Environment the backend's CLI needs inside the sandbox.
    fn env_vars(&self) -> BTreeMap<String, String>;

    /// Full shell command for one invocation. `session_flag` addresses the
    /// conversation (`--session-id <uuid>` or `--resume <uuid>`).
    fn build_command(&self, session_flag: &str, prompt: &str) -> String;

    /// Run one prompt against the working copy at `cwd`, streaming each
    /// validated JSON output line to `on_line`. Returns when the PTY closes.
    async fn run(
        &self,
        prompt: &str,
        session_id: &str,
        resume: bool,
        cwd: &str,
        executor: &dyn PtyExecutor,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<()>;
}

/// Single-quote `s` for POSIX shells, escaping embedded quotes.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
