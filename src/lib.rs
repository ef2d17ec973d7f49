//! kml — ephemeral development sandboxes for AI-assisted coding.
//!
//! Given a repository and a small configuration, kml builds a base image
//! snapshot at the sandbox provider, creates one isolated sandbox per named
//! session, exposes the sandbox's HTTP port behind a per-session
//! authenticated URL on the edge, and runs a conversational coding
//! assistant inside the sandbox against the working copy.

pub mod cloudflare;
pub mod config;
pub mod error;
pub mod manager;
pub mod runner;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod store;

pub use cloudflare::{CloudflareClient, EdgeClient, TunnelCredentials, WorkerDeployment};
pub use config::{InstallStep, SessionConfig};
pub use error::{ApiError, ApiResult};
pub use manager::SnapshotManager;
pub use runner::{AiBackend, ClaudeCode, JsonLineFilter, PtyExecutor};
pub use runtime::{RailsRuntime, RuntimeImage};
pub use sandbox::{DaytonaClient, SandboxClient};
pub use session::{ProcessStatus, Session, SessionEvent};
pub use store::{Conversation, SessionCatalog, SessionRecord};
