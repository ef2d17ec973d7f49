//! Session configuration — the record of everything one session needs:
//! repository, install steps, managed processes, and the resume fields
//! carried over from the catalog when re-attaching to an existing sandbox.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry in the install list: either a bare command string or a
/// `{name, command}` pair when the caller wants a display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InstallStep {
    Command(String),
    Named { name: String, command: String },
}

impl InstallStep {
    /// Display name for progress events. A bare command is its own name.
    pub fn name(&self) -> &str {
        match self {
            InstallStep::Command(c) => c,
            InstallStep::Named { name, .. } => name,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            InstallStep::Command(c) => c,
            InstallStep::Named { command, .. } => command,
        }
    }
}

/// Everything the orchestrator needs to drive one session.
///
/// `access_token` is generated by the catalog before any external resource
/// exists and is never rotated. The `sandbox_id` / `tunnel_*` fields are
/// empty on a fresh session and populated when resuming one.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub slug: String,
    pub service_name: String,

    pub git_repo: Option<String>,
    /// Defaults to `main` when unset.
    pub git_branch: Option<String>,
    pub git_token: Option<String>,

    pub install: Vec<InstallStep>,
    pub processes: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,

    // Resume state, sourced from the session record.
    pub access_token: String,
    pub sandbox_id: Option<String>,
    pub created_at: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_token: Option<String>,

    // Edge worker extensions.
    pub worker_files: BTreeMap<String, String>,
    pub worker_bindings: BTreeMap<String, String>,
    pub worker_injection: Option<String>,
}

impl SessionConfig {
    pub fn git_branch(&self) -> &str {
        self.git_branch.as_deref().unwrap_or("main")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_step_accepts_both_shapes() {
        let steps: Vec<InstallStep> = serde_json::from_str(
            r#"["bundle install", {"name": "migrate", "command": "bin/rails db:migrate"}]"#,
        )
        .unwrap();
        assert_eq!(steps[0].name(), "bundle install");
        assert_eq!(steps[0].command(), "bundle install");
        assert_eq!(steps[1].name(), "migrate");
        assert_eq!(steps[1].command(), "bin/rails db:migrate");
    }

    #[test]
    fn branch_defaults_to_main() {
        let config = SessionConfig::default();
        assert_eq!(config.git_branch(), "main");

        let config = SessionConfig {
            git_branch: Some("develop".into()),
            ..SessionConfig::default()
        };
        assert_eq!(config.git_branch(), "develop");
    }
}
