//! Claude Code backend.
//!
//! Builds the in-sandbox invocation of the `claude` CLI in stream-json mode
//! and feeds its PTY output through [`JsonLineFilter`].

use super::stream::JsonLineFilter;
use super::{shell_quote, AiBackend, PtyExecutor, MISE_PATH_EXPORT};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Claude Code CLI backend.
pub struct ClaudeCode {
    auth_token: String,
    /// Alternative API endpoint (proxies, regional gateways).
    base_url: Option<String>,
}

impl ClaudeCode {
    pub fn new(auth_token: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            base_url,
        }
    }
}

#[async_trait]
impl AiBackend for ClaudeCode {
    fn env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([(
            "ANTHROPIC_AUTH_TOKEN".to_string(),
            self.auth_token.clone(),
        )]);
        if let Some(url) = &self.base_url {
            env.insert("ANTHROPIC_BASE_URL".to_string(), url.clone());
        }
        env
    }

    fn build_command(&self, session_flag: &str, prompt: &str) -> String {
        let mut command = format!(
            "{MISE_PATH_EXPORT} && export ANTHROPIC_AUTH_TOKEN={}",
            self.auth_token
        );
        if let Some(url) = &self.base_url {
            command.push_str(&format!(" && export ANTHROPIC_BASE_URL={url}"));
        }
        command.push_str(&format!(
            " && claude {session_flag} --dangerously-skip-permissions -p --verbose \
             --output-format=stream-json --include-partial-messages {}",
            shell_quote(prompt)
        ));
        command
    }

    async fn run(
        &self,
        prompt: &str,
        session_id: &str,
        resume: bool,
        cwd: &str,
        executor: &dyn PtyExecutor,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> anyhow::Result<()> {
        let session_flag = if resume {
            format!("--resume {session_id}")
        } else {
            format!("--session-id {session_id}")
        };
        let command = format!("cd {cwd} && {}", self.build_command(&session_flag, prompt));

        let mut filter = JsonLineFilter::new();
        executor
            .run(&command, &mut |chunk: &[u8]| {
                for line in filter.push(chunk) {
                    on_line(&line);
                }
            })
            .await?;

        if let Some(line) = filter.finish() {
            on_line(&line);
        }
        Ok(())
    }
}
