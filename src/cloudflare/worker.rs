//! Worker script and route management: the per-session auth gate.
//!
//! The worker module is embedded at compile time and uploaded with
//! `ACCESS_TOKEN` bound as a secret, so each session's script carries its
//! own credential. The route binds the script to `hostname/*`.

use super::CloudflareClient;
use crate::error::ApiResult;
use serde_json::json;
use std::collections::BTreeMap;

/// The auth worker module deployed in front of every session.
pub const AUTH_WORKER_SCRIPT: &str = include_str!("worker.js");

/// Module name the metadata points at as the entry point.
const MAIN_MODULE: &str = "worker.js";

const COMPATIBILITY_DATE: &str = "2024-11-01";

/// Binding name the optional HTML injection string is exposed under.
const INJECTION_BINDING: &str = "INJECT_HTML";

/// Everything a worker deployment needs.
#[derive(Debug, Clone, Default)]
pub struct WorkerDeployment {
    pub worker_name: String,
    pub access_token: String,
    pub hostname: String,
    /// Extra module files uploaded beside the main module.
    pub files: BTreeMap<String, String>,
    /// Extra plain-text bindings.
    pub bindings: BTreeMap<String, String>,
    /// HTML snippet appended inside `<body>` of HTML responses.
    pub injection: Option<String>,
}

impl CloudflareClient {
    /// Upload the worker module with its bindings, then upsert the route
    /// `hostname/*` → worker.
    pub async fn deploy_worker(&self, deployment: &WorkerDeployment) -> ApiResult<()> {
        let metadata = worker_metadata(deployment);

        let mut form = reqwest::multipart::Form::new()
            .part(
                "metadata",
                reqwest::multipart::Part::text(metadata.to_string())
                    .mime_str("application/json")?,
            )
            .part(
                MAIN_MODULE.to_string(),
                reqwest::multipart::Part::text(AUTH_WORKER_SCRIPT)
                    .file_name(MAIN_MODULE)
                    .mime_str("application/javascript+module")?,
            );

        for (name, content) in &deployment.files {
            let mime = if name.ends_with(".js") || name.ends_with(".mjs") {
                "application/javascript+module"
            } else {
                "text/plain"
            };
            form = form.part(
                name.clone(),
                reqwest::multipart::Part::text(content.clone())
                    .file_name(name.clone())
                    .mime_str(mime)?,
            );
        }

        let resp = self
            .http
            .put(self.account_url(&format!("/workers/scripts/{}", deployment.worker_name)))
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;
        self.decode(resp).await?;

        self.upsert_route(&deployment.hostname, &deployment.worker_name)
            .await
    }

    /// Best-effort teardown of route, DNS records, and the worker script.
    /// Failures are logged and swallowed so a session delete always finishes.
    pub async fn delete_worker(&self, worker_name: &str, hostname: &str) {
        match self.find_route(hostname).await {
            Ok(Some(route_id)) => {
                if let Err(e) = self
                    .delete(self.zone_url(&format!("/workers/routes/{route_id}")))
                    .await
                {
                    tracing::warn!("failed to delete route for {hostname}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to look up route for {hostname}: {e}"),
        }

        self.delete_hostname_records(hostname).await;

        if let Err(e) = self
            .delete(self.account_url(&format!("/workers/scripts/{worker_name}")))
            .await
        {
            tracing::warn!("failed to delete worker {worker_name}: {e}");
        }
    }

    async fn upsert_route(&self, hostname: &str, worker_name: &str) -> ApiResult<()> {
        let pattern = route_pattern(hostname);
        let body = json!({ "pattern": pattern, "script": worker_name });

        match self.find_route(hostname).await? {
            Some(route_id) => self
                .put(self.zone_url(&format!("/workers/routes/{route_id}")), &body)
                .await
                .map(|_| ()),
            None => self
                .post(self.zone_url("/workers/routes"), &body)
                .await
                .map(|_| ()),
        }
    }

    async fn find_route(&self, hostname: &str) -> ApiResult<Option<String>> {
        let pattern = route_pattern(hostname);
        let result = self.get(self.zone_url("/workers/routes")).await?;
        let id = result
            .as_array()
            .into_iter()
            .flatten()
            .find(|r| r["pattern"].as_str() == Some(pattern.as_str()))
            .and_then(|r| r["id"].as_str())
            .map(|s| s.to_string());
        Ok(id)
    }
}

fn route_pattern(hostname: &str) -> String {
    format!("{hostname}/*")
}

/// Module-worker upload metadata: entry point plus bindings. The access
/// token is a secret binding; caller extras are plain text.
fn worker_metadata(deployment: &WorkerDeployment) -> serde_json::Value {
    let mut bindings = vec![json!({
        "type": "secret_text",
        "name": "ACCESS_TOKEN",
        "text": deployment.access_token,
    })];

    for (name, text) in &deployment.bindings {
        bindings.push(json!({
            "type": "plain_text",
            "name": name,
            "text": text,
        }));
    }

    if let Some(injection) = &deployment.injection {
        bindings.push(json!({
            "type": "plain_text",
            "name": INJECTION_BINDING,
            "text": injection,
        }));
    }

    json!({
        "main_module": MAIN_MODULE,
        "compatibility_date": COMPATIBILITY_DATE,
        "bindings": bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> WorkerDeployment {
        WorkerDeployment {
            worker_name: "kml-demo-test-run".into(),
            access_token: "ab".repeat(32),
            hostname: "test-run.dev.example.com".into(),
            ..WorkerDeployment::default()
        }
    }

    #[test]
    fn metadata_binds_access_token_as_secret() {
        let metadata = worker_metadata(&deployment());
        assert_eq!(metadata["main_module"], "worker.js");
        let bindings = metadata["bindings"].as_array().unwrap();
        assert_eq!(bindings[0]["type"], "secret_text");
        assert_eq!(bindings[0]["name"], "ACCESS_TOKEN");
        assert_eq!(bindings[0]["text"], "ab".repeat(32));
    }

    #[test]
    fn metadata_carries_extras_and_injection() {
        let mut d = deployment();
        d.bindings.insert("FEATURE".into(), "on".into());
        d.injection = Some("<script>reload()</script>".into());

        let metadata = worker_metadata(&d);
        let bindings = metadata["bindings"].as_array().unwrap();
        assert_eq!(bindings.len(), 3);
        assert!(bindings
            .iter()
            .any(|b| b["name"] == "FEATURE" && b["type"] == "plain_text"));
        assert!(bindings
            .iter()
            .any(|b| b["name"] == INJECTION_BINDING
                && b["text"] == "<script>reload()</script>"));
    }

    #[test]
    fn route_pattern_covers_whole_host() {
        assert_eq!(
            route_pattern("test-run.dev.example.com"),
            "test-run.dev.example.com/*"
        );
    }

    // The worker script runs at the edge; assert the auth state machine's
    // load-bearing pieces are present in the deployed source.
    #[test]
    fn worker_script_implements_the_auth_gate() {
        assert!(AUTH_WORKER_SCRIPT.contains("env.ACCESS_TOKEN"));
        assert!(AUTH_WORKER_SCRIPT.contains("status: 404"));
        assert!(AUTH_WORKER_SCRIPT.contains("status: 302"));
        assert!(AUTH_WORKER_SCRIPT.contains("searchParams.delete(\"token\")"));
        assert!(AUTH_WORKER_SCRIPT
            .contains("kml_token=${token}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=86400"));
        assert!(AUTH_WORKER_SCRIPT.contains("websocket"));
        assert!(AUTH_WORKER_SCRIPT.contains("HTMLRewriter"));
        assert!(AUTH_WORKER_SCRIPT.contains("/assets/"));
    }
}
