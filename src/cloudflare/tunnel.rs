//! Tunnel management: one dedicated cloudflared tunnel per session.
//!
//! Creation is find-or-create by name so a crashed `start` can re-run
//! without leaking tunnels. The ingress config is re-asserted on every
//! call, which heals a half-configured tunnel.

use super::CloudflareClient;
use crate::error::{ApiError, ApiResult};
use base64::Engine as _;
use rand::RngCore;
use serde_json::json;

/// What a session needs to route traffic: the tunnel's id (for DNS) and the
/// connect token the in-sandbox cloudflared daemon authenticates with.
#[derive(Debug, Clone)]
pub struct TunnelCredentials {
    pub tunnel_id: String,
    pub token: String,
}

impl CloudflareClient {
    /// Find or create the tunnel named `name`, point its ingress at the
    /// session hostname, and fetch the connect token.
    pub async fn create_tunnel(&self, name: &str, hostname: &str) -> ApiResult<TunnelCredentials> {
        let tunnel_id = match self.find_tunnel_by_name(name).await? {
            Some(id) => id,
            None => {
                let body = json!({
                    "name": name,
                    "tunnel_secret": generate_tunnel_secret(),
                    "config_src": "cloudflare",
                });
                let result = self.post(self.account_url("/cfd_tunnel"), &body).await?;
                result["id"].as_str().unwrap_or_default().to_string()
            }
        };
        if tunnel_id.is_empty() {
            return Err(ApiError::Server {
                status: 200,
                message: format!("tunnel create for '{name}' returned no id"),
            });
        }

        self.put_tunnel_config(&tunnel_id, hostname).await?;

        let token = self
            .get(self.account_url(&format!("/cfd_tunnel/{tunnel_id}/token")))
            .await?;
        let token = token.as_str().unwrap_or_default().to_string();
        if token.is_empty() {
            return Err(ApiError::Server {
                status: 200,
                message: format!("tunnel {tunnel_id} returned no connect token"),
            });
        }

        Ok(TunnelCredentials { tunnel_id, token })
    }

    /// Tear a tunnel down: live connections first, then the tunnel itself.
    /// Both steps are best-effort; a session delete must not stall on a
    /// half-dead tunnel.
    pub async fn delete_tunnel(&self, tunnel_id: &str) {
        if let Err(e) = self
            .delete(self.account_url(&format!("/cfd_tunnel/{tunnel_id}/connections")))
            .await
        {
            tracing::warn!("failed to drop tunnel {tunnel_id} connections: {e}");
        }
        if let Err(e) = self
            .delete(self.account_url(&format!("/cfd_tunnel/{tunnel_id}")))
            .await
        {
            tracing::warn!("failed to delete tunnel {tunnel_id}: {e}");
        }
    }

    async fn find_tunnel_by_name(&self, name: &str) -> ApiResult<Option<String>> {
        let result = self
            .get(self.account_url(&format!(
                "/cfd_tunnel?name={}&is_deleted=false",
                urlencoding::encode(name)
            )))
            .await?;
        let id = result
            .as_array()
            .and_then(|tunnels| tunnels.first())
            .and_then(|t| t["id"].as_str())
            .map(|s| s.to_string());
        Ok(id)
    }

    async fn put_tunnel_config(&self, tunnel_id: &str, hostname: &str) -> ApiResult<()> {
        let body = ingress_config(hostname);
        self.put(
            self.account_url(&format!("/cfd_tunnel/{tunnel_id}/configurations")),
            &body,
        )
        .await
        .map(|_| ())
    }
}

/// Route `hostname` to the app port inside the sandbox; everything else 404s.
fn ingress_config(hostname: &str) -> serde_json::Value {
    json!({
        "config": {
            "ingress": [
                { "hostname": hostname, "service": "http://localhost:3000" },
                { "service": "http_status:404" },
            ]
        }
    })
}

/// 32 random bytes, base64-encoded, as the tunnel secret.
fn generate_tunnel_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn ingress_routes_hostname_then_404() {
        let config = ingress_config("s.dev.example.com");
        let ingress = config["config"]["ingress"].as_array().unwrap();
        assert_eq!(ingress.len(), 2);
        assert_eq!(ingress[0]["hostname"], "s.dev.example.com");
        assert_eq!(ingress[0]["service"], "http://localhost:3000");
        assert_eq!(ingress[1]["service"], "http_status:404");
        assert!(ingress[1]["hostname"].is_null());
    }

    #[test]
    fn tunnel_secret_is_32_bytes_base64() {
        let secret = generate_tunnel_secret();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(secret)
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }
}
