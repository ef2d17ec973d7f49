//! DNS management: the proxied CNAME pointing a session hostname at its
//! tunnel.

use super::CloudflareClient;
use crate::error::ApiResult;
use serde_json::json;

/// What an upsert decided to do with the existing record set.
#[derive(Debug, PartialEq, Eq)]
enum DnsAction {
    /// The record already points at the tunnel; leave it alone.
    Keep,
    /// The record exists with stale content; replace it in place.
    Replace(String),
    /// No record yet; create one.
    Create,
}

/// Pick the upsert branch from the found record (id, content), if any.
fn dns_action(existing: Option<(String, String)>, target: &str) -> DnsAction {
    match existing {
        Some((_, content)) if content == target => DnsAction::Keep,
        Some((record_id, _)) => DnsAction::Replace(record_id),
        None => DnsAction::Create,
    }
}

/// CNAME target for a tunnel.
fn tunnel_target(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}

/// Request body for creating or replacing the session CNAME.
fn cname_record(hostname: &str, target: &str) -> serde_json::Value {
    json!({
        "type": "CNAME",
        "name": hostname,
        "content": target,
        "proxied": true,
        "ttl": 1,
    })
}

impl CloudflareClient {
    /// Upsert `hostname → <tunnel_id>.cfargotunnel.com` as a proxied CNAME.
    /// Idempotent: an existing record with the right content is left alone,
    /// one with stale content is replaced.
    pub async fn ensure_tunnel_dns(&self, hostname: &str, tunnel_id: &str) -> ApiResult<()> {
        let target = tunnel_target(tunnel_id);
        let body = cname_record(hostname, &target);

        match dns_action(self.find_cname(hostname).await?, &target) {
            DnsAction::Keep => {
                tracing::debug!("DNS record for {hostname} already points at {target}");
                Ok(())
            }
            DnsAction::Replace(record_id) => self
                .put(self.zone_url(&format!("/dns_records/{record_id}")), &body)
                .await
                .map(|_| ()),
            DnsAction::Create => self
                .post(self.zone_url("/dns_records"), &body)
                .await
                .map(|_| ()),
        }
    }

    /// Delete every DNS record for `hostname`, best-effort.
    pub async fn delete_hostname_records(&self, hostname: &str) {
        let records = match self
            .get(self.zone_url(&format!(
                "/dns_records?name={}",
                urlencoding::encode(hostname)
            )))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("failed to list DNS records for {hostname}: {e}");
                return;
            }
        };

        for record in records.as_array().into_iter().flatten() {
            let Some(record_id) = record["id"].as_str() else {
                continue;
            };
            if let Err(e) = self
                .delete(self.zone_url(&format!("/dns_records/{record_id}")))
                .await
            {
                tracing::warn!("failed to delete DNS record {record_id} for {hostname}: {e}");
            }
        }
    }

    async fn find_cname(&self, hostname: &str) -> ApiResult<Option<(String, String)>> {
        let result = self
            .get(self.zone_url(&format!(
                "/dns_records?type=CNAME&name={}",
                urlencoding::encode(hostname)
            )))
            .await?;

        let found = result.as_array().and_then(|records| records.first()).map(|r| {
            (
                r["id"].as_str().unwrap_or_default().to_string(),
                r["content"].as_str().unwrap_or_default().to_string(),
            )
        });
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cname_record_is_a_proxied_tunnel_alias() {
        let target = tunnel_target("t-1");
        assert_eq!(target, "t-1.cfargotunnel.com");

        let body = cname_record("s.dev.example.com", &target);
        assert_eq!(body["type"], "CNAME");
        assert_eq!(body["name"], "s.dev.example.com");
        assert_eq!(body["content"], "t-1.cfargotunnel.com");
        assert_eq!(body["proxied"], true);
        assert_eq!(body["ttl"], 1);
    }

    #[test]
    fn matching_record_is_kept() {
        let target = tunnel_target("t-1");
        let action = dns_action(Some(("rec-1".into(), target.clone())), &target);
        assert_eq!(action, DnsAction::Keep);
    }

    #[test]
    fn stale_record_is_replaced_in_place() {
        let target = tunnel_target("t-1");
        let stale = Some(("rec-1".to_string(), tunnel_target("t-0")));
        assert_eq!(dns_action(stale, &target), DnsAction::Replace("rec-1".into()));
    }

    #[test]
    fn missing_record_is_created() {
        let target = tunnel_target("t-1");
        assert_eq!(dns_action(None, &target), DnsAction::Create);
    }

    // Running the upsert twice decides Keep the second time, so the second
    // run issues no write.
    #[test]
    fn upsert_is_idempotent() {
        let target = tunnel_target("t-1");

        let first = dns_action(None, &target);
        assert_eq!(first, DnsAction::Create);

        let after_create = Some(("rec-1".to_string(), target.clone()));
        assert_eq!(dns_action(after_create, &target), DnsAction::Keep);
    }
}
