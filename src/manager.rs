//! Snapshot manager: the shared base snapshot every session of a service
//! is instantiated from, plus the destroy sweep over a catalog.

use crate::cloudflare::EdgeClient;
use crate::runtime::RuntimeImage;
use crate::sandbox::SandboxClient;
use crate::store::SessionRecord;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Resources for the base snapshot build.
const SNAPSHOT_CPU: u32 = 2;
const SNAPSHOT_MEMORY_GIB: u32 = 4;
const SNAPSHOT_DISK_GIB: u32 = 10;

/// Image builds are slow; give them ten minutes.
const SNAPSHOT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period after deleting a snapshot before rebuilding under the same
/// name, so the deletion can propagate provider-side.
const DELETE_SETTLE: Duration = Duration::from_secs(5);

/// Manages the `kml-<service>` base snapshot.
pub struct SnapshotManager {
    service_name: String,
    sandbox: Arc<dyn SandboxClient>,
    runtime: Arc<dyn RuntimeImage>,
}

impl SnapshotManager {
    pub fn new(
        service_name: impl Into<String>,
        sandbox: Arc<dyn SandboxClient>,
        runtime: Arc<dyn RuntimeImage>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            sandbox,
            runtime,
        }
    }

    pub fn snapshot_name(&self) -> String {
        format!("kml-{}", self.service_name)
    }

    /// Idempotent: build the base snapshot unless it already exists.
    pub async fn deploy(&self) -> Result<bool> {
        let name = self.snapshot_name();
        if let Some(existing) = self.sandbox.find_snapshot_by_name(&name).await? {
            tracing::info!("snapshot {name} already exists ({})", existing.id);
            return Ok(false);
        }
        self.build(&name).await?;
        Ok(true)
    }

    /// Unconditional rebuild: drop any existing snapshot first.
    pub async fn snapshot_create(&self) -> Result<()> {
        let name = self.snapshot_name();
        if let Some(existing) = self.sandbox.find_snapshot_by_name(&name).await? {
            self.sandbox.delete_snapshot(&existing.id).await?;
            tokio::time::sleep(DELETE_SETTLE).await;
        }
        self.build(&name).await
    }

    /// Delete the base snapshot if present.
    pub async fn snapshot_delete(&self) -> Result<bool> {
        let name = self.snapshot_name();
        match self.sandbox.find_snapshot_by_name(&name).await? {
            Some(existing) => {
                self.sandbox.delete_snapshot(&existing.id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tear down every session in the catalog: sandbox, edge worker, and
    /// tunnel, then hand the slug to `delete_record` so the caller can drop
    /// it from the catalog. Per-session failures are warnings; the sweep
    /// always finishes. The base snapshot is left intact.
    pub async fn destroy(
        &self,
        sessions: &BTreeMap<String, SessionRecord>,
        edge: Option<&dyn EdgeClient>,
        mut delete_record: impl FnMut(&str),
    ) {
        for (slug, record) in sessions {
            if let Some(sandbox_id) = &record.sandbox_id {
                if let Err(e) = self.sandbox.delete_sandbox(sandbox_id).await {
                    if e.is_not_found() {
                        tracing::debug!("sandbox {sandbox_id} already gone");
                    } else {
                        tracing::warn!("failed to delete sandbox {sandbox_id} for {slug}: {e}");
                    }
                }
            }

            if let Some(edge) = edge {
                let worker_name = format!("kml-{}-{slug}", self.service_name);
                edge.delete_worker(&worker_name, &edge.hostname(slug)).await;
                if let Some(tunnel_id) = &record.tunnel_id {
                    edge.delete_tunnel(tunnel_id).await;
                }
            }

            delete_record(slug);
        }
    }

    async fn build(&self, name: &str) -> Result<()> {
        let created = self
            .sandbox
            .create_snapshot(
                name,
                &self.runtime.dockerfile(),
                SNAPSHOT_CPU,
                SNAPSHOT_MEMORY_GIB,
                SNAPSHOT_DISK_GIB,
            )
            .await?;
        self.sandbox
            .wait_for_snapshot(&created.id, SNAPSHOT_BUILD_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::{TunnelCredentials, WorkerDeployment};
    use crate::error::ApiResult;
    use crate::runtime::RailsRuntime;
    use crate::sandbox::{
        CommandOutput, CreateSandboxRequest, PtyChunkSink, SandboxInfo, SnapshotInfo,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StubProvider {
        calls: Mutex<Vec<String>>,
        snapshot_exists: bool,
    }

    impl StubProvider {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SandboxClient for StubProvider {
        async fn create_snapshot(
            &self,
            name: &str,
            build_file: &str,
            cpu: u32,
            memory_gib: u32,
            disk_gib: u32,
        ) -> ApiResult<SnapshotInfo> {
            assert!(build_file.contains("FROM"));
            self.calls
                .lock()
                .push(format!("create_snapshot {name} {cpu}cpu {memory_gib}gib {disk_gib}disk"));
            Ok(SnapshotInfo {
                id: "snap-1".into(),
                name: Some(name.into()),
                state: Some("ready".into()),
            })
        }

        async fn find_snapshot_by_name(&self, name: &str) -> ApiResult<Option<SnapshotInfo>> {
            self.calls.lock().push(format!("find_snapshot {name}"));
            Ok(self.snapshot_exists.then(|| SnapshotInfo {
                id: "snap-old".into(),
                name: Some(name.into()),
                state: Some("ready".into()),
            }))
        }

        async fn wait_for_snapshot(
            &self,
            id: &str,
            _timeout: std::time::Duration,
        ) -> ApiResult<SnapshotInfo> {
            self.calls.lock().push(format!("wait_snapshot {id}"));
            Ok(SnapshotInfo {
                id: id.into(),
                name: None,
                state: Some("ready".into()),
            })
        }

        async fn delete_snapshot(&self, id: &str) -> ApiResult<()> {
            self.calls.lock().push(format!("delete_snapshot {id}"));
            Ok(())
        }

        async fn create_sandbox(&self, _req: &CreateSandboxRequest) -> ApiResult<SandboxInfo> {
            unimplemented!()
        }

        async fn get_sandbox(&self, _id: &str) -> ApiResult<SandboxInfo> {
            unimplemented!()
        }

        async fn find_sandbox_by_name(&self, _name: &str) -> ApiResult<Option<SandboxInfo>> {
            Ok(None)
        }

        async fn list_sandboxes(&self) -> ApiResult<Vec<SandboxInfo>> {
            Ok(Vec::new())
        }

        async fn start_sandbox(&self, _id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn stop_sandbox(&self, _id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn delete_sandbox(&self, id: &str) -> ApiResult<()> {
            self.calls.lock().push(format!("delete_sandbox {id}"));
            Ok(())
        }

        async fn wait_for_sandbox(
            &self,
            _id: &str,
            _target_states: &[&str],
            _timeout: std::time::Duration,
        ) -> ApiResult<SandboxInfo> {
            unimplemented!()
        }

        async fn upload_file(&self, _s: &str, _p: &str, _b: Vec<u8>) -> ApiResult<()> {
            Ok(())
        }

        async fn execute_command(
            &self,
            _s: &str,
            _c: &str,
            _t: std::time::Duration,
        ) -> ApiResult<CommandOutput> {
            unimplemented!()
        }

        async fn git_clone(
            &self,
            _s: &str,
            _u: &str,
            _p: &str,
            _b: &str,
            _user: Option<&str>,
            _pass: Option<&str>,
        ) -> ApiResult<()> {
            Ok(())
        }

        async fn create_session(&self, _s: &str, _id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn session_execute(&self, _s: &str, _id: &str, _c: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn run_pty_command(
            &self,
            _s: &str,
            _c: &str,
            _t: std::time::Duration,
            _on_chunk: PtyChunkSink<'_>,
        ) -> ApiResult<()> {
            Ok(())
        }
    }

    /// Recording stub edge for sweep assertions.
    #[derive(Default)]
    struct StubEdge {
        calls: Mutex<Vec<String>>,
    }

    impl StubEdge {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl EdgeClient for StubEdge {
        fn hostname(&self, slug: &str) -> String {
            format!("{slug}.dev.example.com")
        }

        async fn create_tunnel(
            &self,
            _name: &str,
            _hostname: &str,
        ) -> ApiResult<TunnelCredentials> {
            unimplemented!()
        }

        async fn ensure_tunnel_dns(&self, _hostname: &str, _tunnel_id: &str) -> ApiResult<()> {
            unimplemented!()
        }

        async fn deploy_worker(&self, _deployment: &WorkerDeployment) -> ApiResult<()> {
            unimplemented!()
        }

        async fn delete_worker(&self, worker_name: &str, hostname: &str) {
            self.calls
                .lock()
                .push(format!("delete_worker {worker_name} {hostname}"));
        }

        async fn delete_tunnel(&self, tunnel_id: &str) {
            self.calls.lock().push(format!("delete_tunnel {tunnel_id}"));
        }
    }

    fn manager(stub: Arc<StubProvider>) -> SnapshotManager {
        SnapshotManager::new("demo", stub, Arc::new(RailsRuntime))
    }

    #[tokio::test]
    async fn deploy_is_idempotent() {
        let existing = Arc::new(StubProvider {
            snapshot_exists: true,
            ..StubProvider::default()
        });
        assert!(!manager(Arc::clone(&existing)).deploy().await.unwrap());
        assert!(!existing.calls().iter().any(|c| c.starts_with("create_snapshot")));

        let fresh = Arc::new(StubProvider::default());
        assert!(manager(Arc::clone(&fresh)).deploy().await.unwrap());
        assert!(fresh
            .calls()
            .iter()
            .any(|c| c == "create_snapshot kml-demo 2cpu 4gib 10disk"));
        assert!(fresh.calls().iter().any(|c| c == "wait_snapshot snap-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_create_rebuilds() {
        let stub = Arc::new(StubProvider {
            snapshot_exists: true,
            ..StubProvider::default()
        });
        manager(Arc::clone(&stub)).snapshot_create().await.unwrap();

        let calls = stub.calls();
        let delete = calls.iter().position(|c| c == "delete_snapshot snap-old").unwrap();
        let create = calls
            .iter()
            .position(|c| c.starts_with("create_snapshot kml-demo"))
            .unwrap();
        assert!(delete < create);
    }

    #[tokio::test]
    async fn snapshot_delete_reports_presence() {
        let stub = Arc::new(StubProvider {
            snapshot_exists: true,
            ..StubProvider::default()
        });
        assert!(manager(Arc::clone(&stub)).snapshot_delete().await.unwrap());

        let none = Arc::new(StubProvider::default());
        assert!(!manager(Arc::clone(&none)).snapshot_delete().await.unwrap());
    }

    #[tokio::test]
    async fn destroy_sweeps_all_sessions() {
        let stub = Arc::new(StubProvider::default());
        let sessions = BTreeMap::from([
            (
                "a".to_string(),
                SessionRecord {
                    slug: "a".into(),
                    sandbox_id: Some("sa".into()),
                    tunnel_id: Some("ta".into()),
                    ..SessionRecord::default()
                },
            ),
            (
                "b".to_string(),
                SessionRecord {
                    slug: "b".into(),
                    sandbox_id: Some("sb".into()),
                    ..SessionRecord::default()
                },
            ),
        ]);

        let mut deleted = Vec::new();
        manager(Arc::clone(&stub))
            .destroy(&sessions, None, |slug| deleted.push(slug.to_string()))
            .await;

        assert_eq!(deleted, vec!["a", "b"]);
        let calls = stub.calls();
        assert!(calls.contains(&"delete_sandbox sa".to_string()));
        assert!(calls.contains(&"delete_sandbox sb".to_string()));
        // The base snapshot survives a destroy.
        assert!(!calls.iter().any(|c| c.starts_with("delete_snapshot")));
    }

    #[tokio::test]
    async fn destroy_cleans_edge_resources() {
        let stub = Arc::new(StubProvider::default());
        let edge = StubEdge::default();
        let sessions = BTreeMap::from([
            (
                "a".to_string(),
                SessionRecord {
                    slug: "a".into(),
                    sandbox_id: Some("sa".into()),
                    tunnel_id: Some("ta".into()),
                    ..SessionRecord::default()
                },
            ),
            (
                "b".to_string(),
                SessionRecord {
                    slug: "b".into(),
                    sandbox_id: Some("sb".into()),
                    ..SessionRecord::default()
                },
            ),
        ]);

        let mut deleted = Vec::new();
        manager(Arc::clone(&stub))
            .destroy(&sessions, Some(&edge), |slug| deleted.push(slug.to_string()))
            .await;

        assert_eq!(deleted, vec!["a", "b"]);
        // Worker teardown per session; tunnel only where one was recorded.
        assert_eq!(
            edge.calls(),
            vec![
                "delete_worker kml-demo-a a.dev.example.com",
                "delete_tunnel ta",
                "delete_worker kml-demo-b b.dev.example.com",
            ]
        );
    }
}
