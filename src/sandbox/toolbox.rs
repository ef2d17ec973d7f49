//! In-sandbox toolbox operations for [`DaytonaClient`]: one-shot command
//! execution, file upload, git clone, persistent shell sessions, and the
//! streaming PTY channel.

use super::daytona::DaytonaClient;
use super::{CommandOutput, PtyChunkSink};
use crate::error::{ApiError, ApiResult};
use futures_util::StreamExt;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

/// PTY geometry requested from the provider. Wide enough that the assistant's
/// JSON lines are not soft-wrapped by the terminal.
const PTY_COLS: u16 = 500;
const PTY_ROWS: u16 = 50;

impl DaytonaClient {
    fn toolbox_url(&self, sandbox_id: &str, path: &str) -> String {
        self.url(&format!("/toolbox/{sandbox_id}/toolbox{path}"))
    }

    /// Synchronous single-shot execution. The provider runs the argv
    /// directly; wrap in `sh -c` explicitly when shell syntax is needed.
    pub(crate) async fn toolbox_execute(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> ApiResult<CommandOutput> {
        let body = json!({
            "command": command,
            "timeout": timeout.as_secs(),
        });
        let resp = self
            .http
            .post(self.toolbox_url(sandbox_id, "/process/execute"))
            .header("Authorization", self.auth_header())
            .timeout(timeout + Duration::from_secs(30))
            .json(&body)
            .send()
            .await?;
        let value = self.decode(resp).await?;

        let exit_code = value["exitCode"]
            .as_i64()
            .or_else(|| value["exit_code"].as_i64())
            .unwrap_or(0);
        let output = value["result"]
            .as_str()
            .or_else(|| value["output"].as_str())
            .unwrap_or("")
            .to_string();

        Ok(CommandOutput { exit_code, output })
    }

    pub(crate) async fn toolbox_upload(
        &self,
        sandbox_id: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> ApiResult<()> {
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );

        let url = format!(
            "{}?path={}",
            self.toolbox_url(sandbox_id, "/files/upload"),
            urlencoding::encode(path)
        );
        let resp = self
            .http
            .post(url)
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await?;
        self.decode(resp).await.map(|_| ())
    }

    pub(crate) async fn toolbox_git_clone(
        &self,
        sandbox_id: &str,
        url: &str,
        path: &str,
        branch: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> ApiResult<()> {
        let mut body = json!({
            "url": url,
            "path": path,
            "branch": branch,
        });
        if let Some(username) = username {
            body["username"] = json!(username);
        }
        if let Some(password) = password {
            body["password"] = json!(password);
        }

        let resp = self
            .http
            .post(self.toolbox_url(sandbox_id, "/git/clone"))
            .header("Authorization", self.auth_header())
            .timeout(Duration::from_secs(600))
            .json(&body)
            .send()
            .await?;
        self.decode(resp).await.map(|_| ())
    }

    pub(crate) async fn toolbox_create_session(
        &self,
        sandbox_id: &str,
        session_id: &str,
    ) -> ApiResult<()> {
        let resp = self
            .http
            .post(self.toolbox_url(sandbox_id, "/process/session"))
            .header("Authorization", self.auth_header())
            .json(&json!({ "sessionId": session_id }))
            .send()
            .await?;
        self.decode(resp).await.map(|_| ())
    }

    /// Fire-and-forget: the provider accepts the command and returns while
    /// it keeps running inside the named shell.
    pub(crate) async fn toolbox_session_execute(
        &self,
        sandbox_id: &str,
        session_id: &str,
        command: &str,
    ) -> ApiResult<()> {
        let resp = self
            .http
            .post(self.toolbox_url(sandbox_id, &format!("/process/session/{session_id}/exec")))
            .header("Authorization", self.auth_header())
            .json(&json!({ "command": command, "runAsync": true }))
            .send()
            .await?;
        self.decode(resp).await.map(|_| ())
    }

    /// Open a PTY running `command`, relay its byte stream to `on_chunk`,
    /// and return when the remote side closes (command exit) or `timeout`
    /// elapses. Chunk callbacks are serialized by the single read loop.
    pub(crate) async fn toolbox_run_pty(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
        on_chunk: PtyChunkSink<'_>,
    ) -> ApiResult<()> {
        let pty_id = uuid::Uuid::new_v4().to_string();
        let resp = self
            .http
            .post(self.toolbox_url(sandbox_id, "/process/pty"))
            .header("Authorization", self.auth_header())
            .json(&json!({
                "id": pty_id,
                "cmd": command,
                "cols": PTY_COLS,
                "rows": PTY_ROWS,
            }))
            .send()
            .await?;
        self.decode(resp).await?;

        let ws_url = format!(
            "{}/connect",
            self.toolbox_url(sandbox_id, &format!("/process/pty/{pty_id}"))
        )
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);

        let mut request = ws_url
            .into_client_request()
            .map_err(|e| stream_error(format!("bad PTY url: {e}")))?;
        let auth = HeaderValue::from_str(&self.auth_header())
            .map_err(|_| stream_error("api key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", auth);

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| stream_error(format!("PTY connect failed: {e}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = ws.close(None).await;
                return Err(ApiError::Timeout(timeout));
            }

            match tokio::time::timeout(remaining, ws.next()).await {
                Err(_) => {
                    let _ = ws.close(None).await;
                    return Err(ApiError::Timeout(timeout));
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
                Ok(Some(Ok(Message::Binary(bytes)))) => on_chunk(&bytes),
                Ok(Some(Ok(Message::Text(text)))) => on_chunk(text.as_bytes()),
                Ok(Some(Ok(_))) => {} // ping/pong, handled by the transport
                Ok(Some(Err(e))) => {
                    return Err(stream_error(format!("PTY stream error: {e}")));
                }
            }
        }

        Ok(())
    }
}

fn stream_error(message: String) -> ApiError {
    ApiError::Server { status: 502, message }
}
