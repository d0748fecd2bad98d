//! Child-process transport: protocol on stdin/stdout, diagnostics on stderr.

use super::{FramedTransport, Transport};
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use switchyard_core::ServerId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Grace period between closing stdin and killing the child
const EXIT_GRACE: Duration = Duration::from_millis(500);

pub struct StdioTransport {
    server: ServerId,
    framed: FramedTransport,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    pub fn spawn(
        server: &ServerId,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> McpResult<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Transport(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{}", line);
                }
            });
        }

        info!(server = %server, command = %command, pid = ?child.id(), "Spawned server process");

        Ok(Self {
            server: server.clone(),
            framed: FramedTransport::new(stdout, stdin),
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        self.framed.send(message).await
    }

    async fn receive(&self) -> McpResult<Option<JsonRpcMessage>> {
        self.framed.receive().await
    }

    async fn close(&self) -> McpResult<()> {
        // closing stdin asks the server to exit on its own
        let closed = self.framed.close().await;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server, %status, "Server process exited"),
                _ => {
                    warn!(server = %self.server, "Server process did not exit, killing it");
                    child.kill().await?;
                }
            }
        }

        closed
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;

    #[tokio::test]
    async fn test_spawn_missing_binary_is_transport_error() {
        let err = StdioTransport::spawn(
            &ServerId::new("ghost"),
            "/definitely/not/a/binary",
            &[],
            &HashMap::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_cat_echoes_envelopes() {
        let transport =
            StdioTransport::spawn(&ServerId::new("cat"), "cat", &[], &HashMap::new()).unwrap();
        transport
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap();

        let echoed = transport.receive().await.unwrap().unwrap();
        assert_eq!(echoed.method(), Some("ping"));
        transport.close().await.unwrap();
    }
}
