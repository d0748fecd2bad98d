//! Streamable HTTP transport.
//!
//! Every outgoing envelope is one POST. Replies arrive either as a JSON body
//! or as an SSE stream and are queued for [`Transport::receive`]. The server's
//! `mcp-session-id` is captured from any response and echoed on later
//! requests; closing the transport sends a DELETE for that session.

use super::sse::decode_events;
use super::Transport;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use url::Url;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

type Inbox = mpsc::UnboundedSender<McpResult<JsonRpcMessage>>;

#[derive(Debug, Default)]
struct HttpState {
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
}

impl HttpState {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn capture_session(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(SESSION_HEADER).and_then(|h| h.to_str().ok()) {
            let mut slot = self.session_id.write().unwrap_or_else(|e| e.into_inner());
            if slot.as_deref() != Some(id) {
                debug!(session_id = %id, "Captured HTTP session id");
                *slot = Some(id.to_string());
            }
        }
    }
}

pub struct StreamableHttpTransport {
    client: Client,
    endpoint: Url,
    state: Arc<HttpState>,
    inbox: Mutex<mpsc::UnboundedReceiver<McpResult<JsonRpcMessage>>>,
    outbox: std::sync::Mutex<Option<Inbox>>,
    closed: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: Url, headers: &HashMap<String, String>) -> McpResult<Self> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| McpError::Transport(format!("invalid header name '{}'", name)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                McpError::Transport(format!("invalid value for header '{}'", name))
            })?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            endpoint,
            state: Arc::new(HttpState::default()),
            inbox: Mutex::new(rx),
            outbox: std::sync::Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.session_id()
    }

    fn outbox(&self) -> McpResult<Inbox> {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| McpError::Transport("transport is closed".into()))
    }

    fn post(&self, message: &JsonRpcMessage) -> RequestBuilder {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = self.state.session_id() {
            request = request.header(SESSION_HEADER, id);
        }
        if let Some(version) = self.state.protocol_version() {
            request = request.header(PROTOCOL_HEADER, version);
        }
        request
    }
}

/// Send one POST and queue every envelope in its reply.
async fn deliver(request: RequestBuilder, state: &HttpState, inbox: &Inbox) -> McpResult<()> {
    let had_session = state.session_id().is_some();
    let response = request
        .send()
        .await
        .map_err(|e| McpError::Transport(e.to_string()))?;
    state.capture_session(response.headers());

    let status = response.status();
    if status == StatusCode::ACCEPTED {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND && had_session {
        return Err(McpError::Transport("HTTP session expired".into()));
    }
    // the server answered, so only this exchange failed
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(McpError::Protocol(format!("HTTP {}: {}", status, body.trim())));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.starts_with("text/event-stream") {
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| McpError::Transport(e.to_string()))?;
            buffer.extend(chunk.iter().filter(|b| **b != b'\r'));
            while let Some(end) = buffer.windows(2).position(|w| w == b"\n\n") {
                let event: Vec<u8> = buffer.drain(..end + 2).collect();
                queue_events(&String::from_utf8_lossy(&event), inbox);
            }
        }
        queue_events(&String::from_utf8_lossy(&buffer), inbox);
        return Ok(());
    }

    let body = response
        .text()
        .await
        .map_err(|e| McpError::Transport(e.to_string()))?;
    if body.trim().is_empty() {
        return Ok(());
    }

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Array(batch)) => {
            for value in batch {
                let _ = inbox.send(JsonRpcMessage::from_value(value));
            }
        }
        Ok(value) => {
            let _ = inbox.send(JsonRpcMessage::from_value(value));
        }
        Err(e) => {
            let _ = inbox.send(Err(McpError::from(e)));
        }
    }
    Ok(())
}

fn queue_events(text: &str, inbox: &Inbox) {
    for data in decode_events(text) {
        let _ = inbox.send(JsonRpcMessage::parse(&data));
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Transport("transport is closed".into()));
        }
        let inbox = self.outbox()?;
        let request = self.post(&message);

        let JsonRpcMessage::Request(req) = message else {
            return deliver(request, &self.state, &inbox).await;
        };

        // requests complete on their own so a slow reply never blocks other sends
        let state = self.state.clone();
        tokio::spawn(async move {
            match deliver(request, &state, &inbox).await {
                Ok(()) => {}
                Err(e @ McpError::Transport(_)) => {
                    warn!(method = %req.method, request_id = %req.id, error = %e, "HTTP connection failed");
                    let _ = inbox.send(Err(e));
                }
                Err(e) => {
                    warn!(method = %req.method, request_id = %req.id, error = %e, "HTTP request rejected");
                    let failure = JsonRpcResponse::error(
                        Some(req.id),
                        JsonRpcError::internal_error(e.to_string()),
                    );
                    let _ = inbox.send(Ok(failure.into()));
                }
            }
        });
        Ok(())
    }

    async fn receive(&self) -> McpResult<Option<JsonRpcMessage>> {
        match self.inbox.lock().await.recv().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
        }
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(session_id) = self.state.session_id() else {
            return Ok(());
        };
        let response = self
            .client
            .delete(self.endpoint.clone())
            .header(SESSION_HEADER, session_id)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        // servers may refuse explicit termination
        if !response.status().is_success() && response.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Err(McpError::Transport(format!(
                "session termination failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn set_protocol_version(&self, version: &str) {
        *self
            .state
            .protocol_version
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(version.to_string());
    }
}
