//! One protocol conversation with one server.
//!
//! A session owns the transport, hands out request ids, correlates responses
//! with waiting callers and runs a single dispatch task that routes incoming
//! server requests and notifications. Request ids come from a counter that
//! only moves forward, and the id allocation and the pending-table insert
//! happen under the same lock.

use crate::callbacks::CallbackRouter;
use crate::error::{McpError, McpResult};
use crate::pagination::collect_pages;
use crate::protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::schema::{
    methods, CallToolParams, CallToolResult, CancelledParams, CompleteParams, CompleteResult,
    CompletionArgument, CompletionReference, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, LoggingLevel, PaginatedParams, ProgressParams,
    ReadResourceParams, ReadResourceResult, ServerCapabilities, SetLevelParams,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::Transport;
use futures::future::{AbortHandle, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use switchyard_core::{
    ConnectionState, PromptDescriptor, ResourceDescriptor, ResourceTemplateDescriptor, ServerId,
    ToolDescriptor,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Callback for a notification method. Runs on the dispatch task.
pub type NotificationHandler = Arc<dyn Fn(&ServerId, Option<Value>) + Send + Sync>;

/// Callback run once when the stream to the server fails.
pub type FailureHandler = Arc<dyn Fn(&ServerId) + Send + Sync>;

/// Callback for progress updates of one request.
pub type ProgressCallback = Arc<dyn Fn(ProgressParams) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_info: Implementation,
    /// Default deadline for requests sent by this client
    pub request_timeout: Duration,
    /// Version requested in `initialize`
    pub protocol_version: String,
    /// Versions accepted from the server
    pub supported_versions: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("switchyard", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(60),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    slot: oneshot::Sender<McpResult<Value>>,
}

#[derive(Default)]
struct PendingTable {
    next_id: i64,
    entries: HashMap<i64, PendingRequest>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct SessionInner {
    server: ServerId,
    transport: Arc<dyn Transport>,
    router: CallbackRouter,
    config: SessionConfig,
    state: Mutex<ConnectionState>,
    connected_once: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<PendingTable>,
    in_flight: Mutex<HashMap<RequestId, AbortHandle>>,
    progress: Mutex<HashMap<RequestId, ProgressCallback>>,
    notification_handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
    failure_handlers: RwLock<Vec<FailureHandler>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    init: Mutex<Option<InitializeResult>>,
}

impl SessionInner {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        let previous = *current;
        if previous != state {
            debug!(server = %self.server, from = %previous, to = %state, "Session state changed");
            *current = state;
        }
    }

    /// Drop every outstanding callback task and waiting caller. Callers
    /// see `cause` as a transport error when the stream failed.
    fn teardown(&self, final_state: ConnectionState, cause: Option<&str>) {
        self.set_state(final_state);

        for (_, handle) in lock(&self.in_flight).drain() {
            handle.abort();
        }
        lock(&self.progress).clear();

        let drained: Vec<(i64, PendingRequest)> = lock(&self.pending).entries.drain().collect();
        for (id, pending) in drained {
            trace!(server = %self.server, request_id = id, method = %pending.method, "Resolving pending request as disconnected");
            let err = match cause {
                Some(reason) => McpError::Transport(reason.to_string()),
                None => McpError::Disconnected,
            };
            let _ = pending.slot.send(Err(err));
        }
    }

    fn forget(&self, id: &RequestId) {
        if let RequestId::Number(n) = id {
            lock(&self.pending).entries.remove(n);
        }
        lock(&self.progress).remove(id);
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        trace!(server = %self.server, method, "Sending notification");
        self.transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        progress: Option<ProgressCallback>,
    ) -> McpResult<Value> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = lock(&self.pending);
            table.next_id += 1;
            let id = table.next_id;
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    deadline: Instant::now() + timeout,
                    slot: tx,
                },
            );
            id
        };
        let request_id = RequestId::Number(id);

        let params = match progress {
            None => params,
            Some(callback) => {
                lock(&self.progress).insert(request_id.clone(), callback);
                match attach_progress_token(params, &request_id) {
                    Ok(params) => params,
                    Err(e) => {
                        self.forget(&request_id);
                        return Err(e);
                    }
                }
            }
        };

        trace!(server = %self.server, method, request_id = id, "Sending request");
        if let Err(e) = self
            .transport
            .send(JsonRpcRequest::new(id, method, params).into())
            .await
        {
            self.forget(&request_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        lock(&self.progress).remove(&request_id);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::Disconnected),
            Err(_) => {
                lock(&self.pending).entries.remove(&id);
                warn!(server = %self.server, method, request_id = id, ?timeout, "Request timed out");

                let cancel = CancelledParams {
                    request_id,
                    reason: Some(format!("Request timed out after {:?}", timeout)),
                };
                if let Ok(params) = serde_json::to_value(cancel) {
                    if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
                        debug!(server = %self.server, error = %e, "Could not send cancellation");
                    }
                }

                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Request(request) => self.handle_request(request),
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let Some(RequestId::Number(id)) = response.id.clone() else {
            let detail = response.error.map(|e| e.message).unwrap_or_default();
            warn!(server = %self.server, id = ?response.id, detail = %detail, "Response without a usable id dropped");
            return;
        };

        let Some(pending) = lock(&self.pending).entries.remove(&id) else {
            warn!(server = %self.server, request_id = id, "Unmatched response dropped");
            return;
        };

        if Instant::now() > pending.deadline {
            debug!(server = %self.server, request_id = id, method = %pending.method, "Response arrived past its deadline");
        }
        let _ = pending.slot.send(response.into_result().map_err(McpError::from));
    }

    fn handle_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        debug!(server = %self.server, method = %method, request_id = %id, "Server request");

        let inner = self.clone();
        let task_id = id.clone();
        let work = async move {
            let outcome = AssertUnwindSafe(inner.router.handle_request(&inner.server, &method, params))
                .catch_unwind()
                .await;

            let response = match outcome {
                Ok(Ok(result)) => JsonRpcResponse::success(task_id.clone(), result),
                Ok(Err(err)) => {
                    debug!(server = %inner.server, method = %method, code = err.code, "Callback returned error");
                    JsonRpcResponse::error(Some(task_id.clone()), err)
                }
                Err(_) => {
                    error!(server = %inner.server, method = %method, "Callback handler panicked");
                    JsonRpcResponse::error(
                        Some(task_id.clone()),
                        JsonRpcError::internal_error("callback handler panicked"),
                    )
                }
            };

            lock(&inner.in_flight).remove(&task_id);
            if let Err(e) = inner.transport.send(response.into()).await {
                warn!(server = %inner.server, method = %method, error = %e, "Could not send callback response");
            }
        };

        let (work, abort) = futures::future::abortable(work);
        lock(&self.in_flight).insert(id, abort);
        tokio::spawn(work);
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        let JsonRpcNotification { method, params, .. } = notification;
        let mut handled = true;

        match method.as_str() {
            methods::CANCELLED => {
                match params.clone().map(serde_json::from_value::<CancelledParams>) {
                    Some(Ok(cancel)) => {
                        if let Some(handle) = lock(&self.in_flight).remove(&cancel.request_id) {
                            handle.abort();
                            debug!(server = %self.server, request_id = %cancel.request_id, reason = ?cancel.reason, "Server cancelled callback");
                        }
                    }
                    _ => debug!(server = %self.server, "Malformed cancellation"),
                }
            }
            methods::PROGRESS => {
                match params.clone().map(serde_json::from_value::<ProgressParams>) {
                    Some(Ok(progress)) => {
                        let callback = lock(&self.progress).get(&progress.progress_token).cloned();
                        match callback {
                            Some(callback) => callback(progress),
                            None => trace!(server = %self.server, token = %progress.progress_token, "Progress for unknown token"),
                        }
                    }
                    _ => debug!(server = %self.server, "Malformed progress notification"),
                }
            }
            methods::MESSAGE => self.router.handle_log(&self.server, params.clone()),
            _ => handled = false,
        }

        let handlers = self
            .notification_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&method)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() && !handled {
            trace!(server = %self.server, method = %method, "Discarding unknown notification");
            return;
        }

        for handler in handlers {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(&self.server, params.clone())));
            if outcome.is_err() {
                error!(server = %self.server, method = %method, "Notification handler panicked");
            }
        }
    }

    fn stream_ended(&self, cause: Option<String>) {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Disconnected
        ) {
            return;
        }
        self.teardown(ConnectionState::Failed, cause.as_deref());

        let handlers = self
            .failure_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&self.server))).is_err() {
                error!(server = %self.server, "Failure handler panicked");
            }
        }
    }
}

fn attach_progress_token(params: Option<Value>, token: &RequestId) -> McpResult<Option<Value>> {
    let mut params = params.unwrap_or_else(|| Value::Object(Default::default()));
    let object = params
        .as_object_mut()
        .ok_or_else(|| McpError::Protocol("progress requires object params".into()))?;
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Default::default()));
    let meta = meta
        .as_object_mut()
        .ok_or_else(|| McpError::Protocol("_meta must be an object".into()))?;
    meta.insert("progressToken".to_string(), serde_json::to_value(token)?);
    Ok(Some(params))
}

async fn run_dispatch(inner: Arc<SessionInner>) {
    let cause = loop {
        match inner.transport.receive().await {
            Ok(Some(message)) => inner.dispatch(message),
            Ok(None) => {
                info!(server = %inner.server, "Server closed the connection");
                break None;
            }
            Err(McpError::Protocol(reason)) => {
                warn!(server = %inner.server, reason = %reason, "Dropping malformed message")
            }
            Err(McpError::Transport(reason)) => {
                error!(server = %inner.server, reason = %reason, "Transport failed");
                break Some(reason);
            }
            Err(e) => {
                error!(server = %inner.server, error = %e, "Transport failed");
                break Some(e.to_string());
            }
        }
    };
    inner.stream_ended(cause);
}

pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        server: ServerId,
        transport: Arc<dyn Transport>,
        router: CallbackRouter,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                server,
                transport,
                router,
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                connected_once: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pending: Mutex::new(PendingTable::default()),
                in_flight: Mutex::new(HashMap::new()),
                progress: Mutex::new(HashMap::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                failure_handlers: RwLock::new(Vec::new()),
                dispatch: Mutex::new(None),
                init: Mutex::new(None),
            }),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.inner.server
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn initialize_result(&self) -> Option<InitializeResult> {
        lock(&self.inner.init).clone()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        lock(&self.inner.init)
            .as_ref()
            .map(|init| init.capabilities.clone())
            .unwrap_or_default()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).entries.len()
    }

    /// Register a handler for a notification method. Handlers for the same
    /// method run in registration order.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.inner
            .notification_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method.into())
            .or_default()
            .push(handler);
    }

    /// Register a handler run after the stream to the server fails. It is
    /// not run for an explicit disconnect.
    pub fn on_failure(&self, handler: FailureHandler) {
        self.inner
            .failure_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Run the initialize handshake. A session connects at most once.
    pub async fn connect(&self) -> McpResult<InitializeResult> {
        let inner = &self.inner;
        if inner.connected_once.swap(true, Ordering::SeqCst) {
            return Err(McpError::AlreadyConnected(inner.server.to_string()));
        }
        if inner.closed.load(Ordering::SeqCst) {
            return Err(McpError::Disconnected);
        }

        inner.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(run_dispatch(inner.clone()));
        *lock(&inner.dispatch) = Some(handle);

        match self.handshake().await {
            Ok(init) => {
                info!(
                    server = %inner.server,
                    name = %init.server_info.name,
                    version = %init.server_info.version,
                    protocol = %init.protocol_version,
                    "Session ready"
                );
                *lock(&inner.init) = Some(init.clone());
                inner.set_state(ConnectionState::Ready);
                Ok(init)
            }
            Err(e) => {
                warn!(server = %inner.server, error = %e, "Handshake failed");
                let _ = self.shutdown(ConnectionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> McpResult<InitializeResult> {
        let inner = &self.inner;
        let params = InitializeParams {
            protocol_version: inner.config.protocol_version.clone(),
            capabilities: inner.router.capabilities(),
            client_info: inner.config.client_info.clone(),
        };

        let value = inner
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                inner.config.request_timeout,
                None,
            )
            .await?;

        let init: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("malformed initialize result: {}", e)))?;

        if !inner
            .config
            .supported_versions
            .iter()
            .any(|v| v == &init.protocol_version)
        {
            return Err(McpError::Protocol(format!(
                "unsupported protocol version '{}'",
                init.protocol_version
            )));
        }

        inner.transport.set_protocol_version(&init.protocol_version);
        inner.notify(methods::INITIALIZED, None).await?;
        Ok(init)
    }

    /// Close the session. Safe to call repeatedly and before `connect`.
    pub async fn disconnect(&self) -> McpResult<()> {
        self.shutdown(ConnectionState::Disconnected).await
    }

    async fn shutdown(&self, final_state: ConnectionState) -> McpResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            inner.set_state(final_state);
            return Ok(());
        }

        inner.set_state(ConnectionState::Closing);
        let closed = inner.transport.close().await;
        if let Some(handle) = lock(&inner.dispatch).take() {
            handle.abort();
        }
        inner.teardown(final_state, None);

        if let Err(e) = &closed {
            warn!(server = %inner.server, error = %e, "Transport close failed");
        }
        closed
    }

    fn ensure_ready(&self) -> McpResult<()> {
        if self.state().is_ready() {
            Ok(())
        } else {
            Err(McpError::Disconnected)
        }
    }

    /// Send a request and wait for its result. `timeout` defaults to the
    /// session's request timeout.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        self.ensure_ready()?;
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner.request(method, params, timeout, None).await
    }

    /// Like [`Session::send_request`], routing progress notifications for
    /// this request to `on_progress` until it resolves.
    pub async fn send_request_with_progress(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        on_progress: ProgressCallback,
    ) -> McpResult<Value> {
        self.ensure_ready()?;
        let timeout = timeout.unwrap_or(self.inner.config.request_timeout);
        self.inner
            .request(method, params, timeout, Some(on_progress))
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.ensure_ready()?;
        self.inner.notify(method, params).await
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> McpResult<R> {
        let value = self
            .send_request(method, Some(serde_json::to_value(params)?), None)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("malformed {} result: {}", method, e)))
    }

    pub async fn ping(&self) -> McpResult<()> {
        self.send_request(methods::PING, None, None).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> McpResult<ListToolsResult> {
        self.call(methods::TOOLS_LIST, &PaginatedParams { cursor }).await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> McpResult<ListResourcesResult> {
        self.call(methods::RESOURCES_LIST, &PaginatedParams { cursor })
            .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> McpResult<ListResourceTemplatesResult> {
        self.call(methods::RESOURCE_TEMPLATES_LIST, &PaginatedParams { cursor })
            .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> McpResult<ListPromptsResult> {
        self.call(methods::PROMPTS_LIST, &PaginatedParams { cursor })
            .await
    }

    pub async fn list_all_tools(&self) -> McpResult<Vec<ToolDescriptor>> {
        collect_pages("tools", |cursor| async move {
            self.list_tools(cursor).await.map(Into::into)
        })
        .await
    }

    pub async fn list_all_resources(&self) -> McpResult<Vec<ResourceDescriptor>> {
        collect_pages("resources", |cursor| async move {
            self.list_resources(cursor).await.map(Into::into)
        })
        .await
    }

    pub async fn list_all_resource_templates(&self) -> McpResult<Vec<ResourceTemplateDescriptor>> {
        collect_pages("resource templates", |cursor| async move {
            self.list_resource_templates(cursor).await.map(Into::into)
        })
        .await
    }

    pub async fn list_all_prompts(&self) -> McpResult<Vec<PromptDescriptor>> {
        collect_pages("prompts", |cursor| async move {
            self.list_prompts(cursor).await.map(Into::into)
        })
        .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<CallToolResult> {
        self.call(
            methods::TOOLS_CALL,
            &CallToolParams {
                name: name.to_string(),
                arguments,
            },
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.call(
            methods::RESOURCES_READ,
            &ReadResourceParams {
                uri: uri.to_string(),
            },
        )
        .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: BTreeMap<String, String>,
    ) -> McpResult<GetPromptResult> {
        self.call(
            methods::PROMPTS_GET,
            &GetPromptParams {
                name: name.to_string(),
                arguments,
            },
        )
        .await
    }

    /// Ask the server for argument completions.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: CompletionArgument,
    ) -> McpResult<CompleteResult> {
        self.call(
            methods::COMPLETION_COMPLETE,
            &CompleteParams {
                reference,
                argument,
            },
        )
        .await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> McpResult<()> {
        self.send_request(
            methods::LOGGING_SET_LEVEL,
            Some(serde_json::to_value(SetLevelParams { level })?),
            None,
        )
        .await
        .map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner.dispatch).take() {
            handle.abort();
        }
        for (_, handle) in lock(&self.inner.in_flight).drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::callbacks::{ElicitationHandler, RootsHandler, StaticRoots};
    use crate::protocol::error_codes;
    use crate::schema::{ElicitParams, ElicitResult};
    use crate::transport::FramedTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// Raw-line server side of an in-memory connection
    pub(crate) struct Peer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        pub(crate) async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().expect("peer stream ended");
            serde_json::from_str(&line).unwrap()
        }

        pub(crate) async fn send(&mut self, value: Value) {
            self.raw(&format!("{}\n", value)).await;
        }

        pub(crate) async fn raw(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }

        /// Answer `initialize` and swallow `notifications/initialized`.
        pub(crate) async fn handshake(&mut self, capabilities: Value) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            self.send(json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": {"name": "scripted", "version": "0.0.1"}
                }
            }))
            .await;
            let initialized = self.recv().await;
            assert_eq!(initialized["method"], "notifications/initialized");
        }

        pub(crate) async fn reply(&mut self, id: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
        }
    }

    pub(crate) fn transport_pair() -> (Arc<dyn Transport>, Peer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let (peer_read, peer_write) = tokio::io::split(theirs);
        (
            Arc::new(FramedTransport::new(read, write)),
            Peer {
                lines: BufReader::new(peer_read).lines(),
                writer: peer_write,
            },
        )
    }

    fn session_with(router: CallbackRouter, config: SessionConfig) -> (Arc<Session>, Peer) {
        let (transport, peer) = transport_pair();
        (
            Arc::new(Session::new(ServerId::new("scripted"), transport, router, config)),
            peer,
        )
    }

    async fn connected(router: CallbackRouter) -> (Arc<Session>, Peer) {
        let (session, mut peer) = session_with(router, SessionConfig::default());
        let (init, _) = tokio::join!(session.connect(), peer.handshake(json!({"tools": {}})));
        init.unwrap();
        (session, peer)
    }

    #[tokio::test]
    async fn test_handshake_marks_ready() {
        let (session, mut peer) = session_with(
            CallbackRouter::new().with_roots(Arc::new(StaticRoots::default())),
            SessionConfig::default(),
        );
        let connect = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });

        let init = peer.recv().await;
        assert_eq!(init["params"]["clientInfo"]["name"], "switchyard");
        assert_eq!(init["params"]["capabilities"]["roots"]["listChanged"], true);
        assert!(init["params"]["capabilities"].get("sampling").is_none());
        peer.reply(
            &init["id"],
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "calc", "version": "1.0"}
            }),
        )
        .await;
        assert_eq!(peer.recv().await["method"], "notifications/initialized");

        let result = connect.await.unwrap().unwrap();
        assert_eq!(result.server_info.name, "calc");
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(session.capabilities().tools.is_some());
    }

    #[tokio::test]
    async fn test_unsupported_version_fails_session() {
        let (session, mut peer) = session_with(CallbackRouter::new(), SessionConfig::default());
        let connect = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });

        let init = peer.recv().await;
        peer.reply(
            &init["id"],
            json!({
                "protocolVersion": "1999-01-01",
                "capabilities": {},
                "serverInfo": {"name": "old", "version": "0"}
            }),
        )
        .await;

        let err = connect.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)));
        assert_eq!(session.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let (session, _peer) = connected(CallbackRouter::new()).await;
        assert!(matches!(session.connect().await, Err(McpError::AlreadyConnected(_))));

        session.disconnect().await.unwrap();
        assert!(matches!(session.connect().await, Err(McpError::AlreadyConnected(_))));
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_safe() {
        let (session, _peer) = session_with(CallbackRouter::new(), SessionConfig::default());
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_responses_route_by_id() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;

        let calls: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let session = session.clone();
                tokio::spawn(async move {
                    session
                        .send_request("echo", Some(json!({"name": name})), None)
                        .await
                })
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(peer.recv().await);
        }
        let ids: std::collections::HashSet<_> =
            requests.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids.len(), 3);

        // answer in reverse order
        for request in requests.iter().rev() {
            peer.reply(&request["id"], json!({"echo": request["params"]["name"]}))
                .await;
        }

        for (call, name) in calls.into_iter().zip(["a", "b", "c"]) {
            let result = call.await.unwrap().unwrap();
            assert_eq!(result["echo"], name);
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send_request("tools/call", None, None).await }
        });

        let request = peer.recv().await;
        peer.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32001, "message": "quota", "data": {"retry": false}}
        }))
        .await;

        match call.await.unwrap().unwrap_err() {
            McpError::Remote {
                code,
                message,
                data,
            } => {
                assert_eq!(code, -32001);
                assert_eq!(message, "quota");
                assert_eq!(data, Some(json!({"retry": false})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_resolves_pending() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send_request("slow", None, None).await }
        });
        peer.recv().await;

        session.disconnect().await.unwrap();
        assert!(matches!(call.await.unwrap(), Err(McpError::Disconnected)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_sends_cancellation() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;

        let err = session
            .send_request("slow", None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(session.pending_count(), 0);

        let request = peer.recv().await;
        let cancel = peer.recv().await;
        assert_eq!(cancel["method"], "notifications/cancelled");
        assert_eq!(cancel["params"]["requestId"], request["id"]);

        // a late reply is dropped and the session keeps working
        peer.reply(&request["id"], json!({})).await;
        let ping = tokio::spawn({
            let session = session.clone();
            async move { session.ping().await }
        });
        let ping_request = peer.recv().await;
        peer.reply(&ping_request["id"], json!({})).await;
        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_skipped() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send_request("x", None, None).await }
        });
        let request = peer.recv().await;

        peer.raw("{not json}\n").await;
        peer.reply(&request["id"], json!({"ok": 1})).await;

        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": 1}));
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_stream_end_fails_session() {
        let (session, peer) = connected(CallbackRouter::new()).await;
        drop(peer);

        for _ in 0..50 {
            if session.state() == ConnectionState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(matches!(session.ping().await, Err(McpError::Disconnected)));
    }

    /// Transport fed by the test through a channel
    struct ScriptedTransport {
        inbox: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<McpResult<JsonRpcMessage>>>,
        sent: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
            self.sent
                .send(message)
                .map_err(|_| McpError::Transport("closed".into()))
        }

        async fn receive(&self) -> McpResult<Option<JsonRpcMessage>> {
            match self.inbox.lock().await.recv().await {
                Some(next) => next.map(Some),
                None => Ok(None),
            }
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transport_failure_reaches_pending_caller() {
        let (feed, inbox) = tokio::sync::mpsc::unbounded_channel();
        let (sent, mut outgoing) = tokio::sync::mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            inbox: tokio::sync::Mutex::new(inbox),
            sent,
        });
        let session = Arc::new(Session::new(
            ServerId::new("remote"),
            transport,
            CallbackRouter::new(),
            SessionConfig::default(),
        ));
        let failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        session.on_failure({
            let failures = failures.clone();
            Arc::new(move |server: &ServerId| {
                assert_eq!(server.as_str(), "remote");
                failures.fetch_add(1, Ordering::SeqCst);
            })
        });

        let connect = tokio::spawn({
            let session = session.clone();
            async move { session.connect().await }
        });
        let Some(JsonRpcMessage::Request(init)) = outgoing.recv().await else {
            panic!("expected initialize");
        };
        let result = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "serverInfo": {"name": "remote", "version": "1"}
        });
        feed.send(Ok(JsonRpcResponse::success(init.id, result).into()))
            .unwrap();
        connect.await.unwrap().unwrap();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send_request("tools/list", None, None).await }
        });
        loop {
            match outgoing.recv().await {
                Some(JsonRpcMessage::Request(_)) => break,
                Some(_) => continue,
                None => panic!("session stopped sending"),
            }
        }
        feed.send(Err(McpError::Transport("connection reset".into())))
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Transport(reason) if reason == "connection reset"));
        assert_eq!(session.state(), ConnectionState::Failed);
        for _ in 0..50 {
            if failures.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        session.disconnect().await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_requests_are_answered() {
        let (_session, mut peer) = connected(
            CallbackRouter::new().with_roots(Arc::new(StaticRoots::new(vec!["file:///work".into()]))),
        )
        .await;

        peer.send(json!({"jsonrpc": "2.0", "id": "r1", "method": "roots/list"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], "r1");
        assert_eq!(reply["result"]["roots"][0]["uri"], "file:///work");

        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "sampling/createMessage", "params": {}}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);

        peer.send(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).await;
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"], json!({}));
    }

    struct PanickingRoots;

    #[async_trait]
    impl RootsHandler for PanickingRoots {
        async fn list_roots(&self) -> McpResult<crate::schema::ListRootsResult> {
            panic!("roots exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error_response() {
        let (session, mut peer) =
            connected(CallbackRouter::new().with_roots(Arc::new(PanickingRoots))).await;

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "roots/list"}))
            .await;
        let reply = peer.recv().await;
        assert_eq!(reply["error"]["code"], error_codes::INTERNAL_ERROR);
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    struct NeverAnswers;

    #[async_trait]
    impl ElicitationHandler for NeverAnswers {
        async fn elicit(&self, _server: &ServerId, _params: ElicitParams) -> McpResult<ElicitResult> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_server_cancellation_aborts_callback() {
        let (_session, mut peer) =
            connected(CallbackRouter::new().with_elicitation(Arc::new(NeverAnswers))).await;

        peer.send(json!({
            "jsonrpc": "2.0", "id": 10, "method": "elicitation/create",
            "params": {"message": "name?", "requestedSchema": {"type": "object"}}
        }))
        .await;
        peer.send(json!({
            "jsonrpc": "2.0", "method": "notifications/cancelled",
            "params": {"requestId": 10, "reason": "user left"}
        }))
        .await;
        peer.send(json!({"jsonrpc": "2.0", "id": 11, "method": "ping"})).await;

        // the only reply is for the ping
        let reply = peer.recv().await;
        assert_eq!(reply["id"], 11);
    }

    #[tokio::test]
    async fn test_progress_routed_to_caller() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let call = tokio::spawn({
            let session = session.clone();
            let seen = seen.clone();
            async move {
                session
                    .send_request_with_progress(
                        "tools/call",
                        Some(json!({"name": "long"})),
                        None,
                        Arc::new(move |p: ProgressParams| lock(&seen).push(p.progress)),
                    )
                    .await
            }
        });

        let request = peer.recv().await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        assert_eq!(token, request["id"]);

        for step in [1.0, 2.0] {
            peer.send(json!({
                "jsonrpc": "2.0", "method": "notifications/progress",
                "params": {"progressToken": token, "progress": step, "total": 2.0}
            }))
            .await;
        }
        peer.reply(&request["id"], json!({"content": []})).await;

        call.await.unwrap().unwrap();
        assert_eq!(*lock(&seen), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_custom_notification_handler() {
        let (session, mut peer) = connected(CallbackRouter::new()).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.on_notification(
            "notifications/custom/weather",
            Arc::new(move |server: &ServerId, params: Option<Value>| {
                let _ = tx.send((server.clone(), params));
            }),
        );

        peer.send(json!({"jsonrpc": "2.0", "method": "notifications/unknown"})).await;
        peer.send(json!({
            "jsonrpc": "2.0", "method": "notifications/custom/weather",
            "params": {"temp": 21}
        }))
        .await;

        let (server, params) = rx.recv().await.unwrap();
        assert_eq!(server.as_str(), "scripted");
        assert_eq!(params, Some(json!({"temp": 21})));
    }
}
