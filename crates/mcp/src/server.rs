// Minimal in-process MCP server: tools, static text resources, initialize and ping

use crate::error::{McpError, McpResult};
use crate::protocol::{error_codes, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::schema::{
    methods, CallToolParams, CapabilityFlags, Implementation, InitializeParams, InitializeResult,
    ListResourcesResult, ListToolsResult, PaginatedParams, ReadResourceParams, ReadResourceResult,
    ServerCapabilities, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::tools::{Tool, ToolRegistry};
use crate::transport::{FramedTransport, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use switchyard_core::content::{ResourceContents, TextResourceContents};
use switchyard_core::cursor::paginate;
use switchyard_core::ResourceDescriptor;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const DEFAULT_PAGE_SIZE: usize = 50;

struct TextResource {
    descriptor: ResourceDescriptor,
    text: String,
}

pub struct McpServer {
    info: Implementation,
    instructions: Option<String>,
    tools: ToolRegistry,
    resources: Vec<TextResource>,
    page_size: usize,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            instructions: None,
            tools: ToolRegistry::new(),
            resources: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_resource(mut self, descriptor: ResourceDescriptor, text: impl Into<String>) -> Self {
        self.resources.push(TextResource {
            descriptor,
            text: text.into(),
        });
        self
    }

    /// Items per `tools/list` and `resources/list` page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: (!self.tools.is_empty()).then(CapabilityFlags::default),
            resources: (!self.resources.is_empty()).then(CapabilityFlags::default),
            ..Default::default()
        }
    }

    /// Answer one request.
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        trace!(method = %method, request_id = %id, "Handling request");

        match self.dispatch(&method, params).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => {
                debug!(method = %method, code = err.code, message = %err.message, "Request failed");
                JsonRpcResponse::error(Some(id), err)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            methods::INITIALIZE => {
                let params: InitializeParams = parse(params)?;
                let protocol_version =
                    if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
                        params.protocol_version
                    } else {
                        LATEST_PROTOCOL_VERSION.to_string()
                    };
                info!(
                    client = %params.client_info.name,
                    protocol = %protocol_version,
                    "Client initialized"
                );
                to_value(InitializeResult {
                    protocol_version,
                    capabilities: self.capabilities(),
                    server_info: self.info.clone(),
                    instructions: self.instructions.clone(),
                })
            }
            methods::PING => Ok(serde_json::json!({})),
            methods::TOOLS_LIST => {
                let PaginatedParams { cursor } = parse_or_default(params)?;
                let page = paginate(&self.tools.descriptors(), cursor.as_deref(), self.page_size)
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                to_value(ListToolsResult {
                    tools: page.items,
                    next_cursor: page.next_cursor,
                })
            }
            methods::TOOLS_CALL => {
                let CallToolParams { name, arguments } = parse(params)?;
                let tool = self
                    .tools
                    .get(&name)
                    .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", name)))?;
                let arguments = arguments.unwrap_or_else(|| serde_json::json!({}));
                let result = tool
                    .execute(arguments)
                    .await
                    .map_err(|e| JsonRpcError::invalid_params(format!("{:#}", e)))?;
                to_value(result)
            }
            methods::RESOURCES_LIST => {
                let PaginatedParams { cursor } = parse_or_default(params)?;
                let descriptors: Vec<ResourceDescriptor> =
                    self.resources.iter().map(|r| r.descriptor.clone()).collect();
                let page = paginate(&descriptors, cursor.as_deref(), self.page_size)
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                to_value(ListResourcesResult {
                    resources: page.items,
                    next_cursor: page.next_cursor,
                })
            }
            methods::RESOURCES_READ => {
                let ReadResourceParams { uri } = parse(params)?;
                let resource = self
                    .resources
                    .iter()
                    .find(|r| r.descriptor.uri == uri)
                    .ok_or_else(|| {
                        JsonRpcError::custom(
                            error_codes::RESOURCE_NOT_FOUND,
                            format!("Resource not found: {}", uri),
                        )
                    })?;
                to_value(ReadResourceResult {
                    contents: vec![ResourceContents::Text(TextResourceContents {
                        uri,
                        mime_type: resource.descriptor.mime_type.clone(),
                        text: resource.text.clone(),
                    })],
                })
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    /// Serve requests from `transport` until the peer closes the stream.
    /// Requests are answered concurrently.
    pub async fn serve(self: Arc<Self>, transport: Arc<dyn Transport>) -> McpResult<()> {
        info!(server = %self.info.name, tools = self.tools.len(), "Serving");

        loop {
            match transport.receive().await {
                Ok(Some(JsonRpcMessage::Request(request))) => {
                    let server = self.clone();
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        let response = server.handle(request).await;
                        if let Err(e) = transport.send(response.into()).await {
                            warn!(error = %e, "Could not send response");
                        }
                    });
                }
                Ok(Some(JsonRpcMessage::Notification(notification))) => {
                    trace!(method = %notification.method, "Notification");
                }
                Ok(Some(JsonRpcMessage::Response(response))) => {
                    debug!(id = ?response.id, "Ignoring response, this server sends no requests");
                }
                Ok(None) => {
                    info!(server = %self.info.name, "Client closed the connection");
                    return Ok(());
                }
                Err(McpError::Protocol(reason)) => {
                    warn!(reason = %reason, "Malformed message");
                    let reply = JsonRpcResponse::error(None, JsonRpcError::parse_error());
                    transport.send(reply.into()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Serve over this process's stdin and stdout.
    pub async fn serve_stdio(self) -> McpResult<()> {
        let transport = FramedTransport::new(tokio::io::stdin(), tokio::io::stdout());
        Arc::new(self).serve(Arc::new(transport)).await
    }

    /// Run the server on a background task and return the client end of an
    /// in-memory connection to it.
    pub fn spawn_in_process(self) -> (Arc<dyn Transport>, JoinHandle<McpResult<()>>) {
        let (client, server) = FramedTransport::pair();
        let handle = tokio::spawn(Arc::new(self).serve(Arc::new(server)));
        (Arc::new(client), handle)
    }
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, JsonRpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => parse(Some(value)),
    }
}

fn to_value<T: Serialize>(result: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}
