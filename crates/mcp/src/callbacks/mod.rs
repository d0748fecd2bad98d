//! Handlers for requests and notifications initiated by servers.
//!
//! A [`CallbackRouter`] holds at most one handler per callback kind. A kind
//! without a handler is not advertised during the handshake and requests for
//! it are answered with `Method not found`.

pub mod elicitation;
pub mod logging;
pub mod roots;

pub use elicitation::FormElicitationHandler;
pub use logging::TracingLogHandler;
pub use roots::StaticRoots;

use crate::error::McpResult;
use crate::protocol::JsonRpcError;
use crate::schema::{
    methods, CapabilityFlags, ClientCapabilities, CreateMessageParams, CreateMessageResult,
    ElicitParams, ElicitResult, ListRootsResult, LoggingMessageParams,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use switchyard_core::ServerId;

#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, params: CreateMessageParams) -> McpResult<CreateMessageResult>;
}

#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, server: &ServerId, params: ElicitParams) -> McpResult<ElicitResult>;
}

#[async_trait]
pub trait RootsHandler: Send + Sync {
    async fn list_roots(&self) -> McpResult<ListRootsResult>;
}

/// Receives server log notifications. Runs on the dispatch task, so it must
/// return quickly.
pub trait LoggingHandler: Send + Sync {
    fn on_log(&self, server: &ServerId, params: LoggingMessageParams);
}

#[derive(Clone, Default)]
pub struct CallbackRouter {
    sampling: Option<Arc<dyn SamplingHandler>>,
    elicitation: Option<Arc<dyn ElicitationHandler>>,
    roots: Option<Arc<dyn RootsHandler>>,
    logging: Option<Arc<dyn LoggingHandler>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sampling(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling = Some(handler);
        self
    }

    pub fn with_elicitation(mut self, handler: Arc<dyn ElicitationHandler>) -> Self {
        self.elicitation = Some(handler);
        self
    }

    pub fn with_roots(mut self, handler: Arc<dyn RootsHandler>) -> Self {
        self.roots = Some(handler);
        self
    }

    pub fn with_logging(mut self, handler: Arc<dyn LoggingHandler>) -> Self {
        self.logging = Some(handler);
        self
    }

    /// Capabilities advertised in `initialize`.
    pub fn capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            roots: self.roots.as_ref().map(|_| CapabilityFlags::list_changed()),
            sampling: self.sampling.as_ref().map(|_| serde_json::json!({})),
            elicitation: self.elicitation.as_ref().map(|_| serde_json::json!({})),
            experimental: None,
        }
    }

    /// Answer one server request. The error becomes the response's error member.
    pub async fn handle_request(
        &self,
        server: &ServerId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError> {
        match method {
            methods::PING => Ok(serde_json::json!({})),
            methods::SAMPLING_CREATE_MESSAGE => {
                let handler = self
                    .sampling
                    .as_ref()
                    .ok_or_else(|| JsonRpcError::method_not_found(method))?;
                let params: CreateMessageParams = parse_params(params)?;
                respond(handler.create_message(params).await)
            }
            methods::ELICITATION_CREATE => {
                let handler = self
                    .elicitation
                    .as_ref()
                    .ok_or_else(|| JsonRpcError::method_not_found(method))?;
                let params: ElicitParams = parse_params(params)?;
                respond(handler.elicit(server, params).await)
            }
            methods::ROOTS_LIST => {
                let handler = self
                    .roots
                    .as_ref()
                    .ok_or_else(|| JsonRpcError::method_not_found(method))?;
                respond(handler.list_roots().await)
            }
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }

    /// Deliver a `notifications/message` payload.
    pub fn handle_log(&self, server: &ServerId, params: Option<Value>) {
        let Some(handler) = &self.logging else {
            tracing::trace!(server = %server, "No logging handler, dropping server log");
            return;
        };
        match parse_params::<LoggingMessageParams>(params) {
            Ok(params) => handler.on_log(server, params),
            Err(e) => tracing::debug!(server = %server, error = %e.message, "Malformed log notification"),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn respond<T: Serialize>(outcome: McpResult<T>) -> Result<Value, JsonRpcError> {
    let result = outcome.map_err(|e| e.to_rpc_error())?;
    serde_json::to_value(result).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpError;
    use crate::protocol::error_codes;
    use crate::schema::Root;

    struct FailingRoots;

    #[async_trait]
    impl RootsHandler for FailingRoots {
        async fn list_roots(&self) -> McpResult<ListRootsResult> {
            Err(McpError::Handler("disk on fire".into()))
        }
    }

    struct OneRoot;

    #[async_trait]
    impl RootsHandler for OneRoot {
        async fn list_roots(&self) -> McpResult<ListRootsResult> {
            Ok(ListRootsResult {
                roots: vec![Root {
                    uri: "file:///tmp".into(),
                    name: None,
                }],
            })
        }
    }

    #[tokio::test]
    async fn test_missing_handler_is_method_not_found() {
        let router = CallbackRouter::new();
        let err = router
            .handle_request(&ServerId::new("s"), methods::SAMPLING_CREATE_MESSAGE, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);

        let caps = router.capabilities();
        assert!(caps.sampling.is_none() && caps.roots.is_none());
    }

    #[tokio::test]
    async fn test_handler_outcomes() {
        let server = ServerId::new("s");
        let ok = CallbackRouter::new().with_roots(Arc::new(OneRoot));
        let value = ok.handle_request(&server, methods::ROOTS_LIST, None).await.unwrap();
        assert_eq!(value["roots"][0]["uri"], "file:///tmp");
        assert!(ok.capabilities().roots.is_some());

        let failing = CallbackRouter::new().with_roots(Arc::new(FailingRoots));
        let err = failing
            .handle_request(&server, methods::ROOTS_LIST, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert!(err.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_ping_and_unknown() {
        let router = CallbackRouter::new();
        let server = ServerId::new("s");
        assert_eq!(
            router.handle_request(&server, "ping", None).await.unwrap(),
            serde_json::json!({})
        );
        let err = router
            .handle_request(&server, "tasks/list", None)
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }
}
