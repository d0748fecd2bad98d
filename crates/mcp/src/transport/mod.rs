//! Transport layer: one duplex message stream per server.
//!
//! A transport moves whole JSON-RPC envelopes and knows nothing about ids,
//! methods or sessions.

pub mod framed;
pub mod http;
pub mod sse;
pub mod stdio;

pub use framed::FramedTransport;
pub use http::StreamableHttpTransport;
pub use stdio::StdioTransport;

use crate::error::McpResult;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one envelope.
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    /// Next envelope, or `Ok(None)` at end of stream.
    ///
    /// `Err(McpError::Protocol)` reports one unreadable envelope and the
    /// stream stays usable. Any other error is terminal.
    async fn receive(&self) -> McpResult<Option<JsonRpcMessage>>;

    /// Release the stream. Later sends fail.
    async fn close(&self) -> McpResult<()>;

    /// Called once the handshake has settled on a protocol version.
    fn set_protocol_version(&self, _version: &str) {}
}
