//! Newline-delimited JSON over any async byte stream.

use super::Transport;
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Upper bound for a single line on the wire
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct FramedTransport {
    reader: Mutex<FramedRead<BoxedReader, LinesCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, LinesCodec>>,
    closed: AtomicBool,
}

impl FramedTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            reader: Mutex::new(FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            writer: Mutex::new(FramedWrite::new(writer, LinesCodec::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Two connected in-memory transports.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Self::new(a_read, a_write), Self::new(b_read, b_write))
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Transport("transport is closed".into()));
        }
        let line = message.to_json()?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(io) => McpError::from(io),
            other => McpError::Transport(other.to_string()),
        })
    }

    async fn receive(&self) -> McpResult<Option<JsonRpcMessage>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                None => return Ok(None),
                Some(Err(LinesCodecError::Io(e))) => return Err(McpError::from(e)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(McpError::Protocol("line exceeds maximum length".into()))
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return JsonRpcMessage::parse(&line).map(Some);
                }
            }
        }
    }

    async fn close(&self) -> McpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        SinkExt::<String>::close(&mut *writer)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcNotification, JsonRpcRequest};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let (client, server) = FramedTransport::pair();
        client
            .send(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap();

        let received = server.receive().await.unwrap().unwrap();
        assert_eq!(received.method(), Some("ping"));
    }

    #[tokio::test]
    async fn test_malformed_line_is_not_terminal() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(ours);
        let transport = FramedTransport::new(read, write);

        let (_, mut peer_write) = tokio::io::split(theirs);
        peer_write
            .write_all(b"garbage\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();

        assert!(matches!(transport.receive().await, Err(McpError::Protocol(_))));
        let next = transport.receive().await.unwrap().unwrap();
        assert_eq!(next.method(), Some("notifications/initialized"));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (client, server) = FramedTransport::pair();
        client.close().await.unwrap();
        client.close().await.unwrap();

        assert!(server.receive().await.unwrap().is_none());
        let err = client
            .send(JsonRpcNotification::new("x", None).into())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }
}
