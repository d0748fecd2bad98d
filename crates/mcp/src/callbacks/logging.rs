use super::LoggingHandler;
use crate::schema::{LoggingLevel, LoggingMessageParams};
use switchyard_core::ServerId;

/// Re-emits server log notifications as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogHandler;

impl LoggingHandler for TracingLogHandler {
    fn on_log(&self, server: &ServerId, params: LoggingMessageParams) {
        let logger = params.logger.as_deref().unwrap_or("-");
        let data = match &params.data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        match params.level {
            LoggingLevel::Debug => tracing::debug!(server = %server, logger, "{}", data),
            LoggingLevel::Info | LoggingLevel::Notice => {
                tracing::info!(server = %server, logger, "{}", data)
            }
            LoggingLevel::Warning => tracing::warn!(server = %server, logger, "{}", data),
            LoggingLevel::Error
            | LoggingLevel::Critical
            | LoggingLevel::Alert
            | LoggingLevel::Emergency => {
                tracing::error!(server = %server, logger, level = %params.level, "{}", data)
            }
        }
    }
}
