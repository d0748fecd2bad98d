//! Model API clients and the multi-round tool-use loop.

pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod sampling;

pub use config::{ModelConfig, Provider, RetryPolicy};
pub use error::{AgentError, AgentResult};
pub use model::{ModelClient, ModelRequest, ModelResponse, StopReason};
pub use orchestrator::{OrchestratorState, ToolCaller, ToolOrchestrator};
