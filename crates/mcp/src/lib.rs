// Model Context Protocol client: sessions, transports and server groups,
// plus a minimal in-process server for hosting tools

pub mod callbacks;
pub mod error;
pub mod group;
pub mod pagination;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub use callbacks::CallbackRouter;
pub use error::{McpError, McpResult};
pub use group::{ServerHandle, ServerParams, SessionGroup};
pub use server::McpServer;
pub use session::{Session, SessionConfig};
