// Calculator tool server over stdio

use anyhow::Result;
use switchyard_mcp::tools::calculator;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let server = calculator::server();
    tracing::info!("Calculator server starting with {} tools", server.tools().len());

    server.serve_stdio().await?;
    Ok(())
}
