use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_agent::context::ContextSelector;
use switchyard_agent::model::client_for;
use switchyard_agent::sampling::ModelSampler;
use switchyard_agent::{ModelClient, ToolOrchestrator};
use switchyard_core::elicitation::FormPrompter;
use switchyard_mcp::callbacks::{FormElicitationHandler, StaticRoots, TracingLogHandler};
use switchyard_mcp::{CallbackRouter, SessionGroup};

mod config;
mod prompter;

use config::HostConfig;
use prompter::LinePrompter;

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "Chat with a model that can use tools from Model Context Protocol servers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "SWITCHYARD_LOG", default_value = "info")]
    log_level: String,

    /// Extra stdio server as `name=command args...` (repeatable)
    #[arg(long = "server", value_name = "NAME=COMMAND")]
    servers: Vec<String>,

    /// Skip resource and prompt selection before each exchange
    #[arg(long)]
    no_context: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the conversation
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = HostConfig::load(&args.config)?;
    for spec in &args.servers {
        config.add_server_spec(spec)?;
    }

    let model_config = config.model_config(|var| std::env::var(var).ok())?;
    let max_tokens = model_config.max_tokens;
    let model = client_for(model_config).context("Failed to create model client")?;
    tracing::info!(model = %model.model(), "Model client ready");

    let prompter = Arc::new(LinePrompter::stdio());
    let router = CallbackRouter::new()
        .with_roots(Arc::new(StaticRoots::new(config.roots.clone())))
        .with_logging(Arc::new(TracingLogHandler))
        .with_elicitation(Arc::new(FormElicitationHandler::new(prompter.clone())))
        .with_sampling(Arc::new(ModelSampler::new(model.clone())));
    let group = SessionGroup::new(router, config.session_config());

    for (name, params) in config.server_params()? {
        match group.connect_server(name.clone(), &params).await {
            Ok(handle) => tracing::info!(
                server = %name,
                version = %handle.protocol_version,
                collisions = handle.collisions.len(),
                "Connected"
            ),
            Err(e) => tracing::error!(server = %name, error = %e, "Failed to connect"),
        }
    }
    if group.is_empty() {
        tracing::warn!("No servers connected, the model will answer without tools");
    }

    let mut orchestrator =
        ToolOrchestrator::new(model.clone(), Arc::new(group.clone())).with_max_tokens(max_tokens);
    if !args.no_context {
        orchestrator = orchestrator.with_context(ContextSelector::new(model, group.clone()));
    }

    prompter
        .show("Type a message, 'tools' to list tools, 'refresh' to reload catalogs, 'goodbye' to quit.")
        .await;

    loop {
        let line = tokio::select! {
            line = prompter.ask("\nYou: ") => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let input = line.trim();

        match input.to_ascii_lowercase().as_str() {
            "" => continue,
            "goodbye" | "quit" | "exit" => break,
            "refresh" => match group.refresh().await {
                Ok(()) => prompter.show("Catalogs refreshed.").await,
                Err(e) => prompter.show(&format!("Refresh incomplete: {}", e)).await,
            },
            "tools" => {
                let tools = group.list_tools();
                if tools.is_empty() {
                    prompter.show("No tools available.").await;
                }
                for entry in tools {
                    let description = entry.item.description.as_deref().unwrap_or("");
                    prompter
                        .show(&format!("  {} [{}] {}", entry.item.name, entry.server, description))
                        .await;
                }
            }
            _ => match orchestrator.handle_user_input(input).await {
                Ok(answer) => prompter.show(&format!("\nAssistant: {}", answer)).await,
                Err(e) => {
                    tracing::error!(error = %e, "Exchange failed");
                    prompter.show(&format!("\nError: {}", e)).await;
                }
            },
        }
    }

    if let Err(e) = group.disconnect_all().await {
        tracing::warn!(error = %e, "Some servers did not disconnect cleanly");
    }
    prompter.show("Goodbye.").await;
    Ok(())
}
