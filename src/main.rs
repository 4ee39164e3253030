mod chain;
mod config;
mod llm;
mod members;
mod memory;
mod node;
mod platform;
mod prompt;
mod retriever;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::llm::OpenRouterClient;
use crate::node::{EnvCredentials, Node, NodeData, TelegramRetrievalNode};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ragbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.llm.model);
    info!("  Streaming: {}", config.llm.streaming);
    info!("  Memory: {:?}", config.memory.backend);
    info!("  Retriever: {:?}", config.retriever.backend);

    let chat_model = Arc::new(OpenRouterClient::new(config.llm.clone()));
    let memory = memory::build_memory(&config.memory)?;
    let retriever = retriever::build_retriever(&config.retriever).await?;

    let mut node = TelegramRetrievalNode::new(
        config.telegram.clone(),
        config.prompts.clone(),
        Box::new(EnvCredentials),
    );

    node.init(NodeData {
        bot_token: Some(config.telegram.bot_token.clone()),
        chat_model: Some(chat_model),
        memory: Some(memory),
        retriever: Some(retriever),
    })
    .await?;

    info!("Bot is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    node.stop().await?;
    Ok(())
}
