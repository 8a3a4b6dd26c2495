use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wealth_agent::{agent::Orchestrator, api::start_server, config::AgentConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;

    info!("🚀 Wealth Agent - API Server");
    info!("📍 Port: {}", config.api_port);
    if config.llm.is_none() {
        info!("LLM_API_KEY not set; LLM-backed tools are disabled");
    }

    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);

    info!("✅ Orchestrator initialized");

    let _sweep = orchestrator
        .memory()
        .clone()
        .spawn_cleanup(config.cleanup_interval);
    info!("🧹 Memory cleanup every {:?}", config.cleanup_interval);
    info!("📡 Starting API server...");

    start_server(orchestrator, config.api_port).await?;

    Ok(())
}
