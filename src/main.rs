//! Coding-agent platform core — server-side session lifecycle, agent turn
//! execution, tool execution/permissioning, and execution-environment
//! abstraction for an LLM coding agent (spec.md §1).
//!
//! This binary wires the core components (Agent Service, Session Manager,
//! Tool Execution Manager, Persistence Gateway) to a thin HTTP transport.
//! The transport, LLM vendor wiring, and persistence file layout are
//! external collaborators; the core itself is transport-agnostic.

mod abort_registry;
mod adapter;
mod agent_fsm;
mod agent_runner;
mod agent_service;
mod api;
mod config;
mod core_tools;
mod db;
mod error;
mod event_bus;
mod llm;
mod preview;
mod session;
mod tool_execution;
mod tool_registry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_service::AgentService;
use api::{create_router, AppState};
use config::Config;
use db::{PersistenceGateway, SqlitePersistence};
use llm::{LlmConfig, LlmService, ModelRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentcore=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "opening session store");
    let persistence: Arc<dyn PersistenceGateway> = Arc::new(SqlitePersistence::open(&config.db_path)?);

    let llm_config = LlmConfig::from_env();
    let llm_registry = ModelRegistry::new(&llm_config);
    if !llm_registry.has_models() {
        tracing::warn!("no LLM API keys configured; set ANTHROPIC_API_KEY or LLM_GATEWAY");
    }
    let llm: Arc<dyn LlmService> = llm_registry
        .default()
        .unwrap_or_else(|| Arc::new(llm::UnavailableLlmService));

    let service = AgentService::new(config.clone(), llm, persistence);

    let state = AppState { service };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);
    let app = create_router(state).layer(cors).layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "agentcore server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
