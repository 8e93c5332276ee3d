#![deny(unsafe_code)]
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sol_daemon::{build_app, AppState};
use sol_runtime::{FakeProvider, OpenAiProvider, Provider, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sol-daemon", version, about = "Sol orchestrator control plane")]
struct Args {
    /// Bind address; falls back to SOL_BIND_ADDR, then 127.0.0.1:4600.
    #[arg(long)]
    bind: Option<String>,

    /// Path recorded against the topology guard record.
    #[arg(long, default_value = "sol.db")]
    db_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = std::env::var("SOL_LOG").or_else(|_| std::env::var("RUST_LOG")).unwrap_or_else(|_| "sol=info".to_string());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter)).init();

    let (config, warnings) = sol_config::RuntimeConfig::from_env().context("load runtime configuration")?;
    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_addr.clone());
    let internal_token = config.internal_token.clone();

    let provider: Arc<dyn Provider> = match config.llm_provider {
        sol_config::LlmProvider::Openai => Arc::new(OpenAiProvider::new(config.openai_api_key.clone(), config.openai_model.clone())),
        sol_config::LlmProvider::Fake => Arc::new(FakeProvider::new()),
    };
    let store = Arc::new(sol_runtime::InMemoryStore::new());
    let runtime = Arc::new(Runtime::new(store, provider, config));

    let state = Arc::new(AppState { runtime, internal_token, db_path: args.db_path });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await.with_context(|| format!("bind {bind_addr}"))?;
    info!(bind = %bind_addr, "sol-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
