//! streaming-attn-ctx: online KV cache manager for streaming long-context
//! attention.
//!
//! Extends an otherwise fixed-context model to effectively unbounded
//! input length by partitioning the prefix into an initial prefix, a
//! sliding local window, and a paged top-k global block pool. Exposes a
//! thin HTTP harness (`POST /v1/append`) for driving the manager
//! standalone, outside of a host model-framework integration.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use streaming_attn_ctx::config::{Cli, Config};
use streaming_attn_ctx::orchestrator::Orchestrator;
use streaming_attn_ctx::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "streaming_attn_ctx=debug,tower_http=debug"
    } else {
        "streaming_attn_ctx=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("streaming-attn-ctx v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        n_init = config.manager.n_init,
        n_local = config.manager.n_local,
        block_size = config.manager.block_size,
        topk = config.manager.topk,
        max_cached_block = config.manager.max_cached_block,
        cache_strategy = ?config.manager.cache_strategy,
        "Manager configuration loaded"
    );

    let orchestrator = Orchestrator::new(config.manager.clone());

    let state = Arc::new(AppState {
        orchestrator: RwLock::new(orchestrator),
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = build_router(state);

    let listen_addr = cli.listen;
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
