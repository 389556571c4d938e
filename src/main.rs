use anyhow::{Context, Result};
use asr_gateway::{create_router, AppState, BackendKind, Config};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "asr-gateway", about = "Real-time speech transcription gateway")]
struct Args {
    /// Configuration file, without extension
    #[arg(short, long, default_value = "config/asr-gateway")]
    config: String,

    /// Override the configured dispatch backend
    #[arg(short, long, value_enum)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(&args.config)?;
    if let Some(backend) = args.backend {
        cfg.dispatch.backend = backend;
        cfg.validate()?;
    }

    let level = cfg.server.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("ASR Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Backend: {:?}, recordings under {}",
        cfg.dispatch.backend,
        cfg.storage.root.display()
    );

    let addr = format!("{}:{}", cfg.server.bind, cfg.server.port);
    let state = AppState::build(cfg).await?;

    let shutdown = CancellationToken::new();
    let background = state.spawn_background(&shutdown);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!("Background task panicked: {}", e);
        }
    }
    state.dispatcher.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
