//! Lightbox Serve - feed skeleton XRPC server.
//!
//! Serves the feeds named in `FEEDGEN_FEEDS` from the index written by
//! `lightbox-ingest`. Configuration comes from `FEEDGEN_*` environment
//! variables, optionally loaded from a `.env` file.

use anyhow::Context;
use axum::Router;
use axum::http::Request;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lightbox_core::metrics::{init_metrics, start_metrics_server};
use lightbox_serve::{AppState, Config, router};

/// Lightbox feed skeleton server.
#[derive(Parser, Debug)]
#[command(name = "lightbox-serve")]
#[command(about = "Feed skeleton XRPC server for Lightbox", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)
            .with_context(|| format!("Failed to load {}", args.dotenv))?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();

    for feed in &config.feeds {
        tracing::info!(
            uri = %feed.uri(&config.publisher_did),
            list = feed.list_uri.as_deref().unwrap_or("(all)"),
            "serving feed"
        );
    }
    if config.feeds.is_empty() {
        tracing::warn!("FEEDGEN_FEEDS is empty, every skeleton request will be rejected");
    }

    if let Some(port) = config.metrics_port {
        let metrics_handle = init_metrics();
        start_metrics_server(port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let state = AppState::new(config)?;
    let app = with_http_layers(router(state));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Request tracing and permissive CORS.
fn with_http_layers(app: Router) -> Router {
    app.layer(
        TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
                query = request.uri().query().unwrap_or("")
            )
        }),
    )
    .layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining connections...");
}
