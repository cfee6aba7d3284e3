//! Lightbox ingestion daemon.
//!
//! Subscribes to the commit stream, filters commits against the configured
//! lists and writes qualifying image posts into the SQLite index.
//!
//! # Usage
//!
//! ```bash
//! # Index members of one list
//! lightbox-ingest --list-uris at://did:plc:xyz/app.bsky.graph.list/abc
//!
//! # Index members of every list owned by an account, custom database
//! FEEDGEN_LIST_OWNER=did:plc:xyz \
//! FEEDGEN_SQLITE_LOCATION=/data/lightbox.db \
//!     lightbox-ingest
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT/SIGTERM clears the running flag:
//! 1. The batch in progress finishes and its cursor is saved
//! 2. A partially-filled batch is flushed
//! 3. The websocket is closed and the refresh task exits

use anyhow::{Context, Result};
use clap::Parser;
use lightbox_core::metrics::{init_metrics, start_metrics_server};
use lightbox_core::schema;
use lightbox_ingest::{
    AllowListCache, AllowListConfig, AppViewLookup, BskyDirectory, CommitEventSource,
    CursorStore, EmbedClassifier, IndexWriter, SourceConfig, SubscriptionProcessor, XrpcClient,
    classify::MAX_LOOKUP_BATCH,
    source::{DEFAULT_SERVICE_NAME, DEFAULT_SUBSCRIPTION_ENDPOINT},
    xrpc::DEFAULT_APPVIEW_URL,
};
use metrics::gauge;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Lightbox ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "lightbox-ingest")]
#[command(about = "Index image posts from curated lists off the commit stream")]
#[command(version)]
struct Args {
    /// SQLite database file
    #[arg(long, env = "FEEDGEN_SQLITE_LOCATION", default_value = "./data/lightbox.db")]
    sqlite_location: PathBuf,

    /// Commit stream websocket endpoint
    #[arg(long, env = "FEEDGEN_SUBSCRIPTION_ENDPOINT", default_value = DEFAULT_SUBSCRIPTION_ENDPOINT)]
    subscription_endpoint: String,

    /// Initial reconnect delay in milliseconds
    #[arg(long, env = "FEEDGEN_SUBSCRIPTION_RECONNECT_DELAY", default_value = "3000")]
    reconnect_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds
    #[arg(long, env = "FEEDGEN_MAX_RECONNECT_DELAY", default_value = "60000")]
    max_reconnect_delay_ms: u64,

    /// Curation list URIs (comma-separated)
    #[arg(long, env = "FEEDGEN_LIST_URIS", value_delimiter = ',')]
    list_uris: Vec<String>,

    /// DID whose lists are all included
    #[arg(long, env = "FEEDGEN_LIST_OWNER")]
    list_owner: Option<String>,

    /// Allow-list refresh interval in seconds
    #[arg(long, env = "FEEDGEN_REFRESH_INTERVAL", default_value = "600")]
    refresh_interval_secs: u64,

    /// AppView used for list and post lookups
    #[arg(long, env = "FEEDGEN_APPVIEW_URL", default_value = DEFAULT_APPVIEW_URL)]
    appview_url: String,

    /// Repost subjects per getPosts call (1-10)
    #[arg(long, env = "FEEDGEN_LOOKUP_BATCH_SIZE", default_value = "10")]
    lookup_batch_size: usize,

    /// Events per micro-batch
    #[arg(long, env = "FEEDGEN_BATCH_MAX_EVENTS", default_value = "64")]
    batch_max_events: usize,

    /// Longest a partial batch waits, in milliseconds
    #[arg(long, env = "FEEDGEN_BATCH_LINGER_MS", default_value = "250")]
    batch_linger_ms: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "FEEDGEN_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("lightbox_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Lightbox ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
        gauge!("ingestion_running").set(1.0);
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.sqlite_location.display());
    tracing::info!("  Stream: {}", args.subscription_endpoint);
    tracing::info!("  AppView: {}", args.appview_url);
    tracing::info!("  Lists: {}", args.list_uris.len());
    tracing::info!(
        "  List owner: {}",
        args.list_owner.as_deref().unwrap_or("none")
    );

    let conn = schema::open(&args.sqlite_location).with_context(|| {
        format!(
            "Failed to open database at {}",
            args.sqlite_location.display()
        )
    })?;
    let conn = schema::shared(conn);

    let cursors = CursorStore::new(Arc::clone(&conn));
    match cursors
        .get(DEFAULT_SERVICE_NAME)
        .context("Failed to read stream cursor")?
    {
        Some(position) => tracing::info!("Resuming stream at cursor {}", position),
        None => tracing::info!("No stored cursor, starting at live tail"),
    }

    let writer = IndexWriter::new(Arc::clone(&conn)).context("Failed to open content index")?;

    let client = XrpcClient::new(&args.appview_url, Duration::from_secs(30))
        .context("Failed to create AppView client")?;

    let allow_list_config = AllowListConfig {
        list_uris: args.list_uris.clone(),
        list_owner: args.list_owner.clone(),
        refresh_interval: Duration::from_secs(args.refresh_interval_secs.max(1)),
        ..Default::default()
    };
    let allow_list = AllowListCache::load(
        allow_list_config,
        Arc::new(BskyDirectory::new(client.clone())),
    )
    .await
    .context("Failed to load allow-list")?;

    let snapshot = allow_list.get();
    tracing::info!(
        "Allow-list loaded: {} identities from {} lists",
        snapshot.len(),
        snapshot.list_count()
    );

    let refresh_handle = allow_list.spawn_refresh_task(Arc::clone(&running));

    let classifier = EmbedClassifier::new(
        Arc::new(AppViewLookup::new(client)),
        args.lookup_batch_size.min(MAX_LOOKUP_BATCH),
    );
    let processor = SubscriptionProcessor::new(Arc::clone(&allow_list), classifier, writer);

    let source_config = SourceConfig {
        endpoint: args.subscription_endpoint.clone(),
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        max_reconnect_delay: Duration::from_millis(
            args.max_reconnect_delay_ms.max(args.reconnect_delay_ms),
        ),
        batch_max_events: args.batch_max_events.max(1),
        batch_linger: Duration::from_millis(args.batch_linger_ms),
        ..Default::default()
    };
    let source = CommitEventSource::new(source_config, cursors, Arc::clone(&running));

    tracing::info!("Starting live ingestion...");
    let result = source.run(&processor).await;

    // Stop the refresh task whether the source ended cleanly or not
    running.store(false, Ordering::SeqCst);
    if let Err(e) = refresh_handle.await {
        tracing::warn!("Allow-list refresh task panicked: {:?}", e);
    }

    gauge!("ingestion_running").set(0.0);

    let stats = result.context("Commit stream source failed")?;
    let indexed = processor.writer().count().unwrap_or_default();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Frames received:      {}", stats.frames);
    tracing::info!("Invalid frames:       {}", stats.invalid_frames);
    tracing::info!("Events processed:     {}", stats.events);
    tracing::info!("Batches:              {}", stats.batches);
    tracing::info!("Reconnects:           {}", stats.reconnects);
    tracing::info!(
        "Last cursor:          {}",
        stats
            .last_position
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unchanged".to_string())
    );
    tracing::info!("Indexed records:      {}", indexed);

    Ok(())
}
