//! Prometheus metrics helpers for Lightbox.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lightbox_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("stream_events_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`stream_`, `allowlist_`, `classifier_`, `index_`, `feed_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only low-cardinality ones such as `type` or `outcome`

use std::net::SocketAddr;

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` before returning so bind failures surface to the
/// caller, then serves `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded across Lightbox.
fn register_common_metrics() {
    // =========================================================================
    // Commit stream
    // =========================================================================

    describe_gauge!(
        "ingestion_running",
        "1 while the ingestion daemon is running"
    );
    describe_counter!(
        "stream_frames_total",
        "Frames received from the commit stream"
    );
    describe_counter!(
        "stream_frames_invalid_total",
        "Frames that could not be decoded and were skipped"
    );
    describe_counter!(
        "stream_events_total",
        "Commit events delivered to the processor"
    );
    describe_counter!(
        "stream_batches_total",
        "Micro-batches delivered to the processor"
    );
    describe_counter!(
        "stream_reconnects_total",
        "Connection attempts after a disconnect"
    );
    describe_gauge!(
        "stream_connection_state",
        "Connection state (0=disconnected, 1=connecting, 2=streaming, 3=backoff)"
    );
    describe_gauge!("stream_cursor", "Last persisted stream position (time_us)");

    // =========================================================================
    // Allow-list
    // =========================================================================

    describe_counter!(
        "allowlist_refresh_total",
        "Allow-list refreshes attempted (label: outcome)"
    );
    describe_counter!(
        "allowlist_refresh_errors_total",
        "Allow-list refreshes that failed and kept the previous snapshot"
    );
    describe_counter!(
        "allowlist_rate_limited_total",
        "Directory pages that were rate limited and retried"
    );
    describe_gauge!("allowlist_identities", "Identities in the current snapshot");
    describe_gauge!("allowlist_lists", "Lists in the current snapshot");
    describe_histogram!(
        "allowlist_refresh_duration_seconds",
        "Time spent on a full allow-list refresh"
    );

    // =========================================================================
    // Classifier
    // =========================================================================

    describe_counter!(
        "classifier_lookups_total",
        "Subject lookup calls issued for reposts"
    );
    describe_counter!(
        "classifier_subjects_unresolved_total",
        "Repost subjects that could not be resolved and were dropped"
    );

    // =========================================================================
    // Index writer
    // =========================================================================

    describe_counter!(
        "index_records_inserted_total",
        "Rows inserted into the content index (label: type)"
    );
    describe_counter!(
        "index_records_deleted_total",
        "Rows deleted from the content index (label: type)"
    );
    describe_counter!(
        "index_ops_skipped_total",
        "Operations dropped by the processor (label: reason)"
    );
    describe_histogram!(
        "index_batch_duration_seconds",
        "Time spent processing one micro-batch"
    );

    // =========================================================================
    // Feed server
    // =========================================================================

    describe_counter!(
        "feed_requests_total",
        "Feed skeleton requests served (label: feed)"
    );
}
