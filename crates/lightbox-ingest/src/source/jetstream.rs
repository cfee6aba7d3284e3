//! Jetstream websocket source with reconnect/backoff.
//!
//! States: `Disconnected → Connecting → Streaming → Backoff → Connecting → …`.
//! `Disconnected` is terminal and only entered once the shared `running`
//! flag is cleared or a batch handler fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use lightbox_core::{POST_COLLECTION, REPOST_COLLECTION};

use super::frame::decode_frame;
use super::{BatchHandler, CommitEvent, SourceStats};
use crate::cursor::CursorStore;
use crate::{Error, Result};

/// Public Jetstream instance used when no endpoint is configured.
pub const DEFAULT_SUBSCRIPTION_ENDPOINT: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

/// Key under which the stream position is stored in `sub_state`.
pub const DEFAULT_SERVICE_NAME: &str = "jetstream";

/// Configuration for the commit stream source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Websocket endpoint, e.g. `wss://host/subscribe`.
    pub endpoint: String,
    /// Cursor key in `sub_state`.
    pub service_name: String,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Timeout for the websocket handshake.
    pub connect_timeout: Duration,
    /// Events per micro-batch.
    pub batch_max_events: usize,
    /// Longest a partially-filled batch waits before delivery.
    pub batch_linger: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SUBSCRIPTION_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            reconnect_delay: Duration::from_millis(3000),
            max_reconnect_delay: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            batch_max_events: 64,
            batch_linger: Duration::from_millis(250),
        }
    }
}

/// Connection state of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Backoff = 3,
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Streaming,
            3 => ConnectionState::Backoff,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Why [`CommitEventSource::consume`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The `running` flag was cleared.
    Shutdown,
    /// The connection ended or failed; reconnect.
    Closed(String),
}

/// Reconnect delay for `attempt` (0-based): `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::from_millis(1);
    }
    let multiplier = 1u64 << attempt.min(16);
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(multiplier);
    Duration::from_millis(delay_ms.min(max.as_millis() as u64).max(1))
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    invalid_frames: AtomicU64,
    events: AtomicU64,
    batches: AtomicU64,
    reconnects: AtomicU64,
}

/// Commit stream consumer.
pub struct CommitEventSource {
    config: SourceConfig,
    cursors: CursorStore,
    running: Arc<AtomicBool>,
    state: AtomicU8,
    counters: Counters,
    last_position: AtomicI64,
}

impl CommitEventSource {
    pub fn new(config: SourceConfig, cursors: CursorStore, running: Arc<AtomicBool>) -> Self {
        Self {
            config,
            cursors,
            running,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            counters: Counters::default(),
            last_position: AtomicI64::new(-1),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
        gauge!("stream_connection_state").set(state as u8 as f64);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters for this source.
    pub fn stats(&self) -> SourceStats {
        let last = self.last_position.load(Ordering::Relaxed);
        SourceStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            invalid_frames: self.counters.invalid_frames.load(Ordering::Relaxed),
            events: self.counters.events.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            last_position: (last >= 0).then_some(last),
        }
    }

    /// Subscription URL for the indexed collections, resuming at `cursor`.
    pub fn subscribe_url(&self, cursor: Option<i64>) -> Result<Url> {
        let mut url = Url::parse(&self.config.endpoint).map_err(|e| {
            Error::Config(format!(
                "invalid subscription endpoint '{}': {e}",
                self.config.endpoint
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("wantedCollections", POST_COLLECTION);
            query.append_pair("wantedCollections", REPOST_COLLECTION);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }

        Ok(url)
    }

    /// Run until the `running` flag is cleared.
    ///
    /// Connection failures are retried with backoff. Handler and cursor
    /// errors are returned and end the run.
    pub async fn run(&self, handler: &dyn BatchHandler) -> Result<SourceStats> {
        tracing::info!(endpoint = %self.config.endpoint, "starting commit stream source");

        let result = self.run_connections(handler).await;
        self.set_state(ConnectionState::Disconnected);

        let stats = self.stats();
        match result {
            Ok(()) => {
                tracing::info!(
                    events = stats.events,
                    batches = stats.batches,
                    "commit stream source stopped"
                );
                Ok(stats)
            }
            Err(e) => {
                tracing::error!(error = %e, "commit stream source failed");
                Err(e)
            }
        }
    }

    async fn run_connections(&self, handler: &dyn BatchHandler) -> Result<()> {
        let mut attempt: u32 = 0;
        let mut first = true;

        while self.is_running() {
            let resume = self.cursors.get(&self.config.service_name)?;
            let url = self.subscribe_url(resume)?;

            if !first {
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                counter!("stream_reconnects_total").increment(1);
            }
            first = false;

            self.set_state(ConnectionState::Connecting);
            match resume {
                Some(cursor) => tracing::info!(cursor, "connecting to commit stream"),
                None => tracing::info!("connecting to commit stream (live tail)"),
            }

            let connected =
                tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                    .await;

            match connected {
                Ok(Ok((mut ws, _response))) => {
                    self.set_state(ConnectionState::Streaming);
                    attempt = 0;
                    tracing::info!("commit stream connected");

                    match self.consume(&mut ws, handler).await? {
                        StreamEnd::Shutdown => {
                            if let Err(e) = ws.close(None).await {
                                tracing::debug!(error = %e, "error closing websocket");
                            }
                            break;
                        }
                        StreamEnd::Closed(reason) => {
                            tracing::warn!(%reason, "commit stream disconnected");
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to connect to commit stream");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = self.config.connect_timeout.as_secs(),
                        "commit stream handshake timed out"
                    );
                }
            }

            if !self.is_running() {
                break;
            }

            self.set_state(ConnectionState::Backoff);
            let delay = backoff_delay(
                self.config.reconnect_delay,
                self.config.max_reconnect_delay,
                attempt,
            );
            attempt = attempt.saturating_add(1);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt,
                "reconnecting after backoff"
            );
            self.sleep_while_running(delay).await;
        }

        Ok(())
    }

    /// Consume one connection's frames, delivering micro-batches.
    ///
    /// Returns when the stream ends or `running` is cleared; any partial
    /// batch is delivered first. Handler and cursor errors are returned.
    pub async fn consume<S>(&self, stream: &mut S, handler: &dyn BatchHandler) -> Result<StreamEnd>
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        let max_events = self.config.batch_max_events.max(1);
        let mut batch: Vec<CommitEvent> = Vec::with_capacity(max_events);
        let mut deadline: Option<Instant> = None;

        loop {
            if !self.is_running() {
                self.flush(&mut batch, handler).await?;
                return Ok(StreamEnd::Shutdown);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.flush(&mut batch, handler).await?;
                deadline = None;
            }

            // Wake at least once a second to observe the running flag
            let wait = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(1))
                .min(Duration::from_secs(1));

            let message = match tokio::time::timeout(wait, stream.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    self.flush(&mut batch, handler).await?;
                    return Ok(StreamEnd::Closed("stream ended".to_string()));
                }
                Ok(Some(Err(e))) => {
                    self.flush(&mut batch, handler).await?;
                    return Ok(StreamEnd::Closed(e.to_string()));
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    counter!("stream_frames_total").increment(1);

                    match decode_frame(text.as_str()) {
                        Ok(Some(event)) => {
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + self.config.batch_linger);
                            }
                            batch.push(event);
                            if batch.len() >= max_events {
                                self.flush(&mut batch, handler).await?;
                                deadline = None;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                            counter!("stream_frames_invalid_total").increment(1);
                            tracing::debug!(error = %e, "skipping invalid frame");
                        }
                    }
                }
                Message::Close(frame) => {
                    self.flush(&mut batch, handler).await?;
                    let reason = frame
                        .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    return Ok(StreamEnd::Closed(reason));
                }
                // Pings are answered by tungstenite on the next read
                _ => {}
            }
        }
    }

    /// Deliver the batch, then persist its last position.
    async fn flush(&self, batch: &mut Vec<CommitEvent>, handler: &dyn BatchHandler) -> Result<()> {
        let Some(position) = batch.last().map(|event| event.position) else {
            return Ok(());
        };

        let start = Instant::now();
        handler.handle_batch(batch).await?;
        histogram!("index_batch_duration_seconds").record(start.elapsed().as_secs_f64());

        self.cursors.set(&self.config.service_name, position)?;
        self.last_position.store(position, Ordering::Relaxed);

        self.counters
            .events
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        counter!("stream_events_total").increment(batch.len() as u64);
        counter!("stream_batches_total").increment(1);
        gauge!("stream_cursor").set(position as f64);

        batch.clear();
        Ok(())
    }

    async fn sleep_while_running(&self, delay: Duration) {
        let start = Instant::now();
        while start.elapsed() < delay && self.is_running() {
            let remaining = delay.saturating_sub(start.elapsed());
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    }
}
