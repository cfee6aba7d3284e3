//! TTL-refreshed allow-list snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::directory::{MAX_PAGE_SIZE, MemberDirectory};
use crate::xrpc::XrpcError;
use crate::{Error, Result};

/// Configuration for the allow-list cache.
#[derive(Debug, Clone)]
pub struct AllowListConfig {
    /// Lists whose members are admitted, in registration order.
    pub list_uris: Vec<String>,
    /// Actor whose own lists are discovered and appended on every refresh.
    pub list_owner: Option<String>,
    /// Members requested per directory page (at most 100).
    pub list_page_size: u32,
    /// Time between background refreshes.
    pub refresh_interval: Duration,
    /// Wait before retrying a rate-limited page.
    pub rate_limit_delay: Duration,
    /// Retries of one rate-limited page before the refresh fails.
    pub rate_limit_retries: u32,
}

impl Default for AllowListConfig {
    fn default() -> Self {
        Self {
            list_uris: Vec::new(),
            list_owner: None,
            list_page_size: MAX_PAGE_SIZE,
            refresh_interval: Duration::from_secs(600), // 10 minutes
            rate_limit_delay: Duration::from_secs(5),
            rate_limit_retries: 5,
        }
    }
}

/// Immutable view of the allow-list at one point in time.
#[derive(Debug, Clone, Default)]
pub struct AllowListSnapshot {
    identity_to_list: HashMap<String, String>,
    list_count: usize,
    last_refreshed_at: Option<DateTime<Utc>>,
}

impl AllowListSnapshot {
    /// Build a snapshot from `(did, list_uri)` entries in registration order.
    ///
    /// An identity registered more than once keeps its last list.
    pub fn from_entries<I, D, L>(entries: I, refreshed_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = (D, L)>,
        D: Into<String>,
        L: Into<String>,
    {
        let identity_to_list: HashMap<String, String> = entries
            .into_iter()
            .map(|(did, list)| (did.into(), list.into()))
            .collect();
        let list_count = {
            let mut lists: Vec<&str> = identity_to_list.values().map(String::as_str).collect();
            lists.sort_unstable();
            lists.dedup();
            lists.len()
        };

        Self {
            identity_to_list,
            list_count,
            last_refreshed_at: Some(refreshed_at),
        }
    }

    pub fn contains(&self, did: &str) -> bool {
        self.identity_to_list.contains_key(did)
    }

    /// List through which `did` was admitted.
    pub fn list_for(&self, did: &str) -> Option<&str> {
        self.identity_to_list.get(did).map(String::as_str)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.identity_to_list.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.identity_to_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identity_to_list.is_empty()
    }

    /// Distinct lists contributing at least one identity.
    pub fn list_count(&self) -> usize {
        self.list_count
    }

    /// `None` until the first successful refresh.
    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed_at
    }
}

/// Result of a refresh trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new snapshot was published.
    Refreshed { identities: usize, lists: usize },
    /// Another refresh was already in flight.
    Skipped,
}

/// Owner of the current allow-list snapshot.
pub struct AllowListCache {
    config: AllowListConfig,
    directory: Arc<dyn MemberDirectory>,
    snapshot: RwLock<Arc<AllowListSnapshot>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag when a refresh ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AllowListCache {
    /// Create the cache and perform the first refresh.
    ///
    /// The first refresh is mandatory: its error is returned as-is and no
    /// cache is constructed.
    pub async fn load(
        config: AllowListConfig,
        directory: Arc<dyn MemberDirectory>,
    ) -> Result<Arc<Self>> {
        if config.list_uris.is_empty() && config.list_owner.is_none() {
            return Err(Error::Config(
                "at least one list URI or a list owner is required".to_string(),
            ));
        }

        let cache = Arc::new(Self {
            config,
            directory,
            snapshot: RwLock::new(Arc::new(AllowListSnapshot::default())),
            refreshing: AtomicBool::new(false),
        });

        cache.refresh().await?;
        Ok(cache)
    }

    /// Current snapshot. Never performs I/O.
    pub fn get(&self) -> Arc<AllowListSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn config(&self) -> &AllowListConfig {
        &self.config
    }

    /// Rebuild the snapshot from the directory and publish it.
    ///
    /// Returns [`RefreshOutcome::Skipped`] if a refresh is already running.
    /// On error the previous snapshot stays published.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("allow-list refresh already in flight, skipping");
            counter!("allowlist_refresh_total", "outcome" => "skipped").increment(1);
            return Ok(RefreshOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.refreshing);

        let start = Instant::now();
        let result = self.fetch_snapshot().await;
        histogram!("allowlist_refresh_duration_seconds").record(start.elapsed().as_secs_f64());

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                counter!("allowlist_refresh_total", "outcome" => "error").increment(1);
                counter!("allowlist_refresh_errors_total").increment(1);
                return Err(e);
            }
        };

        let identities = snapshot.len();
        let lists = snapshot.list_count();
        *self.snapshot.write() = Arc::new(snapshot);

        counter!("allowlist_refresh_total", "outcome" => "ok").increment(1);
        gauge!("allowlist_identities").set(identities as f64);
        gauge!("allowlist_lists").set(lists as f64);
        tracing::info!(
            identities,
            lists,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "allow-list refreshed"
        );

        Ok(RefreshOutcome::Refreshed { identities, lists })
    }

    /// Refresh every `refresh_interval` until `running` is cleared.
    ///
    /// Failures are logged and the previous snapshot keeps serving.
    pub fn spawn_refresh_task(self: &Arc<Self>, running: Arc<AtomicBool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let interval = cache.config.refresh_interval;

            while running.load(Ordering::SeqCst) {
                // Sleep in short slices so shutdown is observed promptly
                let start = Instant::now();
                while start.elapsed() < interval && running.load(Ordering::SeqCst) {
                    let remaining = interval.saturating_sub(start.elapsed());
                    tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                match cache.refresh().await {
                    Ok(RefreshOutcome::Refreshed { .. }) => {}
                    Ok(RefreshOutcome::Skipped) => {
                        tracing::debug!("scheduled allow-list refresh skipped");
                    }
                    Err(e) => {
                        let snapshot = cache.get();
                        tracing::warn!(
                            error = %e,
                            identities = snapshot.len(),
                            last_refreshed_at = ?snapshot.last_refreshed_at(),
                            "allow-list refresh failed, keeping previous snapshot"
                        );
                    }
                }
            }

            tracing::info!("allow-list refresh task stopped");
        })
    }

    async fn fetch_snapshot(&self) -> Result<AllowListSnapshot> {
        let lists = self.resolve_lists().await?;
        let mut entries: Vec<(String, String)> = Vec::new();

        for list_uri in &lists {
            let mut cursor: Option<String> = None;
            let mut members = 0usize;

            loop {
                let page = self
                    .retry_rate_limited("app.bsky.graph.getList", || {
                        self.directory.list_members(
                            list_uri,
                            cursor.as_deref(),
                            self.config.list_page_size,
                        )
                    })
                    .await?;

                members += page.members.len();
                entries.extend(page.members.into_iter().map(|did| (did, list_uri.clone())));

                match page.cursor {
                    Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                    Some(_) => {
                        tracing::warn!(list = %list_uri, "directory repeated a page cursor, stopping");
                        break;
                    }
                    None => break,
                }
            }

            tracing::debug!(list = %list_uri, members, "fetched list members");
        }

        Ok(AllowListSnapshot::from_entries(entries, Utc::now()))
    }

    /// Configured lists followed by any discovered from `list_owner`.
    async fn resolve_lists(&self) -> Result<Vec<String>> {
        let mut lists = self.config.list_uris.clone();

        let Some(owner) = self.config.list_owner.as_deref() else {
            return Ok(lists);
        };

        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .retry_rate_limited("app.bsky.graph.getLists", || {
                    self.directory
                        .owned_lists(owner, cursor.as_deref(), self.config.list_page_size)
                })
                .await?;

            for uri in page.lists {
                if !lists.contains(&uri) {
                    lists.push(uri);
                }
            }

            match page.cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(owner, lists = lists.len(), "resolved allow-list sources");
        Ok(lists)
    }

    /// Retry one page while upstream answers 429, bounded by `rate_limit_retries`.
    async fn retry_rate_limited<T, F, Fut>(&self, method: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, XrpcError>>,
    {
        let retries = self.config.rate_limit_retries;

        for attempt in 0..=retries {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_rate_limited() => {
                    counter!("allowlist_rate_limited_total").increment(1);
                    if attempt == retries {
                        break;
                    }
                    tracing::warn!(
                        method,
                        attempt = attempt + 1,
                        delay_ms = self.config.rate_limit_delay.as_millis() as u64,
                        "rate limited, retrying page"
                    );
                    tokio::time::sleep(self.config.rate_limit_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::RateLimited {
            method,
            attempts: retries + 1,
        })
    }
}
