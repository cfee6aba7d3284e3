//! Application state and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use lightbox_core::{AtUri, FEED_GENERATOR_COLLECTION, SharedConnection, schema};

use crate::cache::{ResponseCache, new_cache};
use crate::query::FeedQueryService;

/// One published feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDefinition {
    /// Record key of the feed generator record.
    pub shortname: String,
    /// List the feed is scoped to; `None` serves every indexed record.
    pub list_uri: Option<String>,
}

impl FeedDefinition {
    /// AT URI of the feed generator record published by `publisher_did`.
    pub fn uri(&self, publisher_did: &str) -> String {
        AtUri::new(publisher_did, FEED_GENERATOR_COLLECTION, &self.shortname).to_string()
    }
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:3000").
    pub bind_addr: String,

    /// Public hostname of this service.
    pub hostname: String,

    /// DID this service answers as.
    pub service_did: String,

    /// DID of the account that publishes the feed generator records.
    pub publisher_did: String,

    /// Path to the SQLite index written by the ingest daemon.
    pub sqlite_location: PathBuf,

    /// Published feeds, in configured order.
    pub feeds: Vec<FeedDefinition>,

    /// Prometheus port, if enabled.
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `FEEDGEN_HOSTNAME`: public hostname
    /// - `FEEDGEN_PUBLISHER_DID`: DID publishing the feed records
    ///
    /// Optional environment variables:
    /// - `FEEDGEN_PORT` (default: 3000), `FEEDGEN_LISTENHOST` (default: "0.0.0.0")
    /// - `FEEDGEN_SERVICE_DID` (default: `did:web:<hostname>`)
    /// - `FEEDGEN_SQLITE_LOCATION` (default: "./data/lightbox.db")
    /// - `FEEDGEN_FEEDS`: comma-separated `shortname=list-uri` pairs
    /// - `FEEDGEN_METRICS_PORT`: Prometheus port (unset or 0 disables)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port: u16 = match var("FEEDGEN_PORT") {
            Some(port) => port.parse().context("FEEDGEN_PORT must be a port number")?,
            None => 3000,
        };
        let listen_host = var("FEEDGEN_LISTENHOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_addr = format!("{listen_host}:{port}");

        let hostname = var("FEEDGEN_HOSTNAME")
            .ok_or_else(|| anyhow::anyhow!("FEEDGEN_HOSTNAME environment variable is required"))?;

        let service_did = var("FEEDGEN_SERVICE_DID").unwrap_or_else(|| format!("did:web:{hostname}"));

        let publisher_did = var("FEEDGEN_PUBLISHER_DID").ok_or_else(|| {
            anyhow::anyhow!("FEEDGEN_PUBLISHER_DID environment variable is required")
        })?;

        let sqlite_location = var("FEEDGEN_SQLITE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/lightbox.db"));

        let feeds = match var("FEEDGEN_FEEDS") {
            Some(raw) => parse_feeds(&raw)?,
            None => Vec::new(),
        };

        let metrics_port = match var("FEEDGEN_METRICS_PORT") {
            Some(port) => {
                let port: u16 = port
                    .parse()
                    .context("FEEDGEN_METRICS_PORT must be a port number")?;
                (port > 0).then_some(port)
            }
            None => None,
        };

        tracing::info!(
            bind_addr = %bind_addr,
            service_did = %service_did,
            publisher_did = %publisher_did,
            feed_count = feeds.len(),
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            hostname,
            service_did,
            publisher_did,
            sqlite_location,
            feeds,
            metrics_port,
        })
    }

    /// Find the feed whose generator URI is `feed_uri`.
    pub fn feed_for_uri(&self, feed_uri: &str) -> Option<&FeedDefinition> {
        let uri: AtUri = feed_uri.parse().ok()?;
        if uri.authority != self.publisher_did || uri.collection != FEED_GENERATOR_COLLECTION {
            return None;
        }
        self.feeds.iter().find(|feed| feed.shortname == uri.rkey)
    }
}

/// Parse `shortname=list-uri` pairs. An empty list URI means unscoped.
fn parse_feeds(raw: &str) -> anyhow::Result<Vec<FeedDefinition>> {
    let mut feeds: Vec<FeedDefinition> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (shortname, list_uri) = entry.split_once('=').unwrap_or((entry, ""));
        let shortname = shortname.trim();
        if shortname.is_empty() {
            anyhow::bail!("FEEDGEN_FEEDS entry '{entry}' has no shortname");
        }
        if feeds.iter().any(|f| f.shortname == shortname) {
            anyhow::bail!("FEEDGEN_FEEDS lists '{shortname}' more than once");
        }

        let list_uri = list_uri.trim();
        let list_uri = if list_uri.is_empty() {
            None
        } else {
            list_uri
                .parse::<AtUri>()
                .with_context(|| format!("invalid list URI for feed '{shortname}'"))?;
            Some(list_uri.to_string())
        };

        feeds.push(FeedDefinition {
            shortname: shortname.to_string(),
            list_uri,
        });
    }

    Ok(feeds)
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,

    /// Read path over the content index.
    pub feeds: Arc<FeedQueryService>,

    /// Skeleton page cache.
    pub cache: ResponseCache,
}

impl AppState {
    /// Open the index read-only and build the state.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let conn = schema::open_read_only(&config.sqlite_location).with_context(|| {
            format!(
                "Failed to open index at {}",
                config.sqlite_location.display()
            )
        })?;
        tracing::info!("Index database opened (read-only): {:?}", config.sqlite_location);

        Ok(Self::with_connection(config, schema::shared(conn)))
    }

    /// Build the state over an existing connection.
    pub fn with_connection(config: Config, conn: SharedConnection) -> Self {
        Self {
            config: Arc::new(config),
            feeds: Arc::new(FeedQueryService::new(conn)),
            cache: new_cache(),
        }
    }
}
