//! Core types and shared utilities for the Lightbox feed generator.
//!
//! This crate provides:
//! - The indexed record model and AT URI helpers
//! - The image-embed predicate used to decide what enters a feed
//! - The SQLite schema shared by the ingest daemon and the feed server
//! - Timestamp and pagination cursor codecs
//! - Prometheus metrics helpers
//! - Shared error types

pub mod embed;
mod error;
pub mod metrics;
pub mod record;
pub mod schema;
pub mod time;

use std::future::Future;
use std::pin::Pin;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Collection NSID of post records.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Collection NSID of repost records.
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

/// Collection NSID of feed generator declarations.
pub const FEED_GENERATOR_COLLECTION: &str = "app.bsky.feed.generator";

/// Boxed, sendable future used at the async trait seams of the workspace.
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use embed::{Embed, has_qualifying_embed, record_has_qualifying_embed};
pub use error::{Error, Result};
pub use record::{AtUri, IndexedRecord, RecordType};
pub use schema::SharedConnection;
pub use time::{decode_cursor, encode_cursor, format_indexed_at, parse_indexed_at};
