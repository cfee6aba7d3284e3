//! Lightbox ingestion pipeline.
//!
//! Consumes the network commit stream, keeps image posts (and reposts of
//! image posts) authored by members of the configured lists, and maintains
//! the `indexed_content` table that `lightbox-serve` reads.
//!
//! # Modules
//!
//! - [`source`] - commit stream connection, frame decoding, micro-batching
//! - [`allowlist`] - TTL-refreshed list membership snapshot
//! - [`classify`] - image-embed classification and repost subject lookup
//! - [`index`] - idempotent writes to the content index
//! - [`cursor`] - durable stream position per source
//! - [`processor`] - per-batch orchestration
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Commit stream   │  Jetstream websocket
//! └────────┬─────────┘
//!          │ micro-batches
//!          ▼
//! ┌──────────────────────┐      ┌────────────────┐
//! │ SubscriptionProcessor│ ───► │ AllowListCache │  refreshed in background
//! └────────┬─────────────┘      └────────────────┘
//!          │               ───► ┌────────────────┐
//!          │                    │ EmbedClassifier│  getPosts for reposts
//!          ▼                    └────────────────┘
//! ┌──────────────────┐
//! │   IndexWriter    │  SQLite indexed_content
//! └────────┬─────────┘
//!          │ Ok
//!          ▼
//! ┌──────────────────┐
//! │   CursorStore    │  sub_state
//! └──────────────────┘
//! ```

pub mod allowlist;
pub mod classify;
pub mod cursor;
pub mod error;
pub mod index;
pub mod processor;
pub mod source;
pub mod xrpc;

pub use error::{Error, Result};

pub use allowlist::{
    AllowListCache, AllowListConfig, AllowListSnapshot, BskyDirectory, MemberDirectory,
    RefreshOutcome,
};
pub use classify::{AppViewLookup, EmbedClassifier, PostLookup, ResolvedPost};
pub use cursor::{CursorState, CursorStore};
pub use index::{ApplyStats, IndexBatch, IndexWriter, NewRecord};
pub use processor::{BatchReport, SubscriptionProcessor};
pub use source::{
    BatchHandler, CommitEvent, CommitEventSource, ConnectionState, RepoOp, SourceConfig,
    SourceStats,
};
pub use xrpc::{XrpcClient, XrpcError};
