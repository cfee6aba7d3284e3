//! Lightbox Serve - feed skeleton XRPC server.
//!
//! Serves `app.bsky.feed.getFeedSkeleton` pages read from the SQLite index
//! maintained by `lightbox-ingest`. The index is opened read-only; this
//! process never writes to it.
//!
//! # Architecture
//!
//! - **AppState**: configuration, query service and response cache
//! - **FeedQueryService**: cursor-paginated reads over `indexed_content`
//! - **Routes**: XRPC handlers, health check and the did:web document

pub mod cache;
mod error;
pub mod query;
mod routes;
mod state;

pub use self::cache::{PageKey, ResponseCache, get_or_compute, new_cache};
pub use self::error::ApiError;
pub use self::query::{FeedQueryService, SkeletonItem, SkeletonPage};
pub use self::routes::router;
pub use self::state::{AppState, Config, FeedDefinition};
