//! Allow-list of identities admitted into feeds.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   getLists / getList    ┌──────────────────┐
//! │  MemberDirectory │ ◄────────────────────── │  AllowListCache  │
//! └──────────────────┘    (refresh task)       └────────┬─────────┘
//!                                                       │ get()
//!                                                       ▼
//!                                          Arc<AllowListSnapshot>
//! ```
//!
//! The cache publishes immutable snapshots. Readers clone an `Arc` and never
//! wait on I/O; a failed refresh leaves the previous snapshot in place.

mod cache;
mod directory;

pub use cache::{AllowListCache, AllowListConfig, AllowListSnapshot, RefreshOutcome};
pub use directory::{BskyDirectory, ListPage, MAX_PAGE_SIZE, MemberDirectory, MemberPage};
