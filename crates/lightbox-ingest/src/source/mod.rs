//! Commit event source.
//!
//! The source keeps one websocket to a Jetstream-style commit stream, decodes
//! frames into [`CommitEvent`]s, groups them into micro-batches and hands each
//! batch to a [`BatchHandler`]. The stream position of a batch is persisted
//! only after the handler returns `Ok`, so delivery is at-least-once.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  frames   ┌───────────────────┐  batches  ┌──────────────┐
//! │ Jetstream  │ ────────► │ CommitEventSource │ ────────► │ BatchHandler │
//! └────────────┘           └─────────┬─────────┘           └──────────────┘
//!                                    │ set(position) after Ok
//!                                    ▼
//!                              ┌─────────────┐
//!                              │ CursorStore │
//!                              └─────────────┘
//! ```

mod frame;
mod jetstream;

pub use frame::decode_frame;
pub use jetstream::{
    CommitEventSource, ConnectionState, DEFAULT_SERVICE_NAME, DEFAULT_SUBSCRIPTION_ENDPOINT,
    SourceConfig, StreamEnd, backoff_delay,
};

use serde_json::Value;

use lightbox_core::{BoxedFuture, RecordType};

use crate::Result;

/// One repository operation on an indexed collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoOp {
    Create {
        uri: String,
        cid: String,
        record_type: RecordType,
        record: Value,
    },
    Delete {
        uri: String,
        record_type: RecordType,
    },
}

impl RepoOp {
    /// URI of the record the operation touches.
    pub fn uri(&self) -> &str {
        match self {
            Self::Create { uri, .. } | Self::Delete { uri, .. } => uri,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Create { record_type, .. } | Self::Delete { record_type, .. } => *record_type,
        }
    }
}

/// A commit by one repository at one stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// Stream position (Jetstream `time_us`).
    pub position: i64,
    /// DID of the repository that committed.
    pub author: String,
    pub ops: Vec<RepoOp>,
}

/// Consumer of micro-batches.
///
/// An error is fatal for the source run: the batch's position is not
/// persisted and the batch replays on restart.
pub trait BatchHandler: Send + Sync {
    fn handle_batch<'a>(&'a self, events: &'a [CommitEvent]) -> BoxedFuture<'a, Result<()>>;
}

/// Statistics from a source run.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Text frames received.
    pub frames: u64,
    /// Frames that failed to decode.
    pub invalid_frames: u64,
    /// Commit events delivered to the handler.
    pub events: u64,
    /// Batches delivered to the handler.
    pub batches: u64,
    /// Connection attempts after the first.
    pub reconnects: u64,
    /// Last persisted position.
    pub last_position: Option<i64>,
}
