//! Jetstream frame decoding.

use serde::Deserialize;
use serde_json::Value;

use lightbox_core::{AtUri, RecordType};

use super::{CommitEvent, RepoOp};
use crate::{Error, Result};

#[derive(Deserialize)]
struct RawFrame {
    did: String,
    time_us: i64,
    kind: String,
    commit: Option<RawCommit>,
}

#[derive(Deserialize)]
struct RawCommit {
    operation: String,
    collection: String,
    rkey: String,
    cid: Option<String>,
    record: Option<Value>,
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for frames that carry nothing to index: identity and
/// account events, updates, and commits to other collections. Malformed
/// frames are errors.
pub fn decode_frame(text: &str) -> Result<Option<CommitEvent>> {
    let frame: RawFrame = serde_json::from_str(text)?;

    if frame.time_us < 0 {
        return Err(Error::Stream(format!("negative time_us {}", frame.time_us)));
    }
    if frame.kind != "commit" {
        return Ok(None);
    }

    let commit = frame
        .commit
        .ok_or_else(|| Error::Stream("commit frame without commit body".to_string()))?;

    let Some(record_type) = RecordType::from_collection(&commit.collection) else {
        return Ok(None);
    };

    let uri = AtUri::new(&frame.did, &commit.collection, &commit.rkey).to_string();

    let op = match commit.operation.as_str() {
        "create" => {
            let (Some(cid), Some(record)) = (commit.cid, commit.record) else {
                return Err(Error::Stream(format!("create of {uri} without cid or record")));
            };
            RepoOp::Create {
                uri,
                cid,
                record_type,
                record,
            }
        }
        "delete" => RepoOp::Delete { uri, record_type },
        _ => return Ok(None),
    };

    Ok(Some(CommitEvent {
        position: frame.time_us,
        author: frame.did,
        ops: vec![op],
    }))
}
