//! Indexed record model and AT URI helpers.

use std::fmt;
use std::str::FromStr;

use rusqlite::Row;
use rusqlite::types::Type;
use serde::Serialize;

use crate::{Error, POST_COLLECTION, REPOST_COLLECTION, Result};

/// Kind of row in the content index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// An original post carrying image media.
    Post,
    /// A repost whose subject post carries image media.
    Repost,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Repost => "repost",
        }
    }

    /// Collection NSID whose records produce this row kind.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Post => POST_COLLECTION,
            Self::Repost => REPOST_COLLECTION,
        }
    }

    /// Map a collection NSID to a row kind, if it is one we index.
    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            POST_COLLECTION => Some(Self::Post),
            REPOST_COLLECTION => Some(Self::Repost),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "post" => Ok(Self::Post),
            "repost" => Ok(Self::Repost),
            other => Err(Error::UnknownRecordType(other.to_string())),
        }
    }
}

/// One row of the `indexed_content` table.
///
/// `content_uri` is always the post shown in the feed. For a repost row it is
/// the subject's URI and the repost's own URI lives in `repost_uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedRecord {
    pub content_uri: String,
    pub content_cid: String,
    /// RFC 3339 UTC with millisecond precision.
    pub indexed_at: String,
    /// List through which the author was admitted.
    pub list_uri: String,
    pub record_type: RecordType,
    pub repost_uri: Option<String>,
}

impl IndexedRecord {
    /// Column list matching [`IndexedRecord::from_row`].
    pub const COLUMNS: &'static str =
        "content_uri, content_cid, indexed_at, list_uri, record_type, repost_uri";

    /// Build a record from a row selected with [`IndexedRecord::COLUMNS`].
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let record_type: String = row.get(4)?;
        let record_type = record_type.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
        })?;

        Ok(Self {
            content_uri: row.get(0)?,
            content_cid: row.get(1)?,
            indexed_at: row.get(2)?,
            list_uri: row.get(3)?,
            record_type,
            repost_uri: row.get(5)?,
        })
    }
}

/// A parsed `at://authority/collection/rkey` record URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        authority: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            authority: authority.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse a record URI. Authority, collection and rkey must all be present.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidUri {
            uri: uri.to_string(),
            reason,
        };

        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| invalid("missing at:// scheme"))?;

        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().unwrap_or_default();
        let collection = parts.next().unwrap_or_default();
        let rkey = parts.next().unwrap_or_default();

        if authority.is_empty() {
            return Err(invalid("missing authority"));
        }
        if collection.is_empty() {
            return Err(invalid("missing collection"));
        }
        if rkey.is_empty() || rkey.contains('/') {
            return Err(invalid("missing or malformed record key"));
        }

        Ok(Self::new(authority, collection, rkey))
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.authority, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
