//! Idempotent maintenance of the `indexed_content` table.
//!
//! Rows are keyed by `(content_uri, record_type)`. Inserting an existing key
//! is a no-op, so replaying a batch leaves the first-seen `indexed_at` in
//! place. Deleting rows that do not exist is also a no-op.

use std::sync::atomic::{AtomicI64, Ordering};

use metrics::counter;
use rusqlite::{OptionalExtension, Transaction, params};

use lightbox_core::time::{format_indexed_at, now_millis, parse_indexed_at};
use lightbox_core::{IndexedRecord, RecordType, SharedConnection};

use crate::Result;

/// A row to insert; `indexed_at` is assigned by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub content_uri: String,
    pub content_cid: String,
    pub list_uri: String,
    pub record_type: RecordType,
    pub repost_uri: Option<String>,
}

/// Writes and deletes produced by one micro-batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBatch {
    /// Post URIs whose `post` rows should go.
    pub post_deletes: Vec<String>,
    /// Repost URIs whose `repost` rows should go.
    pub repost_deletes: Vec<String>,
    pub creates: Vec<NewRecord>,
}

impl IndexBatch {
    pub fn is_empty(&self) -> bool {
        self.post_deletes.is_empty() && self.repost_deletes.is_empty() && self.creates.is_empty()
    }
}

/// Rows touched by [`IndexWriter::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub inserted: usize,
    pub deleted: usize,
}

/// Strictly increasing millisecond clock for `indexed_at`.
///
/// Two values handed out by the same clock never collide, which keeps the
/// millisecond feed cursor from skipping rows that share a timestamp.
#[derive(Debug, Default)]
pub struct IndexClock {
    last: AtomicI64,
}

impl IndexClock {
    /// Start after `floor` (typically the newest stored `indexed_at`).
    pub fn starting_after(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    /// Next timestamp: wall-clock now, or one past the previous value.
    pub fn next(&self) -> i64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }
}

/// Writer for the content index.
pub struct IndexWriter {
    conn: SharedConnection,
    clock: IndexClock,
}

impl IndexWriter {
    /// Create a writer whose clock resumes after the newest stored row.
    pub fn new(conn: SharedConnection) -> Result<Self> {
        let newest: Option<String> = conn.lock().query_row(
            "SELECT MAX(indexed_at) FROM indexed_content",
            [],
            |row| row.get(0),
        )?;

        let floor = match newest {
            Some(indexed_at) => parse_indexed_at(&indexed_at)?,
            None => 0,
        };

        Ok(Self {
            conn,
            clock: IndexClock::starting_after(floor),
        })
    }

    /// Insert records, ignoring keys that already exist.
    ///
    /// Returns the number of rows actually inserted.
    pub fn upsert(&self, records: &[NewRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = self.insert_all(&tx, records)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Delete rows of `record_type` matching `uris`.
    ///
    /// Post rows match on `content_uri`; repost rows match on `repost_uri`,
    /// since a repost delete names the repost, not its subject.
    pub fn delete_by_uris(&self, uris: &[String], record_type: RecordType) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = delete_all(&tx, uris, record_type)?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn delete_posts(&self, uris: &[String]) -> Result<usize> {
        self.delete_by_uris(uris, RecordType::Post)
    }

    /// Delete repost rows by the reposts' own URIs.
    ///
    /// A repost row is keyed by its subject, so only the first member repost
    /// of a post is stored. Deleting that repost removes the subject from
    /// the feed even while later reposts of it by other members still exist.
    pub fn delete_reposts(&self, repost_uris: &[String]) -> Result<usize> {
        self.delete_by_uris(repost_uris, RecordType::Repost)
    }

    /// Apply a batch in one transaction: deletes first, then creates.
    pub fn apply(&self, batch: &IndexBatch) -> Result<ApplyStats> {
        if batch.is_empty() {
            return Ok(ApplyStats::default());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let deleted = delete_all(&tx, &batch.post_deletes, RecordType::Post)?
            + delete_all(&tx, &batch.repost_deletes, RecordType::Repost)?;
        let inserted = self.insert_all(&tx, &batch.creates)?;

        tx.commit()?;
        Ok(ApplyStats { inserted, deleted })
    }

    /// Look up one row by its unique key.
    pub fn get(&self, content_uri: &str, record_type: RecordType) -> Result<Option<IndexedRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM indexed_content WHERE content_uri = ? AND record_type = ?",
            IndexedRecord::COLUMNS
        );
        let record = conn
            .query_row(
                &sql,
                params![content_uri, record_type.as_str()],
                IndexedRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Total rows in the index.
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM indexed_content", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn insert_all(&self, tx: &Transaction<'_>, records: &[NewRecord]) -> Result<usize> {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO indexed_content
                (content_uri, content_cid, indexed_at, list_uri, record_type, repost_uri)
             VALUES (?, ?, ?, ?, ?, ?)",
        )?;

        let mut inserted = 0usize;
        for record in records {
            let indexed_at = format_indexed_at(self.clock.next())?;
            let changed = stmt.execute(params![
                record.content_uri,
                record.content_cid,
                indexed_at,
                record.list_uri,
                record.record_type.as_str(),
                record.repost_uri,
            ])?;

            if changed > 0 {
                inserted += changed;
                counter!("index_records_inserted_total", "type" => record.record_type.as_str())
                    .increment(1);
            }
        }

        Ok(inserted)
    }
}

fn delete_all(tx: &Transaction<'_>, uris: &[String], record_type: RecordType) -> Result<usize> {
    if uris.is_empty() {
        return Ok(0);
    }

    let sql = match record_type {
        RecordType::Post => {
            "DELETE FROM indexed_content WHERE record_type = 'post' AND content_uri = ?"
        }
        RecordType::Repost => {
            "DELETE FROM indexed_content WHERE record_type = 'repost' AND repost_uri = ?"
        }
    };
    let mut stmt = tx.prepare_cached(sql)?;

    let mut deleted = 0usize;
    for uri in uris {
        deleted += stmt.execute([uri])?;
    }

    if deleted > 0 {
        counter!("index_records_deleted_total", "type" => record_type.as_str())
            .increment(deleted as u64);
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightbox_core::schema;

    const LIST: &str = "at://did:plc:owner/app.bsky.graph.list/1";

    fn writer() -> IndexWriter {
        IndexWriter::new(schema::shared(schema::open_in_memory().unwrap())).unwrap()
    }

    fn post(uri: &str) -> NewRecord {
        NewRecord {
            content_uri: uri.to_string(),
            content_cid: format!("cid:{uri}"),
            list_uri: LIST.to_string(),
            record_type: RecordType::Post,
            repost_uri: None,
        }
    }

    fn repost(subject: &str, repost_uri: &str) -> NewRecord {
        NewRecord {
            content_uri: subject.to_string(),
            content_cid: format!("cid:{subject}"),
            list_uri: LIST.to_string(),
            record_type: RecordType::Repost,
            repost_uri: Some(repost_uri.to_string()),
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";

        assert_eq!(writer.upsert(&[post(x)]).unwrap(), 1);
        let first = writer.get(x, RecordType::Post).unwrap().unwrap();

        assert_eq!(writer.upsert(&[post(x)]).unwrap(), 0);
        let second = writer.get(x, RecordType::Post).unwrap().unwrap();

        assert_eq!(writer.count().unwrap(), 1);
        assert_eq!(first.indexed_at, second.indexed_at);
    }

    #[test]
    fn test_post_and_repost_of_same_content_coexist() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";

        let inserted = writer
            .upsert(&[post(x), repost(x, "at://did:plc:b/app.bsky.feed.repost/r")])
            .unwrap();

        assert_eq!(inserted, 2);
        assert!(writer.get(x, RecordType::Repost).unwrap().is_some());
    }

    #[test]
    fn test_delete_posts_scoped_to_type() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";
        let r = "at://did:plc:b/app.bsky.feed.repost/r";
        writer.upsert(&[post(x), repost(x, r)]).unwrap();

        assert_eq!(writer.delete_posts(&[x.to_string()]).unwrap(), 1);

        assert!(writer.get(x, RecordType::Post).unwrap().is_none());
        assert!(writer.get(x, RecordType::Repost).unwrap().is_some());
    }

    #[test]
    fn test_only_first_repost_of_subject_is_kept() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";
        let first = "at://did:plc:b/app.bsky.feed.repost/r1";
        let second = "at://did:plc:c/app.bsky.feed.repost/r2";

        assert_eq!(writer.upsert(&[repost(x, first)]).unwrap(), 1);
        assert_eq!(writer.upsert(&[repost(x, second)]).unwrap(), 0);

        // The later repost has no row of its own
        assert_eq!(writer.delete_reposts(&[second.to_string()]).unwrap(), 0);
        assert!(writer.get(x, RecordType::Repost).unwrap().is_some());

        assert_eq!(writer.delete_reposts(&[first.to_string()]).unwrap(), 1);
        assert!(writer.get(x, RecordType::Repost).unwrap().is_none());
    }

    #[test]
    fn test_delete_reposts_matches_repost_uri() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";
        let r = "at://did:plc:b/app.bsky.feed.repost/r";
        writer.upsert(&[repost(x, r)]).unwrap();

        // The subject URI does not identify the repost row
        assert_eq!(writer.delete_reposts(&[x.to_string()]).unwrap(), 0);
        assert_eq!(writer.delete_reposts(&[r.to_string()]).unwrap(), 1);
        assert_eq!(writer.count().unwrap(), 0);
    }

    #[test]
    fn test_delete_absent_is_noop() {
        let writer = writer();
        assert_eq!(
            writer
                .delete_posts(&["at://did:plc:a/app.bsky.feed.post/missing".to_string()])
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_apply_deletes_before_creates() {
        let writer = writer();
        let x = "at://did:plc:a/app.bsky.feed.post/x";
        let y = "at://did:plc:a/app.bsky.feed.post/y";
        writer.upsert(&[post(x)]).unwrap();

        let stats = writer
            .apply(&IndexBatch {
                post_deletes: vec![x.to_string()],
                repost_deletes: vec![],
                creates: vec![post(x), post(y)],
            })
            .unwrap();

        assert_eq!(stats, ApplyStats { inserted: 2, deleted: 1 });
        assert!(writer.get(x, RecordType::Post).unwrap().is_some());
    }

    #[test]
    fn test_indexed_at_strictly_increasing() {
        let writer = writer();
        let records: Vec<NewRecord> = (0..50)
            .map(|n| post(&format!("at://did:plc:a/app.bsky.feed.post/{n}")))
            .collect();
        writer.upsert(&records).unwrap();

        let conn = writer.conn.lock();
        let stamps: Vec<String> = conn
            .prepare("SELECT indexed_at FROM indexed_content ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_clock_resumes_after_stored_rows() {
        let conn = schema::shared(schema::open_in_memory().unwrap());
        conn.lock()
            .execute(
                "INSERT INTO indexed_content
                    (content_uri, content_cid, indexed_at, list_uri, record_type)
                 VALUES ('at://a/app.bsky.feed.post/1', 'c', '9999-01-01T00:00:00.000Z', 'l', 'post')",
                [],
            )
            .unwrap();

        let writer = IndexWriter::new(conn).unwrap();
        writer
            .upsert(&[post("at://did:plc:a/app.bsky.feed.post/2")])
            .unwrap();

        let record = writer
            .get("at://did:plc:a/app.bsky.feed.post/2", RecordType::Post)
            .unwrap()
            .unwrap();
        assert_eq!(record.indexed_at, "9999-01-01T00:00:00.001Z");
    }

    #[test]
    fn test_clock_never_repeats() {
        let clock = IndexClock::default();
        let a = clock.next();
        let b = clock.next();
        let c = clock.next();
        assert!(a < b && b < c);
    }
}
