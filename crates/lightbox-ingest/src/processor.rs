//! Batch orchestration: allow-list filter, classification, index writes.
//!
//! Each batch is reduced to one final operation per `(record_type, uri)` key
//! in stream order before anything touches the index:
//!
//! | final op in batch          | earlier delete in batch | result  |
//! |----------------------------|-------------------------|---------|
//! | qualifying create          | any                     | create  |
//! | delete                     | any                     | delete  |
//! | non-qualifying create      | yes                     | delete  |
//! | non-qualifying create      | no                      | nothing |
//!
//! Deletes are applied regardless of the allow-list so content from an
//! identity that left a list can still be removed.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;

use lightbox_core::{AtUri, BoxedFuture, POST_COLLECTION, RecordType};

use crate::Result;
use crate::allowlist::AllowListCache;
use crate::classify::EmbedClassifier;
use crate::index::{IndexBatch, IndexWriter, NewRecord};
use crate::source::{BatchHandler, CommitEvent, RepoOp};

/// Outcome of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    pub inserted: usize,
    pub deleted: usize,
    /// Creates by identities outside the allow-list.
    pub skipped_not_allowed: usize,
    /// Creates without qualifying media (including invalid repost subjects).
    pub skipped_no_media: usize,
    /// Reposts whose subject could not be resolved.
    pub unresolved: usize,
}

/// Final state of one key after coalescing.
enum Pending {
    Post { cid: String, list_uri: String },
    Repost { subject: String, list_uri: String },
    Delete,
    Ignored,
}

struct Slot {
    record_type: RecordType,
    uri: String,
    pending: Pending,
    saw_delete: bool,
}

/// Applies commit batches to the content index.
pub struct SubscriptionProcessor {
    allow_list: Arc<AllowListCache>,
    classifier: EmbedClassifier,
    writer: IndexWriter,
}

impl SubscriptionProcessor {
    pub fn new(
        allow_list: Arc<AllowListCache>,
        classifier: EmbedClassifier,
        writer: IndexWriter,
    ) -> Self {
        Self {
            allow_list,
            classifier,
            writer,
        }
    }

    pub fn writer(&self) -> &IndexWriter {
        &self.writer
    }

    /// Process one batch. Errors come only from the index.
    pub async fn process_batch(&self, events: &[CommitEvent]) -> Result<BatchReport> {
        let snapshot = self.allow_list.get();
        let mut report = BatchReport {
            events: events.len(),
            ..Default::default()
        };

        let mut slots: Vec<Slot> = Vec::new();
        let mut by_key: HashMap<(RecordType, String), usize> = HashMap::new();

        for event in events {
            for op in &event.ops {
                let pending = match op {
                    RepoOp::Delete { .. } => Pending::Delete,
                    RepoOp::Create {
                        uri,
                        cid,
                        record_type,
                        record,
                    } => match snapshot.list_for(&event.author) {
                        None => {
                            tracing::debug!(author = %event.author, %uri, "author not allowed");
                            report.skipped_not_allowed += 1;
                            counter!("index_ops_skipped_total", "reason" => "not_allowed")
                                .increment(1);
                            Pending::Ignored
                        }
                        Some(list_uri) => self.pending_create(
                            *record_type,
                            uri,
                            cid,
                            record,
                            list_uri,
                            &mut report,
                        ),
                    },
                };

                let key = (op.record_type(), op.uri().to_string());
                let saw_delete = matches!(pending, Pending::Delete);
                match by_key.get(&key) {
                    Some(&idx) => {
                        let slot = &mut slots[idx];
                        slot.pending = pending;
                        slot.saw_delete |= saw_delete;
                    }
                    None => {
                        by_key.insert(key, slots.len());
                        slots.push(Slot {
                            record_type: op.record_type(),
                            uri: op.uri().to_string(),
                            pending,
                            saw_delete,
                        });
                    }
                }
            }
        }

        let subjects: Vec<String> = slots
            .iter()
            .filter_map(|slot| match &slot.pending {
                Pending::Repost { subject, .. } => Some(subject.clone()),
                _ => None,
            })
            .collect();
        let resolved = if subjects.is_empty() {
            HashMap::new()
        } else {
            self.classifier.resolve_subjects(&subjects).await
        };

        let mut batch = IndexBatch::default();
        for slot in slots {
            let create = match slot.pending {
                Pending::Post { cid, list_uri } => Some(NewRecord {
                    content_uri: slot.uri.clone(),
                    content_cid: cid,
                    list_uri,
                    record_type: RecordType::Post,
                    repost_uri: None,
                }),
                Pending::Repost { subject, list_uri } => match resolved.get(&subject) {
                    Some(found) if found.qualifies => Some(NewRecord {
                        content_uri: subject,
                        content_cid: found.cid.clone(),
                        list_uri,
                        record_type: RecordType::Repost,
                        repost_uri: Some(slot.uri.clone()),
                    }),
                    Some(_) => {
                        report.skipped_no_media += 1;
                        counter!("index_ops_skipped_total", "reason" => "no_media").increment(1);
                        None
                    }
                    None => {
                        report.unresolved += 1;
                        counter!("index_ops_skipped_total", "reason" => "unresolved")
                            .increment(1);
                        None
                    }
                },
                Pending::Delete => {
                    push_delete(&mut batch, slot.record_type, slot.uri);
                    continue;
                }
                Pending::Ignored => None,
            };

            match create {
                Some(record) => batch.creates.push(record),
                None if slot.saw_delete => push_delete(&mut batch, slot.record_type, slot.uri),
                None => {}
            }
        }

        let stats = self.writer.apply(&batch)?;
        report.inserted = stats.inserted;
        report.deleted = stats.deleted;

        Ok(report)
    }

    fn pending_create(
        &self,
        record_type: RecordType,
        uri: &str,
        cid: &str,
        record: &Value,
        list_uri: &str,
        report: &mut BatchReport,
    ) -> Pending {
        match record_type {
            RecordType::Post => {
                if self.classifier.classify_post(record) {
                    Pending::Post {
                        cid: cid.to_string(),
                        list_uri: list_uri.to_string(),
                    }
                } else {
                    report.skipped_no_media += 1;
                    counter!("index_ops_skipped_total", "reason" => "no_media").increment(1);
                    Pending::Ignored
                }
            }
            RecordType::Repost => match repost_subject(record) {
                Some(subject) => Pending::Repost {
                    subject,
                    list_uri: list_uri.to_string(),
                },
                None => {
                    tracing::debug!(%uri, "repost without a post subject");
                    report.skipped_no_media += 1;
                    counter!("index_ops_skipped_total", "reason" => "invalid_subject")
                        .increment(1);
                    Pending::Ignored
                }
            },
        }
    }
}

/// Subject URI of a repost record, if it names a post.
fn repost_subject(record: &Value) -> Option<String> {
    let uri = record.get("subject")?.get("uri")?.as_str()?;
    let parsed: AtUri = uri.parse().ok()?;
    (parsed.collection == POST_COLLECTION).then(|| uri.to_string())
}

fn push_delete(batch: &mut IndexBatch, record_type: RecordType, uri: String) {
    match record_type {
        RecordType::Post => batch.post_deletes.push(uri),
        RecordType::Repost => batch.repost_deletes.push(uri),
    }
}

impl BatchHandler for SubscriptionProcessor {
    fn handle_batch<'a>(&'a self, events: &'a [CommitEvent]) -> BoxedFuture<'a, Result<()>> {
        Box::pin(async move {
            let report = self.process_batch(events).await?;
            tracing::debug!(
                events = report.events,
                inserted = report.inserted,
                deleted = report.deleted,
                not_allowed = report.skipped_not_allowed,
                no_media = report.skipped_no_media,
                unresolved = report.unresolved,
                "processed batch"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::{AllowListConfig, ListPage, MemberDirectory, MemberPage};
    use crate::classify::tests::FakeLookup;
    use crate::xrpc::XrpcError;
    use lightbox_core::schema;
    use serde_json::json;

    const LIST: &str = "at://did:plc:curator/app.bsky.graph.list/photos";
    const A: &str = "did:plc:alice";
    const B: &str = "did:plc:bob";

    struct StaticDirectory(Vec<String>);

    impl MemberDirectory for StaticDirectory {
        fn list_members<'a>(
            &'a self,
            _list_uri: &'a str,
            _cursor: Option<&'a str>,
            _limit: u32,
        ) -> BoxedFuture<'a, std::result::Result<MemberPage, XrpcError>> {
            Box::pin(async move {
                Ok(MemberPage {
                    members: self.0.clone(),
                    cursor: None,
                })
            })
        }

        fn owned_lists<'a>(
            &'a self,
            _actor: &'a str,
            _cursor: Option<&'a str>,
            _limit: u32,
        ) -> BoxedFuture<'a, std::result::Result<ListPage, XrpcError>> {
            Box::pin(async move { Ok(ListPage::default()) })
        }
    }

    async fn processor(lookup: Arc<FakeLookup>) -> SubscriptionProcessor {
        let config = AllowListConfig {
            list_uris: vec![LIST.to_string()],
            ..Default::default()
        };
        let allow_list = AllowListCache::load(config, Arc::new(StaticDirectory(vec![A.to_string()])))
            .await
            .unwrap();
        let writer = IndexWriter::new(schema::shared(schema::open_in_memory().unwrap())).unwrap();
        SubscriptionProcessor::new(allow_list, EmbedClassifier::new(lookup, 10), writer)
    }

    fn image_record() -> Value {
        json!({"text": "", "embed": {"$type": "app.bsky.embed.images", "images": [{"alt": ""}]}})
    }

    fn post_uri(did: &str, rkey: &str) -> String {
        format!("at://{did}/app.bsky.feed.post/{rkey}")
    }

    fn create_post(position: i64, did: &str, rkey: &str, record: Value) -> CommitEvent {
        CommitEvent {
            position,
            author: did.to_string(),
            ops: vec![RepoOp::Create {
                uri: post_uri(did, rkey),
                cid: format!("cid-{rkey}"),
                record_type: RecordType::Post,
                record,
            }],
        }
    }

    fn delete(position: i64, did: &str, uri: String, record_type: RecordType) -> CommitEvent {
        CommitEvent {
            position,
            author: did.to_string(),
            ops: vec![RepoOp::Delete { uri, record_type }],
        }
    }

    fn create_repost(position: i64, did: &str, rkey: &str, subject: &str) -> CommitEvent {
        CommitEvent {
            position,
            author: did.to_string(),
            ops: vec![RepoOp::Create {
                uri: format!("at://{did}/app.bsky.feed.repost/{rkey}"),
                cid: format!("cid-{rkey}"),
                record_type: RecordType::Repost,
                record: json!({"subject": {"uri": subject, "cid": "x"}}),
            }],
        }
    }

    #[tokio::test]
    async fn test_only_allowed_media_posts_are_indexed() {
        let processor = processor(Arc::new(FakeLookup::default())).await;

        let report = processor
            .process_batch(&[
                create_post(1, A, "u1", image_record()),
                create_post(2, B, "u2", image_record()),
                create_post(3, A, "u3", json!({"text": "plain"})),
            ])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_not_allowed, 1);
        assert_eq!(report.skipped_no_media, 1);

        let row = processor
            .writer()
            .get(&post_uri(A, "u1"), RecordType::Post)
            .unwrap()
            .unwrap();
        assert_eq!(row.list_uri, LIST);
        assert_eq!(row.content_cid, "cid-u1");
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let processor = processor(Arc::new(FakeLookup::default())).await;
        let batch = [create_post(1, A, "u1", image_record())];

        processor.process_batch(&batch).await.unwrap();
        let first = processor
            .writer()
            .get(&post_uri(A, "u1"), RecordType::Post)
            .unwrap()
            .unwrap();

        let report = processor.process_batch(&batch).await.unwrap();
        let second = processor
            .writer()
            .get(&post_uri(A, "u1"), RecordType::Post)
            .unwrap()
            .unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(first.indexed_at, second.indexed_at);
        assert_eq!(processor.writer().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_create_in_one_batch_keeps_record() {
        let processor = processor(Arc::new(FakeLookup::default())).await;
        let uri = post_uri(A, "x");

        processor
            .process_batch(&[
                delete(1, A, uri.clone(), RecordType::Post),
                create_post(2, A, "x", image_record()),
            ])
            .await
            .unwrap();

        assert!(processor.writer().get(&uri, RecordType::Post).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_then_delete_in_one_batch_leaves_nothing() {
        let processor = processor(Arc::new(FakeLookup::default())).await;
        let uri = post_uri(A, "x");

        processor
            .process_batch(&[
                create_post(1, A, "x", image_record()),
                delete(2, A, uri.clone(), RecordType::Post),
            ])
            .await
            .unwrap();

        assert!(processor.writer().get(&uri, RecordType::Post).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_then_plain_create_removes_existing_row() {
        let processor = processor(Arc::new(FakeLookup::default())).await;
        let uri = post_uri(A, "x");
        processor
            .process_batch(&[create_post(1, A, "x", image_record())])
            .await
            .unwrap();

        processor
            .process_batch(&[
                delete(2, A, uri.clone(), RecordType::Post),
                create_post(3, A, "x", json!({"text": "edited"})),
            ])
            .await
            .unwrap();

        assert!(processor.writer().get(&uri, RecordType::Post).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletes_ignore_allow_list() {
        let processor = processor(Arc::new(FakeLookup::default())).await;
        let uri = post_uri(A, "x");
        processor
            .process_batch(&[create_post(1, A, "x", image_record())])
            .await
            .unwrap();

        // Deleted by an event whose author is not on the list
        let report = processor
            .process_batch(&[delete(2, B, uri.clone(), RecordType::Post)])
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(processor.writer().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repost_indexes_subject() {
        let lookup = Arc::new(FakeLookup::default());
        let subject = post_uri(B, "orig");
        lookup.insert(&subject, true);
        let processor = processor(lookup).await;

        let report = processor
            .process_batch(&[create_repost(1, A, "r1", &subject)])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        let row = processor
            .writer()
            .get(&subject, RecordType::Repost)
            .unwrap()
            .unwrap();
        assert_eq!(row.content_cid, "cid-orig");
        assert_eq!(
            row.repost_uri.as_deref(),
            Some("at://did:plc:alice/app.bsky.feed.repost/r1")
        );
    }

    #[tokio::test]
    async fn test_repost_subject_without_media_or_unresolved_is_dropped() {
        let lookup = Arc::new(FakeLookup::default());
        let plain = post_uri(B, "plain");
        let failing = post_uri(B, "failing");
        lookup.insert(&plain, false);
        lookup.insert(&failing, true);
        lookup.failing.lock().insert(failing.clone());
        let processor = processor(lookup.clone()).await;

        let report = processor
            .process_batch(&[
                create_repost(1, A, "r1", &plain),
                create_repost(2, A, "r2", &post_uri(B, "missing")),
            ])
            .await
            .unwrap();
        assert_eq!(report.skipped_no_media, 1);
        assert_eq!(report.unresolved, 1);

        let report = processor
            .process_batch(&[create_repost(3, A, "r3", &failing)])
            .await
            .unwrap();
        assert_eq!(report.unresolved, 1);
        assert_eq!(processor.writer().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repost_delete_removes_by_repost_uri() {
        let lookup = Arc::new(FakeLookup::default());
        let subject = post_uri(B, "orig");
        lookup.insert(&subject, true);
        let processor = processor(lookup).await;
        processor
            .process_batch(&[create_repost(1, A, "r1", &subject)])
            .await
            .unwrap();

        processor
            .process_batch(&[delete(
                2,
                A,
                "at://did:plc:alice/app.bsky.feed.repost/r1".to_string(),
                RecordType::Repost,
            )])
            .await
            .unwrap();

        assert!(processor.writer().get(&subject, RecordType::Repost).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_member_reposts_are_not_looked_up() {
        let lookup = Arc::new(FakeLookup::default());
        let processor = processor(lookup.clone()).await;

        processor
            .process_batch(&[
                create_repost(1, B, "r1", &post_uri(A, "x")),
                create_repost(2, A, "r2", "at://did:plc:bob/app.bsky.feed.like/nope"),
            ])
            .await
            .unwrap();

        assert!(lookup.calls.lock().is_empty());
    }

    #[test]
    fn test_repost_subject() {
        assert_eq!(
            repost_subject(&json!({"subject": {"uri": "at://did:plc:b/app.bsky.feed.post/1"}})),
            Some("at://did:plc:b/app.bsky.feed.post/1".to_string())
        );
        assert_eq!(repost_subject(&json!({"subject": {}})), None);
        assert_eq!(repost_subject(&json!({"subject": {"uri": "https://x"}})), None);
    }
}
