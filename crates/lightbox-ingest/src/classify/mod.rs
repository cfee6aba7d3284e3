//! Embed classification, including repost indirection.
//!
//! Posts are classified directly from their record. A repost only names its
//! subject, so subjects are looked up in chunks of at most
//! [`MAX_LOOKUP_BATCH`] URIs and the same predicate is applied to the
//! subject's record. Subjects that cannot be resolved are dropped, not retried.

mod lookup;

pub use lookup::{AppViewLookup, MAX_LOOKUP_BATCH, PostLookup, ResolvedPost};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;

use lightbox_core::record_has_qualifying_embed;

/// What a repost needs to know about its subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubject {
    pub cid: String,
    pub author_did: String,
    /// Whether the subject carries image media.
    pub qualifies: bool,
}

/// Decides whether records carry image media.
#[derive(Clone)]
pub struct EmbedClassifier {
    lookup: Arc<dyn PostLookup>,
    batch_size: usize,
}

impl EmbedClassifier {
    /// `batch_size` is clamped to `1..=MAX_LOOKUP_BATCH`.
    pub fn new(lookup: Arc<dyn PostLookup>, batch_size: usize) -> Self {
        Self {
            lookup,
            batch_size: batch_size.clamp(1, MAX_LOOKUP_BATCH),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Classify a post record.
    pub fn classify_post(&self, record: &Value) -> bool {
        record_has_qualifying_embed(record)
    }

    /// Resolve repost subjects.
    ///
    /// Duplicate URIs are looked up once. The returned map holds only the
    /// subjects that were found; a failed chunk leaves its URIs out without
    /// affecting other chunks.
    pub async fn resolve_subjects(&self, uris: &[String]) -> HashMap<String, ResolvedSubject> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = uris
            .iter()
            .filter(|uri| seen.insert(uri.as_str()))
            .cloned()
            .collect();

        let mut resolved = HashMap::with_capacity(unique.len());

        for chunk in unique.chunks(self.batch_size) {
            counter!("classifier_lookups_total").increment(1);

            match self.lookup.get_posts(chunk).await {
                Ok(posts) => {
                    for post in posts {
                        if !chunk.contains(&post.uri) {
                            continue;
                        }
                        let qualifies = record_has_qualifying_embed(&post.record);
                        resolved.insert(
                            post.uri,
                            ResolvedSubject {
                                cid: post.cid,
                                author_did: post.author_did,
                                qualifies,
                            },
                        );
                    }

                    for uri in chunk.iter().filter(|uri| !resolved.contains_key(*uri)) {
                        tracing::debug!(subject = %uri, "repost subject not found, dropping");
                        counter!("classifier_subjects_unresolved_total").increment(1);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        subjects = chunk.len(),
                        "repost subject lookup failed, dropping chunk"
                    );
                    counter!("classifier_subjects_unresolved_total").increment(chunk.len() as u64);
                }
            }
        }

        resolved
    }
}
