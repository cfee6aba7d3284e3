//! Post lookups used to dereference repost subjects.

use serde::Deserialize;
use serde_json::Value;

use lightbox_core::BoxedFuture;

use crate::xrpc::{XrpcClient, XrpcError};

/// Most URIs sent in one `getPosts` call.
pub const MAX_LOOKUP_BATCH: usize = 10;

/// A post returned by a lookup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResolvedPost {
    pub uri: String,
    pub cid: String,
    #[serde(rename = "author", deserialize_with = "author_did")]
    pub author_did: String,
    /// The raw post record, including its `embed`.
    pub record: Value,
}

fn author_did<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Author {
        did: String,
    }
    Author::deserialize(deserializer).map(|author| author.did)
}

/// Batched post lookup by URI.
pub trait PostLookup: Send + Sync {
    /// Fetch up to [`MAX_LOOKUP_BATCH`] posts. Missing posts are simply absent
    /// from the result.
    fn get_posts<'a>(
        &'a self,
        uris: &'a [String],
    ) -> BoxedFuture<'a, Result<Vec<ResolvedPost>, XrpcError>>;
}

#[derive(Deserialize)]
struct GetPostsResponse {
    #[serde(default)]
    posts: Vec<ResolvedPost>,
}

/// [`PostLookup`] backed by `app.bsky.feed.getPosts`.
#[derive(Debug, Clone)]
pub struct AppViewLookup {
    client: XrpcClient,
}

impl AppViewLookup {
    pub fn new(client: XrpcClient) -> Self {
        Self { client }
    }
}

impl PostLookup for AppViewLookup {
    fn get_posts<'a>(
        &'a self,
        uris: &'a [String],
    ) -> BoxedFuture<'a, Result<Vec<ResolvedPost>, XrpcError>> {
        Box::pin(async move {
            let params: Vec<(&str, &str)> = uris.iter().map(|uri| ("uris", uri.as_str())).collect();
            let response: GetPostsResponse =
                self.client.query("app.bsky.feed.getPosts", &params).await?;
            Ok(response.posts)
        })
    }
}
