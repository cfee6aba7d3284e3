//! Feed generator XRPC endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::cache::{PageKey, get_or_compute};
use crate::error::{ApiError, ApiResult};
use crate::query::{SkeletonPage, clamp_limit};
use crate::state::AppState;

/// Query parameters for `getFeedSkeleton`.
///
/// Kept as strings so malformed values produce XRPC error bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct SkeletonQuery {
    pub feed: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
}

/// `GET /xrpc/app.bsky.feed.getFeedSkeleton`
///
/// Cached for 10 seconds per feed, limit and cursor.
pub async fn get_feed_skeleton(
    State(state): State<AppState>,
    Query(params): Query<SkeletonQuery>,
) -> ApiResult<Json<SkeletonPage>> {
    let feed_uri = params
        .feed
        .ok_or_else(|| ApiError::InvalidRequest("missing required parameter: feed".to_string()))?;

    let feed = state
        .config
        .feed_for_uri(&feed_uri)
        .ok_or_else(|| ApiError::UnsupportedAlgorithm(format!("unsupported feed: {feed_uri}")))?
        .clone();

    let limit = match params.limit.as_deref() {
        Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
            ApiError::InvalidRequest(format!("limit must be an integer, got '{raw}'"))
        })?),
        None => None,
    };
    let limit = clamp_limit(limit);
    let cursor = params.cursor.filter(|c| !c.is_empty());

    counter!("feed_requests_total", "feed" => feed.shortname.clone()).increment(1);

    let key = PageKey {
        feed: feed.shortname.clone(),
        limit,
        cursor: cursor.clone(),
    };

    let page = get_or_compute(&state.cache, key, || async {
        let page = state
            .feeds
            .page(feed.list_uri.as_deref(), Some(limit), cursor.as_deref())?;
        Ok(page)
    })
    .await?;

    Ok(Json(Arc::unwrap_or_clone(page)))
}

/// Feed entry in `describeFeedGenerator` output.
#[derive(Debug, Clone, Serialize)]
pub struct DescribedFeed {
    pub uri: String,
}

/// `describeFeedGenerator` response body.
#[derive(Debug, Clone, Serialize)]
pub struct DescribeResponse {
    pub did: String,
    pub feeds: Vec<DescribedFeed>,
}

/// `GET /xrpc/app.bsky.feed.describeFeedGenerator`
pub async fn describe_feed_generator(State(state): State<AppState>) -> Json<DescribeResponse> {
    let config = &state.config;
    Json(DescribeResponse {
        did: config.service_did.clone(),
        feeds: config
            .feeds
            .iter()
            .map(|feed| DescribedFeed {
                uri: feed.uri(&config.publisher_did),
            })
            .collect(),
    })
}
