//! Skeleton page cache backed by moka.
//!
//! A burst of identical requests (the AppView fanning out the first page of
//! a popular feed) reaches SQLite once: concurrent misses for the same key
//! share one computation. Entries live for [`DEFAULT_TTL`], so newly indexed
//! posts show up on the first page within that window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::ApiError;
use crate::query::SkeletonPage;

/// Default cache capacity (number of pages).
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// Default TTL for cached pages.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Everything that determines the content of one page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub feed: String,
    pub limit: u32,
    pub cursor: Option<String>,
}

/// Type alias for the skeleton page cache.
pub type ResponseCache = Cache<PageKey, Arc<SkeletonPage>>;

/// Create a new cache with default settings.
pub fn new_cache() -> ResponseCache {
    Cache::builder()
        .max_capacity(DEFAULT_CACHE_CAPACITY)
        .time_to_live(DEFAULT_TTL)
        .build()
}

/// Get a cached page or compute and cache it.
///
/// Errors from `compute` are returned to every waiter and not cached.
pub async fn get_or_compute<F, Fut>(
    cache: &ResponseCache,
    key: PageKey,
    compute: F,
) -> Result<Arc<SkeletonPage>, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<SkeletonPage, ApiError>>,
{
    let mut computed = false;
    let result = cache
        .try_get_with(key.clone(), async {
            computed = true;
            compute().await.map(Arc::new)
        })
        .await;

    tracing::debug!(
        feed = %key.feed,
        cursor = key.cursor.as_deref().unwrap_or(""),
        hit = !computed,
        "skeleton cache lookup"
    );

    result.map_err(|e| (*e).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SkeletonItem;

    fn key(cursor: Option<&str>) -> PageKey {
        PageKey {
            feed: "photos".to_string(),
            limit: 50,
            cursor: cursor.map(str::to_string),
        }
    }

    fn page(post: &str) -> SkeletonPage {
        SkeletonPage {
            cursor: None,
            feed: vec![SkeletonItem {
                post: post.to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_cache_hit() {
        let cache = new_cache();

        let first = get_or_compute(&cache, key(None), || async { Ok(page("a")) })
            .await
            .unwrap();
        assert_eq!(first.feed[0].post, "a");

        let second = get_or_compute(&cache, key(None), || async {
            panic!("compute should not be called on cache hit")
        })
        .await
        .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_cursor_is_part_of_key() {
        let cache = new_cache();

        get_or_compute(&cache, key(None), || async { Ok(page("a")) })
            .await
            .unwrap();
        let next = get_or_compute(&cache, key(Some("1000")), || async { Ok(page("b")) })
            .await
            .unwrap();

        assert_eq!(next.feed[0].post, "b");
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = new_cache();

        let result = get_or_compute(&cache, key(None), || async {
            Err(ApiError::Internal("database is locked".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ApiError::Internal(_))));

        let page = get_or_compute(&cache, key(None), || async { Ok(page("a")) })
            .await
            .unwrap();
        assert_eq!(page.feed.len(), 1);
    }
}
