//! Cursor-paginated reads over `indexed_content`.
//!
//! Pages are ordered newest first by `(indexed_at, content_cid)`. The cursor
//! is the last returned row's `indexed_at` in epoch milliseconds; the next
//! page starts strictly below it. The ingest writer never hands out the same
//! millisecond twice, so no row is skipped at a page boundary.

use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use lightbox_core::{Result, SharedConnection, decode_cursor, encode_cursor};

/// Page size when the request names none.
pub const DEFAULT_LIMIT: u32 = 50;

/// Largest page a request may ask for.
pub const MAX_LIMIT: u32 = 100;

/// One entry of a skeleton feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonItem {
    /// URI of the post to show.
    pub post: String,
}

/// A page of `app.bsky.feed.getFeedSkeleton` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonPage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub feed: Vec<SkeletonItem>,
}

/// Clamp a requested page size to `1..=MAX_LIMIT`.
pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Read path over the content index.
pub struct FeedQueryService {
    conn: SharedConnection,
}

impl FeedQueryService {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Number of rows in the index.
    pub fn indexed_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM indexed_content", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch one page, optionally scoped to `list_uri`.
    ///
    /// A cursor that is not a non-negative integer is
    /// [`lightbox_core::Error::InvalidCursor`].
    pub fn page(
        &self,
        list_uri: Option<&str>,
        limit: Option<u32>,
        cursor: Option<&str>,
    ) -> Result<SkeletonPage> {
        let limit = clamp_limit(limit);
        let before = cursor.map(decode_cursor).transpose()?;
        // One extra row tells whether another page exists
        let fetch = i64::from(limit) + 1;

        let mut sql = String::from("SELECT content_uri, indexed_at FROM indexed_content");
        let mut clauses: Vec<&str> = Vec::new();
        let mut params: Vec<&dyn ToSql> = Vec::new();

        if let Some(list_uri) = &list_uri {
            clauses.push("list_uri = ?");
            params.push(list_uri);
        }
        if let Some(before) = &before {
            clauses.push("indexed_at < ?");
            params.push(before);
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY indexed_at DESC, content_cid DESC LIMIT ?");
        params.push(&fetch);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows: Vec<(String, String)> = stmt
            .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);

        let cursor = match (has_more, rows.last()) {
            (true, Some((_, indexed_at))) => Some(encode_cursor(indexed_at)?),
            _ => None,
        };

        Ok(SkeletonPage {
            cursor,
            feed: rows
                .into_iter()
                .map(|(post, _)| SkeletonItem { post })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightbox_core::format_indexed_at;
    use lightbox_core::schema;
    use rusqlite::params;

    const LIST_A: &str = "at://did:plc:c/app.bsky.graph.list/a";
    const LIST_B: &str = "at://did:plc:c/app.bsky.graph.list/b";

    fn service(rows: &[(&str, i64, &str)]) -> FeedQueryService {
        let conn = schema::open_in_memory().unwrap();
        for (i, (rkey, millis, list)) in rows.iter().enumerate() {
            conn.execute(
                "INSERT INTO indexed_content
                    (content_uri, content_cid, indexed_at, list_uri, record_type)
                 VALUES (?1, ?2, ?3, ?4, 'post')",
                params![
                    format!("at://did:plc:a/app.bsky.feed.post/{rkey}"),
                    format!("cid{i}"),
                    format_indexed_at(*millis).unwrap(),
                    list
                ],
            )
            .unwrap();
        }
        FeedQueryService::new(schema::shared(conn))
    }

    fn rkeys(page: &SkeletonPage) -> Vec<&str> {
        page.feed
            .iter()
            .map(|item| item.post.rsplit('/').next().unwrap())
            .collect()
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1000)), 100);
        assert_eq!(clamp_limit(Some(20)), 20);
    }

    #[test]
    fn test_empty_index() {
        let svc = service(&[]);
        assert_eq!(svc.page(None, None, None).unwrap(), SkeletonPage::default());
        assert_eq!(svc.indexed_count().unwrap(), 0);
    }

    #[test]
    fn test_newest_first_and_cursor_only_when_more() {
        let svc = service(&[("a", 1000, LIST_A), ("b", 2000, LIST_A), ("c", 3000, LIST_A)]);

        let first = svc.page(None, Some(2), None).unwrap();
        assert_eq!(rkeys(&first), vec!["c", "b"]);
        assert_eq!(first.cursor.as_deref(), Some("2000"));

        let last = svc.page(None, Some(2), first.cursor.as_deref()).unwrap();
        assert_eq!(rkeys(&last), vec!["a"]);
        assert_eq!(last.cursor, None);
    }

    #[test]
    fn test_exact_page_boundary_has_no_cursor() {
        let svc = service(&[("a", 1000, LIST_A), ("b", 2000, LIST_A)]);
        let page = svc.page(None, Some(2), None).unwrap();
        assert_eq!(page.feed.len(), 2);
        assert_eq!(page.cursor, None);
    }

    #[test]
    fn test_pagination_visits_every_row_once() {
        let rows: Vec<(String, i64)> = (0..37)
            .map(|i| (format!("p{i}"), 1_700_000_000_000 + i * 7))
            .collect();
        let refs: Vec<(&str, i64, &str)> =
            rows.iter().map(|(k, m)| (k.as_str(), *m, LIST_A)).collect();
        let svc = service(&refs);

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        loop {
            let page = svc.page(None, Some(5), cursor.as_deref()).unwrap();
            seen.extend(page.feed.iter().map(|item| item.post.clone()));
            pages += 1;
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(pages, 8);
        let expected: Vec<String> = (0..37)
            .rev()
            .map(|i| format!("at://did:plc:a/app.bsky.feed.post/p{i}"))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_same_instant_ordered_by_cid_descending() {
        let conn = schema::open_in_memory().unwrap();
        for (rkey, cid) in [("a", "c1"), ("b", "c3"), ("c", "c2")] {
            conn.execute(
                "INSERT INTO indexed_content
                    (content_uri, content_cid, indexed_at, list_uri, record_type)
                 VALUES (?1, ?2, '2024-05-01T12:00:00.000Z', ?3, 'post')",
                params![format!("at://did:plc:a/app.bsky.feed.post/{rkey}"), cid, LIST_A],
            )
            .unwrap();
        }
        let svc = FeedQueryService::new(schema::shared(conn));

        let page = svc.page(Some(LIST_A), None, None).unwrap();
        assert_eq!(rkeys(&page), vec!["b", "c", "a"]);
        assert_eq!(page.cursor, None);
    }

    #[test]
    fn test_scoped_to_list() {
        let svc = service(&[("a", 1000, LIST_A), ("b", 2000, LIST_B), ("c", 3000, LIST_A)]);

        assert_eq!(rkeys(&svc.page(Some(LIST_A), None, None).unwrap()), vec!["c", "a"]);
        assert_eq!(rkeys(&svc.page(Some(LIST_B), None, None).unwrap()), vec!["b"]);
        assert_eq!(svc.page(None, None, None).unwrap().feed.len(), 3);
    }

    #[test]
    fn test_invalid_cursor() {
        let svc = service(&[]);
        for cursor in ["abc", "-5", "", "1.5", "253402300800000"] {
            assert!(matches!(
                svc.page(None, None, Some(cursor)),
                Err(lightbox_core::Error::InvalidCursor(_))
            ));
        }
    }

    #[test]
    fn test_page_serialization_omits_missing_cursor() {
        let page = SkeletonPage {
            cursor: None,
            feed: vec![SkeletonItem {
                post: "at://x/app.bsky.feed.post/1".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_string(&page).unwrap(),
            r#"{"feed":[{"post":"at://x/app.bsky.feed.post/1"}]}"#
        );
    }
}
