//! Route definitions.

mod feed;
mod health;
mod well_known;

use axum::Router;
use axum::http::header;
use axum::middleware;
use axum::response::Response;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /.well-known/did.json` - did:web document
/// - `GET /xrpc/app.bsky.feed.getFeedSkeleton` - Paginated feed skeleton
/// - `GET /xrpc/app.bsky.feed.describeFeedGenerator` - Published feeds
pub fn router(state: AppState) -> Router {
    let xrpc = Router::new()
        .route(
            "/app.bsky.feed.getFeedSkeleton",
            get(feed::get_feed_skeleton),
        )
        .route(
            "/app.bsky.feed.describeFeedGenerator",
            get(feed::describe_feed_generator),
        )
        .layer(middleware::map_response(add_cache_headers));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/.well-known/did.json", get(well_known::did_document))
        .nest("/xrpc", xrpc)
        .with_state(state)
}

/// Add cache headers to successful XRPC responses.
///
/// Matches the server-side skeleton cache TTL.
async fn add_cache_headers(response: Response) -> Response {
    if response.status().is_success() {
        let (mut parts, body) = response.into_parts();
        parts.headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("public, max-age=10"),
        );
        Response::from_parts(parts, body)
    } else {
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Config, FeedDefinition};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use lightbox_core::{format_indexed_at, schema};
    use rusqlite::params;
    use serde_json::Value;
    use std::path::PathBuf;
    use tower::ServiceExt;

    const LIST: &str = "at://did:plc:curator/app.bsky.graph.list/photos";
    const PHOTOS: &str = "at://did:plc:publisher/app.bsky.feed.generator/photos";

    fn config(service_did: &str) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            hostname: "feeds.example.com".to_string(),
            service_did: service_did.to_string(),
            publisher_did: "did:plc:publisher".to_string(),
            sqlite_location: PathBuf::from(":memory:"),
            feeds: vec![
                FeedDefinition {
                    shortname: "photos".to_string(),
                    list_uri: Some(LIST.to_string()),
                },
                FeedDefinition {
                    shortname: "all".to_string(),
                    list_uri: None,
                },
            ],
            metrics_port: None,
        }
    }

    fn app_with(service_did: &str, rows: usize) -> Router {
        let conn = schema::open_in_memory().unwrap();
        for i in 0..rows {
            let list = if i % 2 == 0 { LIST } else { "at://did:plc:x/app.bsky.graph.list/other" };
            conn.execute(
                "INSERT INTO indexed_content
                    (content_uri, content_cid, indexed_at, list_uri, record_type)
                 VALUES (?1, ?2, ?3, ?4, 'post')",
                params![
                    format!("at://did:plc:a/app.bsky.feed.post/{i}"),
                    format!("cid{i}"),
                    format_indexed_at(1_700_000_000_000 + i as i64).unwrap(),
                    list
                ],
            )
            .unwrap();
        }
        router(AppState::with_connection(
            config(service_did),
            schema::shared(conn),
        ))
    }

    fn app(rows: usize) -> Router {
        app_with("did:web:feeds.example.com", rows)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn skeleton_uri(feed: &str, extra: &str) -> String {
        format!("/xrpc/app.bsky.feed.getFeedSkeleton?feed={feed}{extra}")
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app(3), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["indexed"], 3);
        assert_eq!(body["feeds"], 2);
    }

    #[tokio::test]
    async fn test_skeleton_scoped_to_feed_list() {
        let (status, body) = get_json(app(6), &skeleton_uri(PHOTOS, "")).await;

        assert_eq!(status, StatusCode::OK);
        let posts: Vec<&str> = body["feed"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["post"].as_str().unwrap())
            .collect();
        assert_eq!(
            posts,
            vec![
                "at://did:plc:a/app.bsky.feed.post/4",
                "at://did:plc:a/app.bsky.feed.post/2",
                "at://did:plc:a/app.bsky.feed.post/0",
            ]
        );
        assert!(body.get("cursor").is_none());
    }

    #[tokio::test]
    async fn test_skeleton_pagination_cursor() {
        let all = "at://did:plc:publisher/app.bsky.feed.generator/all";
        let (_, first) = get_json(app(5), &skeleton_uri(all, "&limit=3")).await;
        assert_eq!(first["feed"].as_array().unwrap().len(), 3);
        let cursor = first["cursor"].as_str().unwrap().to_string();
        assert_eq!(cursor, "1700000000002");

        let (_, second) = get_json(app(5), &skeleton_uri(all, &format!("&limit=3&cursor={cursor}"))).await;
        assert_eq!(second["feed"].as_array().unwrap().len(), 2);
        assert!(second.get("cursor").is_none());
    }

    #[tokio::test]
    async fn test_skeleton_errors() {
        let (status, body) = get_json(
            app(0),
            &skeleton_uri("at://did:plc:publisher/app.bsky.feed.generator/unknown", ""),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "UnsupportedAlgorithm");

        let (status, body) = get_json(app(0), &skeleton_uri(PHOTOS, "&cursor=yesterday")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");

        let (status, body) =
            get_json(app(0), &skeleton_uri(PHOTOS, "&cursor=253402300800000")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");

        let (status, body) = get_json(app(0), &skeleton_uri(PHOTOS, "&limit=lots")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");

        let (status, body) = get_json(app(0), "/xrpc/app.bsky.feed.getFeedSkeleton").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_skeleton_sets_cache_header() {
        let response = app(1)
            .oneshot(
                Request::builder()
                    .uri(skeleton_uri(PHOTOS, ""))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=10"
        );
    }

    #[tokio::test]
    async fn test_describe_feed_generator() {
        let (status, body) =
            get_json(app(0), "/xrpc/app.bsky.feed.describeFeedGenerator").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["did"], "did:web:feeds.example.com");
        assert_eq!(body["feeds"][0]["uri"], PHOTOS);
        assert_eq!(
            body["feeds"][1]["uri"],
            "at://did:plc:publisher/app.bsky.feed.generator/all"
        );
    }

    #[tokio::test]
    async fn test_did_document() {
        let (status, body) = get_json(app(0), "/.well-known/did.json").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "did:web:feeds.example.com");
        assert_eq!(body["service"][0]["type"], "BskyFeedGenerator");
        assert_eq!(
            body["service"][0]["serviceEndpoint"],
            "https://feeds.example.com"
        );

        let (status, body) = get_json(app_with("did:plc:elsewhere", 0), "/.well-known/did.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }
}
