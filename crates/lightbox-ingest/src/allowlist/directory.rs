//! List membership lookups.
//!
//! [`MemberDirectory`] is the seam the allow-list cache talks through;
//! [`BskyDirectory`] implements it with `app.bsky.graph.getList` and
//! `app.bsky.graph.getLists` against an AppView.

use serde::Deserialize;

use lightbox_core::BoxedFuture;

use crate::xrpc::{XrpcClient, XrpcError};

/// Upper bound the AppView accepts for `limit` on graph queries.
pub const MAX_PAGE_SIZE: u32 = 100;

/// One page of list members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPage {
    /// Member DIDs in page order.
    pub members: Vec<String>,
    /// Continuation cursor; `None` on the last page.
    pub cursor: Option<String>,
}

/// One page of lists owned by an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// List URIs in page order.
    pub lists: Vec<String>,
    pub cursor: Option<String>,
}

/// Source of list membership.
pub trait MemberDirectory: Send + Sync {
    /// Fetch one page of members of `list_uri`.
    fn list_members<'a>(
        &'a self,
        list_uri: &'a str,
        cursor: Option<&'a str>,
        limit: u32,
    ) -> BoxedFuture<'a, Result<MemberPage, XrpcError>>;

    /// Fetch one page of lists created by `actor`.
    fn owned_lists<'a>(
        &'a self,
        actor: &'a str,
        cursor: Option<&'a str>,
        limit: u32,
    ) -> BoxedFuture<'a, Result<ListPage, XrpcError>>;
}

#[derive(Deserialize)]
struct GetListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListItem {
    subject: ListSubject,
}

#[derive(Deserialize)]
struct ListSubject {
    did: String,
}

#[derive(Deserialize)]
struct GetListsResponse {
    #[serde(default)]
    lists: Vec<ListView>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct ListView {
    uri: String,
}

/// [`MemberDirectory`] backed by public AppView graph queries.
#[derive(Debug, Clone)]
pub struct BskyDirectory {
    client: XrpcClient,
}

impl BskyDirectory {
    pub fn new(client: XrpcClient) -> Self {
        Self { client }
    }
}

impl MemberDirectory for BskyDirectory {
    fn list_members<'a>(
        &'a self,
        list_uri: &'a str,
        cursor: Option<&'a str>,
        limit: u32,
    ) -> BoxedFuture<'a, Result<MemberPage, XrpcError>> {
        Box::pin(async move {
            let limit = limit.clamp(1, MAX_PAGE_SIZE).to_string();
            let mut params = vec![("list", list_uri), ("limit", limit.as_str())];
            if let Some(cursor) = cursor {
                params.push(("cursor", cursor));
            }

            let response: GetListResponse =
                self.client.query("app.bsky.graph.getList", &params).await?;

            Ok(MemberPage {
                members: response
                    .items
                    .into_iter()
                    .map(|item| item.subject.did)
                    .collect(),
                cursor: response.cursor.filter(|c| !c.is_empty()),
            })
        })
    }

    fn owned_lists<'a>(
        &'a self,
        actor: &'a str,
        cursor: Option<&'a str>,
        limit: u32,
    ) -> BoxedFuture<'a, Result<ListPage, XrpcError>> {
        Box::pin(async move {
            let limit = limit.clamp(1, MAX_PAGE_SIZE).to_string();
            let mut params = vec![("actor", actor), ("limit", limit.as_str())];
            if let Some(cursor) = cursor {
                params.push(("cursor", cursor));
            }

            let response: GetListsResponse =
                self.client.query("app.bsky.graph.getLists", &params).await?;

            Ok(ListPage {
                lists: response.lists.into_iter().map(|list| list.uri).collect(),
                cursor: response.cursor.filter(|c| !c.is_empty()),
            })
        })
    }
}
