//! `did:web` document.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub service_endpoint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<&'static str>,
    pub id: String,
    pub service: Vec<DidService>,
}

/// `GET /.well-known/did.json`
///
/// Only served when the service DID is the `did:web` of our hostname.
pub async fn did_document(State(state): State<AppState>) -> Result<Json<DidDocument>, ApiError> {
    let config = &state.config;
    let expected = format!("did:web:{}", config.hostname);
    if config.service_did != expected {
        return Err(ApiError::NotFound(
            "service DID is not a did:web of this host".to_string(),
        ));
    }

    Ok(Json(DidDocument {
        context: vec!["https://www.w3.org/ns/did/v1"],
        id: config.service_did.clone(),
        service: vec![DidService {
            id: "#bsky_fg",
            kind: "BskyFeedGenerator",
            service_endpoint: format!("https://{}", config.hostname),
        }],
    }))
}
