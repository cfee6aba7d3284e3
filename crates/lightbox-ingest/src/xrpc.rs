//! Minimal XRPC query client over `reqwest`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{Error, Result};

/// Default AppView serving public graph and feed queries.
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";

/// Failure of a single XRPC call.
#[derive(Debug, thiserror::Error)]
pub enum XrpcError {
    /// HTTP 429 from upstream.
    #[error("{method} rate limited")]
    RateLimited { method: &'static str },

    /// Any other non-success status.
    #[error("{method} returned status {status}: {message}")]
    Status {
        method: &'static str,
        status: u16,
        message: String,
    },

    /// Connection, TLS or timeout failure.
    #[error("{method} transport error: {message}")]
    Transport {
        method: &'static str,
        message: String,
    },

    /// Response body did not match the expected shape.
    #[error("{method} response decode error: {message}")]
    Decode {
        method: &'static str,
        message: String,
    },
}

impl XrpcError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Client for unauthenticated XRPC queries against one service.
#[derive(Debug, Clone)]
pub struct XrpcClient {
    http: reqwest::Client,
    base_url: Url,
}

impl XrpcClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid XRPC base URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lightbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url })
    }

    /// Full endpoint URL of an XRPC method.
    pub fn endpoint(&self, method: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}xrpc/{}", self.base_url.path(), method);
        url.set_path(&path);
        url
    }

    /// Issue a GET query and decode the JSON body.
    ///
    /// Repeated keys in `params` become repeated query parameters.
    pub async fn query<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &[(&str, &str)],
    ) -> std::result::Result<T, XrpcError> {
        let response = self
            .http
            .get(self.endpoint(method))
            .header("accept", "application/json")
            .query(params)
            .send()
            .await
            .map_err(|e| XrpcError::Transport {
                method,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| XrpcError::Decode {
                method,
                message: e.to_string(),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(XrpcError::RateLimited { method });
        }

        let message = response.text().await.unwrap_or_default();
        Err(XrpcError::Status {
            method,
            status: status.as_u16(),
            message,
        })
    }
}
