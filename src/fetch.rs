//! Remote fetching
//!
//! `ssconf://` access keys point at a document that has to be downloaded
//! before a descriptor exists. The parser only depends on the
//! [`RemoteFetcher`] capability; [`HttpFetcher`] is the production
//! implementation on top of reqwest.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;

use crate::config::FetcherConfig;
use crate::error::FetchError;

/// HTTP GET returning the raw response body.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl<T: RemoteFetcher + ?Sized> RemoteFetcher for Arc<T> {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        (**self).fetch(url).await
    }
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        log::debug!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, self.config.user_agent.as_str())
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            log::warn!("Too many requests: {}", status.as_u16());
            return Err(FetchError::Throttled);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if self.config.require_json_content_type {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !is_json_media_type(&content_type) {
                return Err(FetchError::ContentType(content_type));
            }
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))
    }
}

/// `application/json`, ignoring parameters and case.
fn is_json_media_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}
