use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, StatusCode, Url};
use std::sync::Arc;
use tracing::debug;

use crate::error::FetchError;

/// How much of a track to download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchRange {
    /// The first `n` bytes, sent as `Range: bytes=0-{n-1}`.
    Partial(u64),
    /// The whole file, no `Range` header.
    Full,
}

impl FetchRange {
    pub fn header_value(&self) -> Option<String> {
        match self {
            FetchRange::Partial(0) => None,
            FetchRange::Partial(n) => Some(format!("bytes=0-{}", n - 1)),
            FetchRange::Full => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FetchRange::Partial(_) => "partial",
            FetchRange::Full => "full",
        }
    }
}

/// Something that can hand over the raw bytes of an audio track.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn fetch(&self, track_id: &str, range: FetchRange) -> Result<Bytes, FetchError>;
}

/// Supplies the session token sent with every request.
pub trait AuthToken: Send + Sync {
    fn token(&self) -> String;
}

impl AuthToken for String {
    fn token(&self) -> String {
        self.clone()
    }
}

/// Reads audio straight from the server's static stream endpoint.
#[derive(Clone)]
pub struct EmbySource {
    client: Client,
    base_url: Url,
    auth: Arc<dyn AuthToken>,
}

impl EmbySource {
    pub fn new(client: Client, base_url: &str, auth: Arc<dyn AuthToken>) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| FetchError::Url(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FetchError::Url(base_url.to_string()));
        }
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    /// `{base}/Audio/{track_id}/stream?Static=true`
    pub fn stream_url(&self, track_id: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["Audio", track_id, "stream"]);
        url.query_pairs_mut().append_pair("Static", "true");
        Ok(url)
    }
}

#[async_trait]
impl AudioSource for EmbySource {
    async fn fetch(&self, track_id: &str, range: FetchRange) -> Result<Bytes, FetchError> {
        let url = self.stream_url(track_id)?;

        let mut request = self
            .client
            .get(url)
            .header("X-Emby-Token", self.auth.token());
        if let Some(value) = range.header_value() {
            request = request.header(header::RANGE, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        debug!(track_id, range = range.label(), bytes = body.len(), "fetched audio");
        Ok(body)
    }
}
