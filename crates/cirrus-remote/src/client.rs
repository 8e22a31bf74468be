//! Sync service HTTP client
//!
//! Speaks the push/pull protocol as JSON over HTTP and implements
//! [`IRemoteService`]. Every failure is returned as a [`RemoteError`]
//! wrapped in `anyhow`, so the engine can downcast and classify it.
//!
//! ## Endpoints
//!
//! | Operation      | Request                    | Success                  |
//! |----------------|----------------------------|--------------------------|
//! | Sync_To        | `POST /sync/to`            | 200 + `PushResponse`     |
//! | Sync_From      | `POST /sync/from`          | 200 + `PullResponse`     |
//! | Metadata query | `POST /metadata`           | 200 + metadata, 204 none |
//! | Content        | `GET /content/{key}`       | 200 + raw bytes          |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cirrus_remote::RemoteClient;
//!
//! # fn example() -> anyhow::Result<()> {
//! let client = RemoteClient::new("https://sync.example.com/api", Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use cirrus_core::domain::{FileMetadata, StorageKey};
use cirrus_core::ports::{
    IRemoteService, MetadataQuery, PullRequest, PullResponse, PushRequest, PushResponse,
    RemoteError,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, instrument, warn};

/// Wait used when a 429 response carries no usable `Retry-After`
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Longest `Retry-After` the client sleeps through itself
///
/// Longer waits are reported as `Unavailable` and left to the engine's
/// backoff.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Default number of in-place retries for 429 responses
const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 3;

/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// RemoteClient
// ============================================================================

/// HTTP client for the sync service
pub struct RemoteClient {
    /// The underlying HTTP client
    client: Client,
    /// Base URL without a trailing slash
    base_url: String,
    /// In-place retries for 429 responses
    max_throttle_retries: u32,
}

impl RemoteClient {
    /// Creates a client whose requests time out after `timeout`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, base_url))
    }

    /// Wraps an existing `reqwest::Client`
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            max_throttle_retries: DEFAULT_MAX_THROTTLE_RETRIES,
        }
    }

    /// Sets how many 429 responses are retried in place
    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a reference to the underlying reqwest Client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Creates a request builder for `path` relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url)
    }

    /// Sends a request, retrying 429 responses that ask for a short wait
    ///
    /// `build` is called once per attempt. Returns the response only for
    /// success statuses; everything else is mapped to a [`RemoteError`].
    pub(crate) async fn execute<F>(&self, endpoint: &str, build: F) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let response = build().send().await.map_err(from_reqwest)?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_throttle_retries {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| parse_retry_after(v, DEFAULT_RETRY_AFTER))
                    .unwrap_or(DEFAULT_RETRY_AFTER);

                if retry_after <= MAX_RETRY_AFTER {
                    info!(
                        endpoint,
                        attempt,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Received 429, backing off"
                    );
                    tokio::time::sleep(retry_after).await;
                    attempt += 1;
                    continue;
                }
                warn!(endpoint, retry_after_secs = retry_after.as_secs(), "Server asked for a long pause");
            }

            if status.is_success() {
                if attempt > 0 {
                    info!(endpoint, attempt, "Request succeeded after retry");
                }
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let error = status_error(status, body);
            debug!(endpoint, status = status.as_u16(), error = %error, "Request failed");
            return Err(error);
        }
    }

    /// POSTs `body` as JSON and decodes the reply; `None` on 204
    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<Option<T>, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .execute(path, || self.request(Method::POST, path).json(body))
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let bytes = response.bytes().await.map_err(from_reqwest)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RemoteError::Protocol(format!("Invalid {path} response: {e}")))
    }
}

#[async_trait::async_trait]
impl IRemoteService for RemoteClient {
    #[instrument(skip(self, request), fields(events = request.events.len()))]
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let response: PushResponse = self
            .post_json("/sync/to", request)
            .await?
            .ok_or_else(|| RemoteError::Protocol("Empty Sync_To response".into()))?;

        debug!(
            sync_id = %response.sync_id,
            events = response.events.len(),
            rejected = response.rejected.len(),
            partial = response.partial,
            "Sync_To complete"
        );
        Ok(response)
    }

    #[instrument(skip(self, request), fields(last_sync_id = ?request.last_sync_id))]
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        let response: PullResponse = self
            .post_json("/sync/from", request)
            .await?
            .ok_or_else(|| RemoteError::Protocol("Empty Sync_From response".into()))?;

        debug!(
            sync_id = %response.sync_id,
            events = response.events.len(),
            partial = response.partial,
            "Sync_From complete"
        );
        Ok(response)
    }

    #[instrument(skip(self, query), fields(path = %query.path))]
    async fn query_metadata(&self, query: &MetadataQuery) -> Result<Option<FileMetadata>> {
        Ok(self.post_json("/metadata", query).await?)
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn fetch_content(&self, key: &StorageKey) -> Result<Vec<u8>> {
        let path = format!("/content/{}", key.as_str());
        let response = self
            .execute(&path, || self.request(Method::GET, &path))
            .await?;
        let bytes = response.bytes().await.map_err(from_reqwest)?;

        debug!(bytes = bytes.len(), "Downloaded content");
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// Error mapping
// ============================================================================

/// Maps a transport failure
pub(crate) fn from_reqwest(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout(error.to_string())
    } else if error.is_decode() {
        RemoteError::Protocol(error.to_string())
    } else {
        RemoteError::Network(error.to_string())
    }
}

/// Maps a non-success HTTP status
pub(crate) fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("no reason").to_string()
    } else {
        truncate(body)
    };
    let code = status.as_u16();

    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable {
            status: code,
            message,
        },
        s if s.is_server_error() => RemoteError::Unavailable {
            status: code,
            message,
        },
        StatusCode::NOT_FOUND => RemoteError::NotFound(message),
        s if s.is_client_error() => RemoteError::Rejected {
            status: code,
            message,
        },
        _ => RemoteError::Protocol(format!("Unexpected status {code}: {message}")),
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}

/// Parses a `Retry-After` value: delay-seconds or an HTTP date
///
/// Falls back to `default` for anything unparseable or in the past.
pub fn parse_retry_after(value: &str, default: Duration) -> Duration {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value.trim()) {
        let wait = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(wait) = wait.to_std() {
            return wait;
        }
    }

    warn!(value, "Could not parse Retry-After header, using default");
    default
}
