//! Long-poll notification source
//!
//! `GET /notifications?client_id=..&wait=..` blocks on the server until
//! messages arrive or `wait` seconds pass. A 204 or an empty array means
//! the wait ended quietly.

use std::time::Duration;

use anyhow::Result;
use cirrus_core::domain::ClientId;
use cirrus_core::ports::{INotificationSource, NotificationMessage, RemoteError};
use reqwest::{Method, StatusCode};
use tracing::{debug, instrument};

use crate::client::{from_reqwest, RemoteClient};

/// Extra time allowed on top of the server-side wait
const WAIT_SLACK: Duration = Duration::from_secs(10);

/// Polls the sync service for change notifications
pub struct NotificationPoller {
    client: RemoteClient,
    client_id: ClientId,
    wait: Duration,
}

impl NotificationPoller {
    /// Creates a poller that asks the server to hold each request for `wait`
    pub fn new(base_url: impl Into<String>, client_id: ClientId, wait: Duration) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(base_url, wait + WAIT_SLACK)?,
            client_id,
            wait,
        })
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }
}

#[async_trait::async_trait]
impl INotificationSource for NotificationPoller {
    #[instrument(skip(self))]
    async fn next_messages(&self) -> Result<Vec<NotificationMessage>> {
        let client_id = self.client_id.to_string();
        let wait = self.wait.as_secs().to_string();
        let response = self
            .client
            .execute("/notifications", || {
                self.client
                    .request(Method::GET, "/notifications")
                    .query(&[("client_id", client_id.as_str()), ("wait", wait.as_str())])
            })
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }

        let bytes = response.bytes().await.map_err(from_reqwest)?;
        let messages: Vec<NotificationMessage> = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Protocol(format!("Invalid notification payload: {e}")))?;

        debug!(count = messages.len(), "Notifications received");
        Ok(messages)
    }
}
