//! Notification source port (driven/secondary port)
//!
//! Server push messages telling the client that remote changes are
//! waiting. Messages only wake the sync worker; they carry no ordering
//! information.

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::ClientId;

/// A push notification from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Free-form body
    #[serde(default)]
    pub body: String,
    /// Client whose change caused the notification
    #[serde(default)]
    pub author: Option<ClientId>,
}

impl NotificationMessage {
    /// Returns true if this client caused the notification
    pub fn is_self_echo(&self, client: &ClientId) -> bool {
        self.author.as_ref() == Some(client)
    }
}

/// Port trait for receiving server notifications
#[async_trait::async_trait]
pub trait INotificationSource: Send + Sync {
    /// Waits for the next batch of messages
    ///
    /// Returns an empty vector when the wait ended without messages.
    async fn next_messages(&self) -> anyhow::Result<Vec<NotificationMessage>>;
}
