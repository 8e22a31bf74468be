//! Server push listener
//!
//! Waits on an [`INotificationSource`] and wakes the sync worker when the
//! server reports changes made elsewhere. Messages authored by this client
//! are self-echoes and ignored. Failures back off with the retry policy
//! instead of spinning.

use std::sync::Arc;

use cirrus_core::domain::ClientId;
use cirrus_core::ports::{INotificationSource, NotificationMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::worker::SyncTrigger;

pub struct NotificationListener {
    source: Arc<dyn INotificationSource>,
    client_id: ClientId,
    trigger: SyncTrigger,
    backoff: Backoff,
}

impl NotificationListener {
    pub fn new(
        source: Arc<dyn INotificationSource>,
        client_id: ClientId,
        trigger: SyncTrigger,
        backoff: Backoff,
    ) -> Self {
        Self {
            source,
            client_id,
            trigger,
            backoff,
        }
    }

    /// Listens until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Notification listener starting");
        let mut failures: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.source.next_messages() => result,
            };

            match result {
                Ok(messages) => {
                    failures = 0;
                    self.handle(&messages);
                }
                Err(e) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Notification wait failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Notification listener stopped");
    }

    /// Requests a sync if any message came from another client
    ///
    /// Returns true if a sync was requested.
    pub fn handle(&self, messages: &[NotificationMessage]) -> bool {
        let foreign = messages
            .iter()
            .filter(|m| !m.is_self_echo(&self.client_id))
            .count();
        let echoes = messages.len() - foreign;
        if echoes > 0 {
            debug!(echoes, "Ignoring self-authored notifications");
        }
        if foreign == 0 {
            return false;
        }

        debug!(messages = foreign, "Remote changes announced");
        self.trigger.request();
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    struct Scripted {
        replies: Mutex<VecDeque<anyhow::Result<Vec<NotificationMessage>>>>,
    }

    #[async_trait::async_trait]
    impl INotificationSource for Scripted {
        async fn next_messages(&self) -> anyhow::Result<Vec<NotificationMessage>> {
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        }
    }

    fn message(author: Option<ClientId>) -> NotificationMessage {
        NotificationMessage {
            body: "changed".into(),
            author,
        }
    }

    fn listener(
        me: ClientId,
        replies: Vec<anyhow::Result<Vec<NotificationMessage>>>,
    ) -> (NotificationListener, SyncTrigger) {
        let trigger = SyncTrigger::new();
        let source = Arc::new(Scripted {
            replies: Mutex::new(replies.into()),
        });
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5), false);
        (
            NotificationListener::new(source, me, trigger.clone(), backoff),
            trigger,
        )
    }

    #[test]
    fn self_echoes_do_not_trigger() {
        let me = ClientId::new();
        let (listener, _) = listener(me, vec![]);

        assert!(!listener.handle(&[message(Some(me))]));
        assert!(!listener.handle(&[]));
        assert!(listener.handle(&[message(Some(me)), message(Some(ClientId::new()))]));
        assert!(listener.handle(&[message(None)]));
    }

    #[tokio::test]
    async fn foreign_message_wakes_worker_after_error() {
        let me = ClientId::new();
        let (listener, trigger) = listener(
            me,
            vec![
                Err(anyhow::anyhow!("connection reset")),
                Ok(vec![message(Some(ClientId::new()))]),
            ],
        );
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(2), trigger.notified())
            .await
            .expect("foreign notification should request a sync");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener should stop on cancel")
            .unwrap();
    }
}
