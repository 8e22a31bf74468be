//! Shared helpers for sync service mocks

use std::time::Duration;

use chrono::{TimeZone, Utc};
use cirrus_core::domain::{ChangeId, ChangeKind, ClientId, FileMetadata, RelativePath, SyncId};
use cirrus_core::ports::{PullRequest, PushRequest, WireChange};
use cirrus_remote::RemoteClient;
use serde_json::{json, Value};
use wiremock::MockServer;

pub const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

/// Starts a mock server and a client pointing at it
pub async fn setup() -> (MockServer, RemoteClient) {
    let server = MockServer::start().await;
    let client = RemoteClient::new(server.uri(), Duration::from_secs(5))
        .expect("client")
        .with_max_throttle_retries(2);
    (server, client)
}

pub fn folder_metadata() -> FileMetadata {
    FileMetadata::folder(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
}

pub fn push_request(client_id: ClientId) -> PushRequest {
    PushRequest {
        relative_root_path: "/".into(),
        last_sync_id: Some(SyncId::new("s41").unwrap()),
        client_id,
        events: vec![WireChange {
            kind: ChangeKind::Created,
            path: RelativePath::new("/docs").unwrap(),
            from_path: None,
            metadata: folder_metadata(),
            change_id: ChangeId::new(7),
        }],
    }
}

pub fn pull_request(last: Option<&str>) -> PullRequest {
    PullRequest {
        relative_root_path: "/".into(),
        last_sync_id: last.map(|s| SyncId::new(s).unwrap()),
    }
}

/// A server event as the service serializes it
pub fn event_json(event_id: i64, kind: &str, path: &str, origin: Option<(ClientId, u64)>) -> Value {
    let mut event = json!({
        "event_id": event_id,
        "sync_id": "s42",
        "kind": kind,
        "path": path,
        "metadata": {
            "hash": HASH,
            "size": 4,
            "created": "2024-06-01T12:00:00Z",
            "modified": "2024-06-01T12:00:00Z",
            "revision": 3,
            "storage_key": format!("blob-{event_id}")
        }
    });
    if let Some((client, change)) = origin {
        event["origin_client"] = json!(client.to_string());
        event["origin_change_id"] = json!(change);
    }
    event
}
