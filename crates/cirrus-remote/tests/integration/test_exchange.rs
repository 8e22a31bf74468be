//! Sync_To, Sync_From, metadata and content requests

use std::time::Duration;

use cirrus_core::domain::{ChangeId, ChangeKind, ClientId, RelativePath, StorageKey, SyncId};
use cirrus_core::ports::{IRemoteService, MetadataQuery, RemoteError};
use cirrus_remote::RemoteClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, event_json};

fn remote_error(err: anyhow::Error) -> RemoteError {
    err.downcast::<RemoteError>()
        .expect("adapter errors should be RemoteError")
}

#[tokio::test]
async fn test_push_sends_changes_and_parses_acknowledgements() {
    let (server, client) = common::setup().await;
    let me = ClientId::new();

    Mock::given(method("POST"))
        .and(path("/sync/to"))
        .and(body_partial_json(json!({
            "relative_root_path": "/",
            "last_sync_id": "s41",
            "client_id": me.to_string(),
            "events": [{ "kind": "created", "path": "/docs", "change_id": 7 }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sync_id": "s42",
            "events": [
                event_json(100, "created", "/docs", Some((me, 7))),
                event_json(101, "modified", "/theirs.txt", None)
            ],
            "pending_count": 2,
            "rejected": [{ "change_id": 8, "reason": "quota exceeded" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.push(&common::push_request(me)).await.unwrap();

    assert_eq!(response.sync_id, SyncId::new("s42").unwrap());
    assert_eq!(response.events.len(), 2);
    assert_eq!(response.events[0].acknowledges(&me), Some(ChangeId::new(7)));
    assert!(response.events[1].is_foreign(&me));
    assert_eq!(response.events[1].kind, ChangeKind::Modified);
    assert_eq!(response.events[1].metadata.revision, 3);
    assert_eq!(response.pending_count, Some(2));
    assert!(!response.partial);
    assert_eq!(response.rejected[0].change_id, ChangeId::new(8));
}

#[tokio::test]
async fn test_pull_pages_and_optional_fields() {
    let (server, client) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .and(body_partial_json(json!({ "last_sync_id": null })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sync_id": "p1",
            "events": [event_json(1, "deleted", "/old.txt", None)],
            "partial": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .and(body_partial_json(json!({ "last_sync_id": "p1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sync_id": "p2" })))
        .mount(&server)
        .await;

    let first = client.pull(&common::pull_request(None)).await.unwrap();
    assert!(first.partial);
    assert_eq!(first.events[0].kind, ChangeKind::Deleted);

    let second = client.pull(&common::pull_request(Some("p1"))).await.unwrap();
    assert_eq!(second.sync_id, SyncId::new("p2").unwrap());
    assert!(second.events.is_empty());
    assert!(!second.partial);
}

#[tokio::test]
async fn test_server_errors_are_unavailable() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/to"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = remote_error(client.push(&common::push_request(ClientId::new())).await.unwrap_err());

    assert_eq!(
        err,
        RemoteError::Unavailable {
            status: 503,
            message: "maintenance".into()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_conflict_and_validation_statuses_are_rejections() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/to"))
        .respond_with(ResponseTemplate::new(409).set_body_string("stale sync id"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let push = remote_error(client.push(&common::push_request(ClientId::new())).await.unwrap_err());
    assert!(matches!(push, RemoteError::Rejected { status: 409, .. }));
    assert!(!push.is_transient());

    let pull = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());
    assert!(matches!(pull, RemoteError::Rejected { status: 422, .. }));
}

#[tokio::test]
async fn test_throttled_request_is_retried_after_short_wait() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sync_id": "s1" })))
        .mount(&server)
        .await;

    let response = client.pull(&common::pull_request(None)).await.unwrap();

    assert_eq!(response.sync_id, SyncId::new("s1").unwrap());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_throttling_gives_up_after_retry_limit() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .expect(3)
        .mount(&server)
        .await;

    let err = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());

    assert!(matches!(err, RemoteError::Unavailable { status: 429, .. }));
}

#[tokio::test]
async fn test_long_retry_after_is_left_to_the_caller() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3600"))
        .expect(1)
        .mount(&server)
        .await;

    let err = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());

    assert!(err.is_transient());
}

#[tokio::test]
async fn test_malformed_body_is_a_protocol_error() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .mount(&server)
        .await;

    let err = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());

    assert!(matches!(err, RemoteError::Protocol(_)));
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let (server, _) = common::setup().await;
    let client = RemoteClient::new(server.uri(), Duration::from_millis(100)).unwrap();
    Mock::given(method("POST"))
        .and(path("/sync/from"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "sync_id": "s1" }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());

    assert!(matches!(err, RemoteError::Timeout(_)));
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let client = RemoteClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();

    let err = remote_error(client.pull(&common::pull_request(None)).await.unwrap_err());

    assert!(matches!(err, RemoteError::Network(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_metadata_query_no_content_is_none() {
    let (server, client) = common::setup().await;
    Mock::given(method("POST"))
        .and(path("/metadata"))
        .and(body_partial_json(json!({ "path": "/missing.txt" })))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/metadata"))
        .and(body_partial_json(json!({ "path": "/docs", "is_folder": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "created": "2024-06-01T12:00:00Z",
            "modified": "2024-06-01T12:00:00Z",
            "is_folder": true,
            "revision": 5
        })))
        .mount(&server)
        .await;

    let missing = client
        .query_metadata(&MetadataQuery {
            user_id: "alice".into(),
            path: RelativePath::new("/missing.txt").unwrap(),
            is_folder: false,
        })
        .await
        .unwrap();
    assert!(missing.is_none());

    let docs = client
        .query_metadata(&MetadataQuery {
            user_id: "alice".into(),
            path: RelativePath::new("/docs").unwrap(),
            is_folder: true,
        })
        .await
        .unwrap()
        .unwrap();
    assert!(docs.is_folder);
    assert_eq!(docs.revision, 5);
}

#[tokio::test]
async fn test_fetch_content_returns_raw_bytes() {
    let (server, client) = common::setup().await;
    Mock::given(method("GET"))
        .and(path("/content/blob-100"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"test".to_vec()))
        .mount(&server)
        .await;

    let data = client
        .fetch_content(&StorageKey::new("blob-100").unwrap())
        .await
        .unwrap();
    assert_eq!(data, b"test");

    let err = remote_error(
        client
            .fetch_content(&StorageKey::new("blob-404").unwrap())
            .await
            .unwrap_err(),
    );
    assert!(matches!(err, RemoteError::NotFound(_)));
}
