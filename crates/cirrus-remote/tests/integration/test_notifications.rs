//! Long-poll notification source

use std::time::Duration;

use cirrus_core::domain::ClientId;
use cirrus_core::ports::{INotificationSource, RemoteError};
use cirrus_remote::NotificationPoller;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_messages_are_decoded_with_authors() {
    let server = MockServer::start().await;
    let me = ClientId::new();
    let other = ClientId::new();

    Mock::given(method("GET"))
        .and(path("/notifications"))
        .and(query_param("client_id", me.to_string()))
        .and(query_param("wait", "30"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "body": "changed", "author": me.to_string() },
            { "body": "changed", "author": other.to_string() },
            { "body": "maintenance" }
        ])))
        .mount(&server)
        .await;

    let poller = NotificationPoller::new(server.uri(), me, Duration::from_secs(30)).unwrap();
    let messages = poller.next_messages().await.unwrap();

    assert_eq!(messages.len(), 3);
    assert!(messages[0].is_self_echo(&me));
    assert!(!messages[1].is_self_echo(&me));
    assert_eq!(messages[2].author, None);
}

#[tokio::test]
async fn test_quiet_wait_returns_no_messages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let poller =
        NotificationPoller::new(server.uri(), ClientId::new(), Duration::from_secs(1)).unwrap();

    assert!(poller.next_messages().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_server_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let poller =
        NotificationPoller::new(server.uri(), ClientId::new(), Duration::from_secs(1)).unwrap();
    let err = poller.next_messages().await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RemoteError>(),
        Some(RemoteError::Unavailable { status: 502, .. })
    ));
}
