//! End-to-end session tests against an in-process stub hub.
//!
//! The stub speaks the real wire protocol: JSON payloads inside
//! u32-length-prefixed frames over TCP, no TLS. Each test drives one
//! scripted hub session and asserts the exact item sequence the consumer
//! observes.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use hubwatch::{Category, Message, NotifierServer};

type HubFramed = Framed<TcpStream, LengthDelimitedCodec>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept one connection and verify the subscribe handshake.
async fn accept_subscriber(listener: TcpListener) -> HubFramed {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let frame = framed
        .next()
        .await
        .expect("subscribe frame")
        .expect("read subscribe");
    let subscribe: Value = serde_json::from_slice(&frame).expect("subscribe json");
    assert_eq!(subscribe["kind"], "subscribe");
    assert_eq!(subscribe["app_name"], "itest");
    assert_eq!(subscribe["app_id"], "itest-id");

    framed
}

async fn send_json(framed: &mut HubFramed, value: Value) {
    let payload = serde_json::to_vec(&value).expect("encode");
    framed.send(Bytes::from(payload)).await.expect("send");
}

fn test_server(port: u16) -> std::sync::Arc<NotifierServer> {
    NotifierServer::new(
        format!("127.0.0.1:{port}"),
        None,
        false,
        Some("itest".to_string()),
        Some("itest-id".to_string()),
    )
}

fn summary_and_category(message: &Message) -> (String, Option<Category>) {
    match message {
        Message::Notify(n) => (n.summary.clone(), n.category),
        other => panic!("expected a notify item, got {other:?}"),
    }
}

#[tokio::test]
async fn test_session_delivers_in_order_and_ends_after_remote_error() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let hub = tokio::spawn(async move {
            let mut framed = accept_subscriber(listener).await;
            send_json(&mut framed, json!({ "kind": "subscribed" })).await;
            send_json(
                &mut framed,
                json!({
                    "kind": "notify",
                    "id": "n-1",
                    "app_name": "editor",
                    "summary": "A",
                    "body": "first",
                    "urgency": 1,
                }),
            )
            .await;
            send_json(&mut framed, json!({ "kind": "error", "reason": "going away" })).await;
            // Drain whatever the client sends back (goodbye) until EOF.
            while framed.next().await.is_some() {}
        });

        let server = test_server(port);
        let mut stream = server.iter().await.expect("iter");

        let first = stream.next().await.expect("established status");
        assert_eq!(
            summary_and_category(&first),
            ("Connection Established".to_string(), Some(Category::Connected))
        );

        let second = stream.next().await.expect("notification A");
        match &second {
            Message::Notify(n) => {
                assert_eq!(n.summary, "A");
                assert_eq!(n.urgency, Some(1));
                assert_eq!(n.category, None);
            }
            other => panic!("expected notification, got {other:?}"),
        }

        let third = stream.next().await.expect("communication error status");
        let (summary, category) = summary_and_category(&third);
        assert_eq!(summary, "Communication Error");
        assert_eq!(category, Some(Category::Error));
        match &third {
            Message::Notify(n) => assert!(n.body.contains("going away")),
            other => panic!("unexpected {other:?}"),
        }

        // Non-forced teardown: clean end of stream after the drain.
        assert!(stream.next().await.is_none());

        hub.await.expect("hub task");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_session_ends_cleanly_after_goodbye() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let hub = tokio::spawn(async move {
            let mut framed = accept_subscriber(listener).await;
            send_json(&mut framed, json!({ "kind": "subscribed" })).await;
            send_json(&mut framed, json!({ "kind": "goodbye" })).await;
            while framed.next().await.is_some() {}
        });

        let server = test_server(port);
        let mut stream = server.iter().await.expect("iter");

        let first = stream.next().await.expect("established status");
        assert_eq!(
            summary_and_category(&first).0,
            "Connection Established".to_string()
        );

        let second = stream.next().await.expect("closed status");
        assert_eq!(
            summary_and_category(&second),
            (
                "Connection Closed".to_string(),
                Some(Category::Disconnected)
            )
        );

        assert!(stream.next().await.is_none());

        hub.await.expect("hub task");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_session_reports_closure_on_remote_hangup() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let hub = tokio::spawn(async move {
            let mut framed = accept_subscriber(listener).await;
            send_json(&mut framed, json!({ "kind": "subscribed" })).await;
            // Drop the connection without a goodbye.
        });

        let server = test_server(port);
        let mut stream = server.iter().await.expect("iter");

        let first = stream.next().await.expect("established status");
        assert_eq!(
            summary_and_category(&first).0,
            "Connection Established".to_string()
        );

        let second = stream.next().await.expect("closed status");
        assert_eq!(
            summary_and_category(&second),
            (
                "Connection Closed".to_string(),
                Some(Category::Disconnected)
            )
        );

        assert!(stream.next().await.is_none());

        hub.await.expect("hub task");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_start_fails_when_nothing_listens() {
    // Bind then drop to obtain a port that is very likely closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let server = test_server(port);
    let result = server.iter().await;
    assert!(result.is_err());
}
