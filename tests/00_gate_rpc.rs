mod support;

use bytes::Bytes;
use mqgate::gate::{Session, Storage};
use mqgate::rpc::ServerState;

use support::Harness;

#[tokio::test]
async fn bind_reply_carries_the_session() {
    let mut gate = Harness::start().await;
    let _conn = gate.connect("s1");

    gate.call("Bind", &[b"s1", b"u1"]).await;
    let reply = gate.next_reply().await;

    assert_eq!(reply.cid, "cid-Bind");
    assert!(reply.error.is_empty(), "unexpected error: {}", reply.error);
    assert_eq!(reply.result_type, "session");

    let session = Session::from_bytes(&reply.result).unwrap();
    assert_eq!(session.session_id, "s1");
    assert_eq!(session.user_id, "u1");
    assert_eq!(session.server_id, support::SERVER_ID);

    assert!(gate.shutdown().await);
}

#[tokio::test]
async fn malformed_body_is_skipped_and_the_next_call_served() {
    let mut gate = Harness::start().await;
    let _conn = gate.connect("s1");

    gate.publish_raw(Bytes::from_static(&[0x0A, 0x05, b'a'])).await;
    gate.call("Update", &[b"s1"]).await;

    let reply = gate.next_reply().await;
    assert_eq!(reply.cid, "cid-Update");
    assert!(reply.error.is_empty());
    assert_eq!(gate.broker.acked().len(), 2);

    assert!(gate.shutdown().await);
}

#[tokio::test]
async fn settings_survive_a_reconnect_through_storage() {
    let mut gate = Harness::start().await;
    let _first = gate.connect("s1");

    gate.call("Bind", &[b"s1", b"u1"]).await;
    gate.next_reply().await;
    gate.call("Set", &[b"s1", b"room", b"42"]).await;
    gate.next_reply().await;

    let stored = gate.storage.query("u1").await.unwrap().unwrap();
    assert_eq!(stored.get("room").map(String::as_str), Some("42"));

    let _second = gate.connect("s2");
    gate.call("Bind", &[b"s2", b"u1"]).await;
    let reply = gate.next_reply().await;

    let session = Session::from_bytes(&reply.result).unwrap();
    assert_eq!(session.settings.get("room").map(String::as_str), Some("42"));

    assert!(gate.shutdown().await);
}

#[tokio::test]
async fn send_reaches_the_connection() {
    let mut gate = Harness::start().await;
    let mut conn = gate.connect("s1");

    gate.call("Send", &[b"s1", b"chat/msg", b"hello"]).await;
    let reply = gate.next_reply().await;
    assert_eq!(reply.result, b"success".to_vec());

    let out = conn.recv().await.unwrap();
    assert_eq!(out.topic, "chat/msg");
    assert_eq!(out.body, Bytes::from_static(b"hello"));

    assert!(gate.shutdown().await);
}

#[tokio::test]
async fn unknown_session_errors_travel_back() {
    let mut gate = Harness::start().await;

    gate.call("Close", &[b"ghost"]).await;
    let reply = gate.next_reply().await;

    assert_eq!(reply.error, "No Session found");
    assert!(reply.result.is_empty());

    assert!(gate.shutdown().await);
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let gate = Harness::start().await;
    let _a = gate.connect("s1");
    let _b = gate.connect("s2");
    assert_eq!(gate.manager.session_count(), 2);

    assert!(gate.shutdown().await);

    assert_eq!(gate.manager.session_count(), 0);
    assert_eq!(gate.server.state(), ServerState::Closed);
}
