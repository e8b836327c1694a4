// tests/janus_protocol_scenarios.rs
//
// The six literal end-to-end scenarios named in the protocol design.

mod support;

use janus_proto_core::{Config, Connection, Envelope, ServerAddress};
use serde_json::json;
use support::{init_logging, spawn_fake_server, unique_socket_path};

fn unix_config(path: &std::path::Path) -> Config {
    let mut cfg = Config::new(vec![ServerAddress::new(format!("file://{}", path.display()))]);
    cfg.retry_time_secs = 0;
    cfg.max_retries = 0;
    cfg
}

#[tokio::test]
async fn happy_create_attach_destroy() {
    init_logging();
    let path = unique_socket_path("happy");
    let _server = spawn_fake_server(path.clone(), |req| match req.janus.as_str() {
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 42}))),
        "attach" => Some(
            Envelope::new("success")
                .with_transaction(req.transaction.clone().unwrap())
                .with_session_id(42)
                .with_field("data", json!({"id": 7})),
        ),
        "destroy" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_session_id(42)),
        _ => None,
    });

    let connection = Connection::new(unix_config(&path)).unwrap();
    connection.open().await.unwrap();
    let mut events = connection.subscribe();

    let session = connection.create(None).await.unwrap();
    assert_eq!(session.id(), 42);

    let handle = session.attach(janus_proto_core::HandleDescriptor::new("janus.plugin.echotest")).await.unwrap();
    assert_eq!(handle.id(), 7);

    session.destroy().await.unwrap();

    let mut saw_destroyed = false;
    while let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(200), events.recv()).await {
        if let Ok(janus_proto_core::CoreEvent::SessionDestroyed { session_id }) = event {
            assert_eq!(session_id, 42);
            saw_destroyed = true;
            break;
        }
    }
    assert!(saw_destroyed, "expected SessionDestroyed to be emitted");
}

#[tokio::test]
async fn error_response_rejects_with_code_and_reason() {
    init_logging();
    let path = unique_socket_path("error-response");
    let _server = spawn_fake_server(path.clone(), |req| match req.janus.as_str() {
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 1}))),
        "attach" => Some(
            Envelope::new("success")
                .with_transaction(req.transaction.clone().unwrap())
                .with_session_id(1)
                .with_field("data", json!({"id": 2})),
        ),
        "message" => Some(Envelope {
            sender: Some(2),
            ..Envelope::new("error")
                .with_transaction(req.transaction.clone().unwrap())
                .with_session_id(1)
                .with_field("error", json!({"code": 432, "reason": "no such room"}))
        }),
        _ => None,
    });

    let connection = Connection::new(unix_config(&path)).unwrap();
    connection.open().await.unwrap();
    let session = connection.create(None).await.unwrap();
    let handle = session.attach(janus_proto_core::HandleDescriptor::new("janus.plugin.echotest")).await.unwrap();

    let err = handle.message(json!({}), None).await.unwrap_err();
    assert_eq!(err.to_string(), "432 no such room");
}

#[tokio::test]
async fn trickle_ack_resolves_via_session_owned_transaction_lookup() {
    init_logging();
    let path = unique_socket_path("trickle-ack");
    let _server = spawn_fake_server(path.clone(), |req| match req.janus.as_str() {
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 1}))),
        "attach" => Some(
            Envelope::new("success")
                .with_transaction(req.transaction.clone().unwrap())
                .with_session_id(1)
                .with_field("data", json!({"id": 2})),
        ),
        "trickle" => {
            // the server's ack to a trickle carries no `sender` field
            Some(Envelope::new("ack").with_transaction(req.transaction.clone().unwrap()).with_session_id(1))
        }
        _ => None,
    });

    let connection = Connection::new(unix_config(&path)).unwrap();
    connection.open().await.unwrap();
    let session = connection.create(None).await.unwrap();
    let handle = session.attach(janus_proto_core::HandleDescriptor::new("janus.plugin.echotest")).await.unwrap();

    let resp = handle.trickle(Some(json!({"candidate": "a=candidate:1 1 UDP 1 0.0.0.0 9 typ host"}))).await.unwrap();
    assert_eq!(resp.janus, "ack");
}

#[tokio::test]
async fn server_timeout_destroys_the_session() {
    init_logging();
    let path = unique_socket_path("timeout");
    let _server = spawn_fake_server(path.clone(), |req| match req.janus.as_str() {
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 1}))),
        _ => None,
    });

    let connection = Connection::new(unix_config(&path)).unwrap();
    connection.open().await.unwrap();
    let session = connection.create(None).await.unwrap();
    let mut events = session.subscribe();

    // The fake server above never sends a "timeout" notification on its
    // own; a second, independent datagram simulates the server evicting
    // the session asynchronously.
    let client = connect_notifier(&path).await;
    let notice = serde_json::to_vec(&Envelope::new("timeout").with_session_id(1)).unwrap();
    client.send(&notice).await.unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_millis(500), events.recv()).await.unwrap().unwrap();
    match event {
        janus_proto_core::CoreEvent::SessionDestroyed { session_id } => assert_eq!(session_id, 1),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn keepalive_failure_destroys_the_session_but_not_the_connection() {
    init_logging();
    let path = unique_socket_path("keepalive");
    let _server = spawn_fake_server(path.clone(), |req| match req.janus.as_str() {
        // every verb except keepalive gets an answer; the missing keepalive
        // reply is what triggers the failure under test.
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 9}))),
        _ => None,
    });

    let connection = Connection::new(unix_config(&path)).unwrap();
    connection.open().await.unwrap();
    let session = connection.create(Some(1)).await.unwrap();
    let mut events = session.subscribe();

    let event = tokio::time::timeout(std::time::Duration::from_millis(2500), events.recv()).await.unwrap().unwrap();
    match event {
        janus_proto_core::CoreEvent::SessionDestroyed { session_id } => assert_eq!(session_id, 9),
        other => panic!("unexpected event: {other:?}"),
    }
}

async fn connect_notifier(server_path: &std::path::Path) -> tokio::net::UnixDatagram {
    let bind_path = unique_socket_path("timeout-notifier");
    let socket = tokio::net::UnixDatagram::bind(&bind_path).unwrap();
    socket.connect(server_path).unwrap();
    socket
}
