// tests/reconnect_failover_test.rs
//
// Scenario 5: reconnect failover. The first configured address is
// unreachable; `Connection::open()` must advance the circular iterator and
// succeed against the second.

mod support;

use janus_proto_core::{Config, Connection, Envelope, ServerAddress};
use serde_json::json;
use support::{init_logging, spawn_fake_server, unique_socket_path};

#[tokio::test]
async fn open_fails_over_to_the_second_address() {
    init_logging();

    // A dead address: nothing is bound at this path.
    let dead_path = unique_socket_path("dead");
    // A live address: the fake server below answers on it.
    let live_path = unique_socket_path("live");
    let _server = spawn_fake_server(live_path.clone(), |req| match req.janus.as_str() {
        "create" => Some(Envelope::new("success").with_transaction(req.transaction.clone().unwrap()).with_field("data", json!({"id": 1}))),
        _ => None,
    });

    let mut cfg = Config::new(vec![
        ServerAddress::new(format!("file://{}", dead_path.display())),
        ServerAddress::new(format!("file://{}", live_path.display())),
    ]);
    cfg.retry_time_secs = 0;
    cfg.max_retries = 1;

    let connection = Connection::new(cfg).unwrap();
    connection.open().await.unwrap();

    // `connect()` on the dead path fails immediately (no such file), so the
    // retry loop should already be sitting on the live address; prove it by
    // completing a full round trip against the fake server.
    let session = connection.create(None).await.unwrap();
    assert_eq!(session.id(), 1);
}
