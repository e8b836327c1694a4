// tests/websocket_transport_test.rs
//
// Loopback echo test exercising `WebSocketTransport` directly against a raw
// `tokio-tungstenite` server, mirroring the teacher's
// `tests/server_transport_integration_test.rs` shape: bind a random port,
// spawn the server in a `tokio::spawn`, drive a real client against it.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use janus_proto_core::config::WsOptions;
use janus_proto_core::transport::websocket::WebSocketTransport;
use janus_proto_core::transport::{Transport, TransportEvent};
use janus_proto_core::Envelope;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_transport_round_trips_an_envelope() {
    init_logging();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");

    let server = tokio::spawn(async move {
        let (stream, _peer) = listener.accept().await.expect("accept connection");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("websocket handshake");

        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let request: Envelope = serde_json::from_str(&text).expect("valid envelope");
                    let response = Envelope::new("success")
                        .with_transaction(request.transaction.clone().unwrap())
                        .with_field("data", serde_json::json!({"id": 1}));
                    let _ = ws.send(WsMessage::Text(serde_json::to_string(&response).unwrap())).await;
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let transport = WebSocketTransport::new(url, false, WsOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.open(tx).await.expect("transport opens");

    transport
        .send(&Envelope::new("create").with_transaction("T-echo"))
        .await
        .expect("send request");

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no timeout waiting for reply")
        .expect("channel open");

    match event {
        TransportEvent::Message(envelope) => {
            assert_eq!(envelope.janus, "success");
            assert_eq!(envelope.transaction.as_deref(), Some("T-echo"));
            assert_eq!(envelope.data_id(), Some(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    transport.close(true).await.expect("transport closes");
    server.abort();
    let _ = server.await;
}
