// tests/support/mod.rs
//
// A fake Janus server over a Unix datagram socket, used by the end-to-end
// scenario tests. Mirrors the teacher's
// `tests/server_transport_integration_test.rs` shape: spin up a loopback
// listener in a `tokio::spawn`, drive a real client against it, assert on
// the exchange.

use janus_proto_core::Envelope;
use tokio::net::UnixDatagram;
use tokio::task::JoinHandle;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn unique_socket_path(label: &str) -> std::path::PathBuf {
    let id: u64 = rand::random();
    std::env::temp_dir().join(format!("janode-test-{label}-{id:016x}.sock"))
}

/// Binds a fake server at `path` and runs `handler` against every inbound
/// datagram, sending back whatever it returns (if anything).
pub fn spawn_fake_server<F>(path: std::path::PathBuf, mut handler: F) -> JoinHandle<()>
where
    F: FnMut(Envelope) -> Option<Envelope> + Send + 'static,
{
    let _ = std::fs::remove_file(&path);
    let socket = UnixDatagram::bind(&path).expect("bind fake janus server socket");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let Ok(request) = serde_json::from_slice::<Envelope>(&buf[..len]) else { continue };
            if let Some(response) = handler(request) {
                let bytes = serde_json::to_vec(&response).expect("serialize fake server response");
                let _ = socket.send_to(&bytes, &peer).await;
            }
        }
    })
}
