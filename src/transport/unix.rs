// src/transport/unix.rs

//! The Unix datagram transport (spec §4.1 "Unix datagram transport").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, error, warn};
use rand::Rng;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::{CoreError, Result};
use crate::message::Envelope;

use super::{Transport, TransportEvent};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Binds a local datagram socket at a per-connection path and connects it to
/// the server's socket path (spec §4.1: "Binds a local socket at a
/// per-connection path... Connects to the server's socket path").
pub struct UnixDatagramTransport {
    server_path: std::path::PathBuf,
    bind_path: std::path::PathBuf,
    socket: Mutex<Option<std::sync::Arc<UnixDatagram>>>,
    opened: AtomicBool,
    closing: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnixDatagramTransport {
    pub fn new(url: Url) -> Self {
        let server_path = std::path::PathBuf::from(url.path());
        let bind_id: u64 = rand::thread_rng().gen();
        let bind_path = std::path::PathBuf::from(format!("/tmp/.janode-{bind_id:016x}"));
        UnixDatagramTransport {
            server_path,
            bind_path,
            socket: Mutex::new(None),
            opened: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    fn teardown_bind_path(&self) {
        if self.bind_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.bind_path) {
                warn!("failed to unlink bind path {}: {err}", self.bind_path.display());
            }
        }
    }
}

#[async_trait]
impl Transport for UnixDatagramTransport {
    async fn open(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        // unlink any stale path first (spec §4.1)
        self.teardown_bind_path();

        let socket = UnixDatagram::bind(&self.bind_path)?;
        socket.connect(&self.server_path)?;
        debug!(
            "unix datagram transport bound at {} connected to {}",
            self.bind_path.display(),
            self.server_path.display()
        );

        let socket = std::sync::Arc::new(socket);
        *self.socket.lock().unwrap() = Some(std::sync::Arc::clone(&socket));

        let reader_events = events.clone();
        let reader_closing = std::sync::Arc::new(AtomicBool::new(false));
        let closing_ref = std::sync::Arc::clone(&reader_closing);
        let bind_path = self.bind_path.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => match serde_json::from_slice::<Envelope>(&buf[..len]) {
                        Ok(envelope) => {
                            if reader_events.send(TransportEvent::Message(envelope)).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("dropping malformed inbound datagram: {err}"),
                    },
                    Err(err) => {
                        error!("unix datagram transport fatal error: {err}");
                        if let Err(unlink_err) = std::fs::remove_file(&bind_path) {
                            warn!("failed to unlink bind path {}: {unlink_err}", bind_path.display());
                        }
                        let graceful = closing_ref.load(Ordering::SeqCst);
                        let _ = reader_events.send(TransportEvent::Closed { graceful });
                        break;
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(reader_task);
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, graceful: bool) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.socket.lock().unwrap().take();
        self.teardown_bind_path();
        self.opened.store(false, Ordering::SeqCst);
        let _ = graceful;
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        let socket = self.socket.lock().unwrap().clone().ok_or_else(|| {
            CoreError::Transport("send on a transport that is not open".to_string())
        })?;
        let bytes = serde_json::to_vec(envelope)?;
        socket.send(&bytes).await?;
        Ok(())
    }

    fn get_remote_hostname(&self) -> Option<String> {
        self.server_path.to_str().map(str::to_string)
    }
}
