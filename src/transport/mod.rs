// src/transport/mod.rs

//! Transport abstraction (spec §4.1): move JSON envelopes bidirectionally
//! over one physical channel, and the retry/failover wrapper that drives
//! opening across a list of configured server addresses.

pub mod unix;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::mpsc;
use url::Url;

use crate::config::{ServerAddress, WsOptions};
use crate::error::{CoreError, Result};
use crate::message::Envelope;

/// Out-of-band notifications a transport raises alongside the inbound
/// envelope stream (spec §4.1 `close`/`error` listeners).
#[derive(Debug)]
pub enum TransportEvent {
    Message(Envelope),
    /// The physical channel went away. `graceful` distinguishes a
    /// caller-initiated `close()` from an unexpected drop (spec §4.1 `close`
    /// handler: "distinguishing the previously-set `closing` flag from an
    /// unexpected drop").
    Closed { graceful: bool },
}

/// Capability set {open, close, send, getRemoteHostname} of spec §4.1,
/// implemented polymorphically by `WebSocketTransport` and
/// `UnixDatagramTransport`. `async_trait` keeps this object-safe so
/// `Connection` can hold either behind one `Arc<dyn Transport>` field.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the physical channel. Inbound envelopes and closure
    /// notifications are pushed onto `events` for as long as the transport
    /// stays open.
    async fn open(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;

    /// Closes the channel. `graceful` is echoed back as the `Closed` event's
    /// flag so callers can tell a requested close from a failure.
    async fn close(&self, graceful: bool) -> Result<()>;

    async fn send(&self, envelope: &Envelope) -> Result<()>;

    fn get_remote_hostname(&self) -> Option<String>;
}

/// Returned when the configured URL's scheme matches none of the supported
/// transports (spec §4.1: "a stub whose every operation fails").
pub struct StubTransport {
    reason: String,
}

impl StubTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        StubTransport { reason: reason.into() }
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn open(&self, _events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        Err(CoreError::Transport(format!("transport does not implement open: {}", self.reason)))
    }

    async fn close(&self, _graceful: bool) -> Result<()> {
        Err(CoreError::Transport(format!("transport does not implement close: {}", self.reason)))
    }

    async fn send(&self, _envelope: &Envelope) -> Result<()> {
        Err(CoreError::Transport(format!("transport does not implement send: {}", self.reason)))
    }

    fn get_remote_hostname(&self) -> Option<String> {
        None
    }
}

/// Builds the concrete transport for one configured address by inspecting
/// its URL scheme (spec §4.1): `ws|wss|ws+unix|wss+unix` → WebSocket,
/// `file` → Unix datagram, anything else → stub.
pub fn build_transport(address: &ServerAddress, is_admin: bool, ws_options: &WsOptions) -> Arc<dyn Transport> {
    let url = match Url::parse(&address.url) {
        Ok(url) => url,
        Err(err) => return Arc::new(StubTransport::new(format!("invalid url '{}': {err}", address.url))),
    };

    match url.scheme() {
        "ws" | "wss" | "ws+unix" | "wss+unix" => {
            Arc::new(websocket::WebSocketTransport::new(url, is_admin, ws_options.clone()))
        }
        "file" => Arc::new(unix::UnixDatagramTransport::new(url)),
        other => Arc::new(StubTransport::new(format!("unsupported url scheme '{other}'"))),
    }
}

/// Walks an ordered, non-empty list of server addresses, wrapping back to
/// the start (spec §9 design note: "`current()` returns the element
/// selected for the next attempt; `next()` advances and returns the new
/// current. Wrap modulo list length").
pub struct CircularAddressIterator {
    addresses: Vec<ServerAddress>,
    position: usize,
}

impl CircularAddressIterator {
    pub fn new(addresses: Vec<ServerAddress>) -> Self {
        Self::starting_at(addresses, 0)
    }

    /// Builds the iterator with its first `current()` already pointed at
    /// `start` (spec §6 `server_key` resolution), clamped into range.
    pub fn starting_at(addresses: Vec<ServerAddress>, start: usize) -> Self {
        assert!(!addresses.is_empty(), "address list must be non-empty");
        let position = if start < addresses.len() { start } else { 0 };
        CircularAddressIterator { addresses, position }
    }

    pub fn current(&self) -> &ServerAddress {
        &self.addresses[self.position]
    }

    pub fn next(&mut self) -> &ServerAddress {
        self.position = (self.position + 1) % self.addresses.len();
        self.current()
    }
}

/// Drives `_attemptOpen` (spec §4.1): build a transport for the current
/// address, try to open it, and on failure advance the circular iterator
/// and retry after `retry_time_secs`, up to `max_retries + 1` attempts
/// total. `closing` lets a concurrent `Connection::close()` abort a retry
/// loop that has not yet succeeded, resolving the Unix-transport
/// close-during-retry open question (spec §9) uniformly for every
/// transport kind, since the retry loop itself is transport-agnostic.
pub async fn open_with_retry(
    iterator: &mut CircularAddressIterator,
    is_admin: bool,
    ws_options: &WsOptions,
    max_retries: u32,
    retry_time_secs: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    closing: Arc<AtomicBool>,
) -> Result<(Arc<dyn Transport>, ServerAddress)> {
    let mut attempts: u32 = 0;
    let mut last_error: Option<CoreError> = None;

    loop {
        if closing.load(Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("transport closed during retry".to_string()));
        }

        let address = iterator.current().clone();
        let transport = build_transport(&address, is_admin, ws_options);
        attempts += 1;

        match transport.open(events.clone()).await {
            Ok(()) => return Ok((transport, address)),
            Err(err) => {
                warn!("open attempt {attempts} on '{}' failed: {err}", address.url);
                last_error = Some(err);
            }
        }

        if attempts >= max_retries + 1 {
            error!("exhausted all retries opening transport");
            iterator.next();
            return Err(last_error.unwrap_or_else(|| CoreError::Transport("unable to open transport".to_string())));
        }

        if closing.load(Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("transport closed during retry".to_string()));
        }

        if retry_time_secs > 0 {
            tokio::time::sleep(Duration::from_secs(retry_time_secs)).await;
        }
        iterator.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_iterator_wraps() {
        let mut it = CircularAddressIterator::new(vec![
            ServerAddress::new("ws://a"),
            ServerAddress::new("ws://b"),
        ]);
        assert_eq!(it.current().url, "ws://a");
        assert_eq!(it.next().url, "ws://b");
        assert_eq!(it.next().url, "ws://a");
    }

    #[test]
    fn build_transport_falls_back_to_stub_on_unknown_scheme() {
        let addr = ServerAddress::new("http://example.com");
        let transport = build_transport(&addr, false, &WsOptions::default());
        assert!(transport.get_remote_hostname().is_none());
    }

    #[tokio::test]
    async fn stub_transport_fails_every_operation() {
        let stub = StubTransport::new("no scheme matched");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(stub.open(tx).await.is_err());
        assert!(stub.close(true).await.is_err());
        assert!(stub.send(&Envelope::new("create")).await.is_err());
    }

    #[tokio::test]
    async fn retry_loop_advances_address_on_failure_and_gives_up() {
        let mut iterator = CircularAddressIterator::new(vec![
            ServerAddress::new("http://a.invalid"),
            ServerAddress::new("http://b.invalid"),
        ]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        let result = open_with_retry(&mut iterator, false, &WsOptions::default(), 1, 0, tx, closing).await;
        assert!(result.is_err());
        // one attempt on A, advance, one attempt on B: iterator now points at B's
        // successor, i.e. back to A.
        assert_eq!(iterator.current().url, "http://a.invalid");
    }

    #[tokio::test]
    async fn retry_loop_aborts_immediately_when_closing() {
        let mut iterator = CircularAddressIterator::new(vec![ServerAddress::new("http://a.invalid")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(true));

        let result = open_with_retry(&mut iterator, false, &WsOptions::default(), 5, 0, tx, closing).await;
        assert!(matches!(result, Err(CoreError::Lifecycle(_))));
    }
}
