// src/transport/websocket.rs

//! The WebSocket transport (spec §4.1 "WebSocket transport" + "Ping task").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::config::WsOptions;
use crate::error::{CoreError, Result};
use crate::message::Envelope;

use super::{Transport, TransportEvent};

const PING_TIME_SECS: u64 = 10;
const PING_TIME_WAIT_SECS: u64 = 5;

pub struct WebSocketTransport {
    url: Url,
    is_admin: bool,
    ws_options: WsOptions,
    opened: AtomicBool,
    closing: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: Url, is_admin: bool, ws_options: WsOptions) -> Self {
        WebSocketTransport {
            url,
            is_admin,
            ws_options,
            opened: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn subprotocol(&self) -> &'static str {
        if self.is_admin { "janus-admin-protocol" } else { "janus-protocol" }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        debug!("connecting websocket to {}", self.url);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| CoreError::InvalidUrl(err.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            self.subprotocol().parse().expect("subprotocol is a valid header value"),
        );

        let handshake = tokio_tungstenite::connect_async_with_config(request, None, false);
        let (stream, response) = tokio::time::timeout(
            Duration::from_millis(self.ws_options.handshake_timeout_ms),
            handshake,
        )
        .await
        .map_err(|_| CoreError::Timeout("WebSocket handshake timed out".to_string()))??;

        debug!("websocket connected to {}, status {}", self.url, response.status());

        let (mut sink, mut stream) = stream.split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.writer.lock() = Some(writer_tx.clone());

        let pong_notify = Arc::new(Notify::new());
        let last_ping_payload: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if let Err(err) = sink.send(msg).await {
                    warn!("websocket write failed: {err}");
                    break;
                }
            }
        });

        let events_reader = events.clone();
        let closing_flag = Arc::new(AtomicBool::new(false));
        let reader_closing = Arc::clone(&closing_flag);
        let reader_pong = Arc::clone(&pong_notify);
        let reader_last_ping = Arc::clone(&last_ping_payload);
        let reader_task = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Envelope>(&text) {
                        Ok(envelope) => {
                            if events_reader.send(TransportEvent::Message(envelope)).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("dropping malformed inbound message: {err}"),
                    },
                    Some(Ok(WsMessage::Binary(bin))) => {
                        warn!("dropping unexpected binary websocket message ({} bytes)", bin.len());
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        trace!("received websocket ping ({} bytes)", payload.len());
                    }
                    Some(Ok(WsMessage::Pong(payload))) => {
                        trace!("received websocket pong ({} bytes)", payload.len());
                        if *reader_last_ping.lock() == payload {
                            reader_pong.notify_one();
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("websocket close frame received: {frame:?}");
                        let graceful = reader_closing.load(Ordering::SeqCst);
                        let _ = events_reader.send(TransportEvent::Closed { graceful });
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {
                        warn!("dropping unexpected raw websocket frame");
                    }
                    Some(Err(err)) => {
                        error!("websocket read error: {err}");
                        let _ = events_reader.send(TransportEvent::Closed { graceful: false });
                        break;
                    }
                    None => {
                        let graceful = reader_closing.load(Ordering::SeqCst);
                        let _ = events_reader.send(TransportEvent::Closed { graceful });
                        break;
                    }
                }
            }
        });

        let ping_writer = writer_tx.clone();
        let ping_events = events.clone();
        let ping_pong = Arc::clone(&pong_notify);
        let ping_last_ping = Arc::clone(&last_ping_payload);
        let ping_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(PING_TIME_SECS)).await;

                let payload = Utc::now().timestamp_millis().to_be_bytes().to_vec();
                *ping_last_ping.lock() = payload.clone();

                if ping_writer.send(WsMessage::Ping(payload)).is_err() {
                    break;
                }

                let wait = tokio::time::timeout(Duration::from_secs(PING_TIME_WAIT_SECS), ping_pong.notified());
                if wait.await.is_err() {
                    warn!("ping timed out, terminating websocket");
                    let _ = ping_events.send(TransportEvent::Closed { graceful: false });
                    break;
                }
            }
        });

        *self.tasks.lock() = vec![writer_task, reader_task, ping_task];
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, graceful: bool) -> Result<()> {
        self.closing.store(graceful, Ordering::SeqCst);
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.send(WsMessage::Close(None));
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.opened.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("send on a transport that is not open".to_string()));
        }
        let writer = self.writer.lock().clone().ok_or_else(|| CoreError::Transport("not connected".to_string()))?;
        let text = serde_json::to_string(envelope)?;
        writer
            .send(WsMessage::Text(text))
            .map_err(|_| CoreError::Transport("websocket writer task has stopped".to_string()))
    }

    fn get_remote_hostname(&self) -> Option<String> {
        self.url.host_str().map(str::to_string)
    }
}
