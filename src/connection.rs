// src/connection.rs

//! The root of the Connection → Session → Handle hierarchy (spec §4.3).
//! Owns the transport, the shared transaction manager, and the session
//! table; routes every inbound message to the right owner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::config::{Config, ServerAddress};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventEmitter};
use crate::message::{
    is_definitive_response, Envelope, JANUS_CREATE, JANUS_ERROR, JANUS_HANDLE_INFO, JANUS_INFO,
    JANUS_LIST_HANDLES, JANUS_LIST_SESSIONS, JANUS_START_PCAP, JANUS_STOP_PCAP,
};
use crate::session::Session;
use crate::transaction::{OwnerToken, TransactionManager};
use crate::transport::{open_with_retry, CircularAddressIterator, Transport};

/// Root lifecycle object (spec §3 "Connection state"). Created by the
/// entry-point factory, opened asynchronously, eventually destroyed;
/// terminal state is permanent.
pub struct Connection {
    config: Config,
    transaction_manager: Arc<TransactionManager>,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    iterator: tokio::sync::Mutex<CircularAddressIterator>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    current_address: RwLock<Option<ServerAddress>>,
    owner_token: OwnerToken,
    events: EventEmitter,
    closing: Arc<AtomicBool>,
    closed: AtomicBool,
    dispatch_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Builds an unopened connection from a validated configuration.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate().map_err(CoreError::Validation)?;
        let start = config.resolve_initial_index();
        let iterator = CircularAddressIterator::starting_at(config.addresses.clone(), start);

        Ok(Arc::new(Connection {
            config,
            transaction_manager: TransactionManager::new(),
            sessions: RwLock::new(HashMap::new()),
            iterator: tokio::sync::Mutex::new(iterator),
            transport: RwLock::new(None),
            current_address: RwLock::new(None),
            owner_token: OwnerToken::new(),
            events: EventEmitter::new(),
            closing: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            dispatch_task: tokio::sync::Mutex::new(None),
        }))
    }

    /// Enables the periodic transaction-table size log gated by `--debug-tx`
    /// (spec §4.2); the embedding binary calls this after parsing its CLI
    /// flags, since flag parsing itself is out of scope here.
    pub fn enable_debug_logging(self: &Arc<Self>) {
        self.transaction_manager.enable_debug_logging();
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn is_admin(&self) -> bool {
        self.config.is_admin
    }

    /// Drives `Transport` open with retry/failover, then spawns the inbound
    /// dispatch loop (spec §4.1 `_attemptOpen`).
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let (transport, address) = {
            let mut iterator = self.iterator.lock().await;
            open_with_retry(
                &mut iterator,
                self.config.is_admin,
                &self.config.ws_options,
                self.config.max_retries,
                self.config.retry_time_secs,
                events_tx,
                Arc::clone(&self.closing),
            )
            .await?
        };

        *self.transport.write().await = Some(transport);
        *self.current_address.write().await = Some(address);

        let conn = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    crate::transport::TransportEvent::Message(msg) => conn.dispatch_inbound(msg).await,
                    crate::transport::TransportEvent::Closed { graceful } => {
                        conn.signal_close(graceful).await;
                        break;
                    }
                }
            }
        });
        *self.dispatch_task.lock().await = Some(task);

        Ok(())
    }

    /// Graceful, caller-initiated close (spec §4.3 `close()`).
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(transport) = self.transport.read().await.clone() {
            transport.close(true).await?;
        }
        self.signal_close(true).await;
        Ok(())
    }

    /// Stamps routing/auth fields and drives one request through the
    /// transaction table and the transport, for requests owned directly by
    /// the connection (`create`, `info`, admin verbs).
    pub async fn send_request(&self, req: Envelope) -> Result<Envelope> {
        self.dispatch_request(req, self.owner_token.clone(), None).await
    }

    /// Shared request path used by `Session`/`Handle` as well: stamps
    /// `transaction` (generating one if absent) and the current address's
    /// `apisecret`/`admin_secret`/`token`, registers the transaction under
    /// `owner`, sends over the transport, and awaits completion (spec §4.3
    /// `sendRequest`).
    pub(crate) async fn dispatch_request(
        &self,
        mut req: Envelope,
        owner: OwnerToken,
        timeout: Option<std::time::Duration>,
    ) -> Result<Envelope> {
        let id = req.transaction.clone().unwrap_or_else(|| self.transaction_manager.generate_id());
        req.transaction = Some(id.clone());

        if let Some(address) = self.current_address.read().await.clone() {
            if self.config.is_admin {
                req.admin_secret = req.admin_secret.or(address.apisecret.clone());
            } else {
                req.apisecret = req.apisecret.or(address.apisecret.clone());
            }
            req.token = req.token.or(address.token.clone());
        }

        let request_verb = req.janus.clone();
        let rx = self
            .transaction_manager
            .create(id.clone(), owner.clone(), request_verb, timeout)
            .ok_or_else(|| CoreError::Validation(format!("transaction id '{id}' already in use")))?;

        let transport = self.transport.read().await.clone().ok_or_else(|| {
            CoreError::Lifecycle("connection is not open".to_string())
        })?;

        if let Err(err) = transport.send(&req).await {
            self.transaction_manager.close_with_error(&id, &owner, CoreError::Transport(err.to_string()));
            return Err(CoreError::Transport(err.to_string()));
        }

        rx.await.map_err(|_| CoreError::Lifecycle("transaction dropped before completion".to_string()))?
    }

    /// `{janus:"create"}` (spec §4.3 `create`): creates a `Session` for the
    /// server-assigned id and starts its keepalive loop.
    pub async fn create(self: &Arc<Self>, ka_interval_secs: Option<u64>) -> Result<Arc<Session>> {
        let resp = self.send_request(Envelope::new(JANUS_CREATE)).await?;
        let id = resp
            .data_id()
            .ok_or_else(|| CoreError::Validation("create response missing session id".to_string()))?;

        let session = Session::new(self, id, Arc::clone(&self.transaction_manager));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        session.start_keepalive(ka_interval_secs.unwrap_or(30));
        Ok(session)
    }

    pub async fn get_info(&self) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_INFO)).await
    }

    // --- Admin API (spec §4.3) ---

    pub async fn list_sessions(&self) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_LIST_SESSIONS)).await
    }

    pub async fn list_handles(&self, session_id: u64) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_LIST_HANDLES).with_session_id(session_id)).await
    }

    pub async fn handle_info(&self, session_id: u64, handle_id: u64) -> Result<Envelope> {
        self.send_request(
            Envelope::new(JANUS_HANDLE_INFO).with_session_id(session_id).with_handle_id(handle_id),
        )
        .await
    }

    pub async fn start_pcap(
        &self,
        session_id: u64,
        handle_id: u64,
        folder: impl Into<String>,
        filename: impl Into<String>,
        truncate: Option<u64>,
    ) -> Result<Envelope> {
        let folder = folder.into();
        let filename = filename.into();
        if folder.is_empty() || filename.is_empty() {
            return Err(CoreError::Validation("start_pcap requires a non-empty folder and filename".to_string()));
        }
        let mut req = Envelope::new(JANUS_START_PCAP)
            .with_session_id(session_id)
            .with_handle_id(handle_id)
            .with_field("folder", folder)
            .with_field("filename", filename);
        if let Some(truncate) = truncate {
            req = req.with_field("truncate", truncate);
        }
        self.send_request(req).await
    }

    pub async fn stop_pcap(&self, session_id: u64, handle_id: u64) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_STOP_PCAP).with_session_id(session_id).with_handle_id(handle_id)).await
    }

    /// Removes a session from the table; called by `Session::_signal_destroy`
    /// as well as by connection-level teardown (a no-op if already removed).
    pub(crate) async fn remove_session(&self, id: u64) {
        self.sessions.write().await.remove(&id);
    }

    pub(crate) fn transaction_manager(&self) -> Arc<TransactionManager> {
        Arc::clone(&self.transaction_manager)
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Inbound routing rules 1-3 (spec §4.3).
    async fn dispatch_inbound(self: &Arc<Self>, msg: Envelope) {
        if let Some(session_id) = msg.session_id {
            if !self.config.is_admin {
                let session = self.sessions.read().await.get(&session_id).cloned();
                match session {
                    Some(session) => session.dispatch(msg).await,
                    None => warn!("dropping message for unknown session {session_id}"),
                }
                return;
            }
        }

        if let Some(tx_id) = msg.transaction.clone() {
            if !self.transaction_manager.is_owned_by(&tx_id, &self.owner_token) {
                warn!("dropping message for transaction '{tx_id}' not owned by this connection");
                return;
            }
            if is_definitive_response(&msg.janus) {
                if msg.janus == JANUS_ERROR {
                    let (code, reason) = msg.error_code_reason();
                    self.transaction_manager.close_with_error(&tx_id, &self.owner_token, CoreError::protocol(code, reason));
                } else {
                    self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg);
                }
            }
            return;
        }

        error!("unexpected message with neither session_id nor transaction: janus={}", msg.janus);
    }

    /// `_signalClose(graceful)` (spec §4.3 teardown). Idempotent.
    async fn signal_close(self: &Arc<Self>, graceful: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("connection closing (graceful={graceful})");

        self.transaction_manager.close_all_with_error(Some(&self.owner_token), "connection closed");

        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.signal_destroy("connection closed").await;
        }

        self.transaction_manager.close_all_with_error(None, "connection closed");

        self.events.emit(if graceful { CoreEvent::ConnectionClosed } else { CoreEvent::ConnectionError });
    }
}
