// src/session.rs

//! Child of `Connection`; owns the handle table, runs the keepalive loop,
//! and routes session-scoped inbound messages (spec §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{error, trace, warn};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventEmitter};
use crate::handle::{Handle, HandleDescriptor};
use crate::message::{is_definitive_response, Envelope, JANUS_DESTROY, JANUS_ERROR, JANUS_KEEPALIVE, JANUS_TIMEOUT};
use crate::transaction::{OwnerToken, TransactionManager};

/// Server-side context multiplexing multiple handles over one connection
/// (spec §3 "Session state").
pub struct Session {
    connection: Weak<Connection>,
    id: u64,
    handles: RwLock<HashMap<u64, Arc<Handle>>>,
    transaction_manager: Arc<TransactionManager>,
    owner_token: OwnerToken,
    events: EventEmitter,
    destroying: AtomicBool,
    destroyed: AtomicBool,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    connection_sub_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(connection: &Arc<Connection>, id: u64, transaction_manager: Arc<TransactionManager>) -> Arc<Self> {
        let session = Arc::new(Session {
            connection: Arc::downgrade(connection),
            id,
            handles: RwLock::new(HashMap::new()),
            transaction_manager,
            owner_token: OwnerToken::new(),
            events: EventEmitter::new(),
            destroying: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            keepalive_task: Mutex::new(None),
            connection_sub_task: Mutex::new(None),
        });

        // Defensive subscription to the connection's closed/error events
        // (spec §4.4 teardown: "Session also subscribes once to the
        // connection's CONNECTION_CLOSED and CONNECTION_ERROR, both
        // trigger _signalDestroy"). Connection-initiated teardown already
        // destroys sessions directly and deterministically; this path only
        // matters if a session outlives its slot in the connection's table.
        let weak_session = Arc::downgrade(&session);
        let mut connection_events = connection.subscribe();
        let sub_task = tokio::spawn(async move {
            while let Ok(event) = connection_events.recv().await {
                let Some(session) = weak_session.upgrade() else { break };
                match event {
                    CoreEvent::ConnectionClosed | CoreEvent::ConnectionError => {
                        session.signal_destroy("connection closed").await;
                        break;
                    }
                    _ => {}
                }
            }
        });
        *session.connection_sub_task.lock() = Some(sub_task);

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn get_connection(&self) -> Result<Arc<Connection>> {
        self.connection.upgrade().ok_or_else(|| CoreError::Lifecycle("connection has been dropped".to_string()))
    }

    /// Stamps `session_id`, registers the transaction under this session's
    /// owner token, and delegates to `Connection::dispatch_request` (spec
    /// §4.4 `sendRequest`: "so responses are routed to this session").
    pub async fn send_request(&self, req: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        self.send_request_as(req, self.owner_token.clone(), timeout).await
    }

    /// As `send_request`, but registers the transaction under `owner`
    /// instead of this session's own owner token, used by `Handle` so
    /// responses are routed to the handle while still getting the
    /// session's `session_id` stamped on the way out.
    pub(crate) async fn send_request_as(&self, mut req: Envelope, owner: OwnerToken, timeout: Option<Duration>) -> Result<Envelope> {
        req.session_id = req.session_id.or(Some(self.id));
        let connection = self.get_connection()?;
        connection.dispatch_request(req, owner, timeout).await
    }

    pub(crate) fn transaction_manager_handle(&self) -> Arc<TransactionManager> {
        Arc::clone(&self.transaction_manager)
    }

    /// `destroy()` (spec §4.4): rejects if a destroy is already in progress
    /// or the session is already destroyed.
    pub async fn destroy(self: &Arc<Self>) -> Result<Envelope> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("session already destroyed".to_string()));
        }
        if self.destroying.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("destroy already in progress".to_string()));
        }

        let result = self.send_request(Envelope::new(JANUS_DESTROY), None).await;
        self.signal_destroy("session destroyed").await;
        result
    }

    /// `attach(descriptor)` (spec §4.4): sends `{janus:"attach", plugin:id}`
    /// and registers a new `Handle` under the server-assigned id.
    pub async fn attach(self: &Arc<Self>, descriptor: HandleDescriptor) -> Result<Arc<Handle>> {
        if descriptor.plugin.is_empty() {
            return Err(CoreError::Validation("plugin id must not be empty".to_string()));
        }

        let req = Envelope::new(crate::message::JANUS_ATTACH).with_field("plugin", descriptor.plugin.clone());
        let resp = self.send_request(req, None).await?;
        let handle_id = resp
            .data_id()
            .ok_or_else(|| CoreError::Validation("attach response missing handle id".to_string()))?;

        let handle = Handle::new(self, handle_id, descriptor.plugin_hook);
        self.handles.write().await.insert(handle_id, Arc::clone(&handle));

        // subscribe once to HANDLE_DETACHED to remove it from the table
        let handles_ref: Weak<Session> = Arc::downgrade(self);
        let mut handle_events = handle.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = handle_events.recv().await {
                if let CoreEvent::HandleDetached { handle_id } = event {
                    if let Some(session) = handles_ref.upgrade() {
                        session.handles.write().await.remove(&handle_id);
                    }
                    break;
                }
            }
        });

        Ok(handle)
    }

    /// Starts the periodic keepalive task (spec §4.4 "Keepalive"): each tick
    /// sends `{janus:"keepalive"}` racing a timeout of half the period; a
    /// miss is fatal to the session.
    pub(crate) fn start_keepalive(self: &Arc<Self>, interval_secs: u64) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if session.destroyed.load(Ordering::SeqCst) {
                    break;
                }

                let per_tick_timeout = Duration::from_millis(interval_secs * 500);
                let outcome = tokio::time::timeout(
                    per_tick_timeout,
                    session.send_request(Envelope::new(JANUS_KEEPALIVE), None),
                )
                .await;

                match outcome {
                    Ok(Ok(_)) => continue,
                    Ok(Err(err)) => {
                        warn!("keepalive failed for session {}: {err}", session.id);
                        session.signal_destroy("missed keepalive").await;
                        break;
                    }
                    Err(_) => {
                        warn!("keepalive timed out for session {}", session.id);
                        session.signal_destroy("missed keepalive").await;
                        break;
                    }
                }
            }
        });
        if let Some(old) = self.keepalive_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Inbound routing rules 1-4, delegated from `Connection` (spec §4.4).
    pub async fn dispatch(self: &Arc<Self>, msg: Envelope) {
        if let Some(sender) = msg.sender {
            let handle = self.handles.read().await.get(&sender).cloned();
            match handle {
                Some(handle) => handle.dispatch(msg).await,
                None => {
                    if msg.janus == "detached" {
                        trace!("dropping 'detached' for already-removed handle {sender}");
                    } else {
                        warn!("dropping message for unknown handle {sender}");
                    }
                }
            }
            return;
        }

        if let Some(tx_id) = msg.transaction.clone() {
            if let Some(owner) = self.transaction_manager.owner_of(&tx_id) {
                let owning_handle = {
                    let handles = self.handles.read().await;
                    handles.values().find(|h| h.owns(&owner)).cloned()
                };
                if let Some(handle) = owning_handle {
                    // special case: the server's ack to a trickle lacks `sender`
                    handle.dispatch(msg).await;
                    return;
                }
            }

            if self.transaction_manager.is_owned_by(&tx_id, &self.owner_token) {
                let request = self.transaction_manager.request_of(&tx_id);
                let is_keepalive = request.as_deref() == Some(JANUS_KEEPALIVE);
                if is_definitive_response(&msg.janus) || is_keepalive {
                    if msg.janus == JANUS_ERROR {
                        let (code, reason) = msg.error_code_reason();
                        self.transaction_manager.close_with_error(&tx_id, &self.owner_token, CoreError::protocol(code, reason));
                    } else {
                        self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg);
                    }
                }
            }
            return;
        }

        if msg.janus == JANUS_TIMEOUT {
            self.signal_destroy("server timeout").await;
            return;
        }

        error!("session {} received unroutable message: janus={}", self.id, msg.janus);
    }

    /// `_signalDestroy` (spec §4.4 teardown). Idempotent.
    pub(crate) async fn signal_destroy(self: &Arc<Self>, reason: &str) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.connection_sub_task.lock().take() {
            task.abort();
        }

        self.transaction_manager.close_all_with_error(Some(&self.owner_token), reason);

        let handles: Vec<Arc<Handle>> = self.handles.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.signal_detach(reason).await;
        }

        if let Ok(connection) = self.get_connection() {
            connection.remove_session(self.id).await;
        }

        self.events.emit(CoreEvent::SessionDestroyed { session_id: self.id });
    }
}
