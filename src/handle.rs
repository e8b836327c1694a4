// src/handle.rs

//! Child of `Session`; pluggable by plugin implementations, routes async
//! events, and exposes the request helpers applications call directly
//! (spec §4.5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::warn;
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventEmitter, HandleTrickleEvent};
use crate::message::{
    is_definitive_response, Envelope, JANUS_ACK, JANUS_DETACH, JANUS_DETACHED, JANUS_ERROR, JANUS_EVENT,
    JANUS_HANGUP, JANUS_ICE_FAILED, JANUS_MEDIA, JANUS_MESSAGE, JANUS_SLOWLINK, JANUS_TRICKLE, JANUS_WEBRTCUP,
};
use crate::session::Session;
use crate::transaction::{OwnerToken, TransactionManager};

/// What a plugin implementation returns when it recognizes a message (spec
/// §4.5 "Plugin hook contract"): `{event, data}`.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    pub event: Option<String>,
    pub data: Value,
}

/// Plugin subclasses of the generic `Handle` implement only this hook (spec
/// §1 Non-goals: plugin-specific subclasses are an external collaborator).
/// `prepopulated` already carries `jsep`/`e2ee` lifted out of `raw` by the
/// routing step, per spec §4.5's pre-population rule, the "second return
/// channel" option named in spec §9's design note, rather than a
/// symbol-keyed hidden property on the message.
pub trait Plugin: Send + Sync {
    fn handle_message(&self, raw: &Envelope, prepopulated: &Value) -> Option<PluginEvent>;
}

/// What `Session::attach` needs to construct a handle: the plugin
/// identifier to send to the server, and an optional hook implementation.
pub struct HandleDescriptor {
    pub plugin: String,
    pub plugin_hook: Option<Arc<dyn Plugin>>,
}

impl HandleDescriptor {
    pub fn new(plugin: impl Into<String>) -> Self {
        HandleDescriptor { plugin: plugin.into(), plugin_hook: None }
    }

    pub fn with_hook(mut self, hook: Arc<dyn Plugin>) -> Self {
        self.plugin_hook = Some(hook);
        self
    }
}

/// A server-side plugin instance attached within a session (spec §3 "Handle
/// state").
pub struct Handle {
    session: Weak<Session>,
    session_id: u64,
    id: u64,
    owner_token: OwnerToken,
    transaction_manager: Arc<TransactionManager>,
    events: EventEmitter,
    plugin_hook: Option<Arc<dyn Plugin>>,
    detaching: AtomicBool,
    detached: AtomicBool,
}

impl Handle {
    pub(crate) fn new(session: &Arc<Session>, id: u64, plugin_hook: Option<Arc<dyn Plugin>>) -> Arc<Self> {
        Arc::new(Handle {
            session: Arc::downgrade(session),
            session_id: session.id(),
            id,
            owner_token: OwnerToken::new(),
            transaction_manager: session.transaction_manager_handle(),
            events: EventEmitter::new(),
            plugin_hook,
            detaching: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn owns(&self, owner: &OwnerToken) -> bool {
        self.owner_token.is(owner)
    }

    fn get_session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or_else(|| CoreError::Lifecycle("session has been dropped".to_string()))
    }

    /// `sendRequest(req, timeoutMs=0)` (spec §4.5): stamps `session_id`/
    /// `handle_id` and registers the transaction under this handle's owner.
    pub async fn send_request(&self, mut req: Envelope, timeout: Option<Duration>) -> Result<Envelope> {
        req.session_id = req.session_id.or(Some(self.session_id));
        req.handle_id = req.handle_id.or(Some(self.id));
        let session = self.get_session()?;
        session.send_request_as(req, self.owner_token.clone(), timeout).await
    }

    pub async fn message(&self, body: Value, jsep: Option<Value>) -> Result<Envelope> {
        let mut req = Envelope::new(JANUS_MESSAGE).with_field("body", body);
        if let Some(jsep) = jsep {
            req = req.with_field("jsep", jsep);
        }
        self.send_request(req, None).await
    }

    /// `trickle(candidate)` (spec §4.5): array → `candidates`, single object
    /// → `candidate`, falsy → `trickleComplete`.
    pub async fn trickle(&self, candidate: Option<Value>) -> Result<Envelope> {
        match candidate {
            None => self.trickle_complete().await,
            Some(Value::Array(items)) => {
                self.send_request(Envelope::new(JANUS_TRICKLE).with_field("candidates", Value::Array(items)), None).await
            }
            Some(single) => self.send_request(Envelope::new(JANUS_TRICKLE).with_field("candidate", single), None).await,
        }
    }

    pub async fn trickle_complete(&self) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_TRICKLE).with_field("candidate", json!({"completed": true})), None).await
    }

    pub async fn hangup(&self) -> Result<Envelope> {
        self.send_request(Envelope::new(JANUS_HANGUP), None).await
    }

    /// `detach()` (spec §4.5 + §9 open question). Sends `{janus:"detach"}`
    /// and, regardless of the server's reply, proceeds to `_signalDetach`
    /// once the request has actually gone out over the wire. Only a
    /// pre-send failure (no transport to write to, or the write itself
    /// failed) skips the local detach and surfaces as `Err`, see
    /// DESIGN.md's Open Question decisions.
    pub async fn detach(self: &Arc<Self>) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("handle already detached".to_string()));
        }
        if self.detaching.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Lifecycle("detach already in progress".to_string()));
        }

        match self.send_request(Envelope::new(JANUS_DETACH), None).await {
            Err(CoreError::Transport(_)) | Err(CoreError::Lifecycle(_)) => {
                self.detaching.store(false, Ordering::SeqCst);
                Err(CoreError::Lifecycle("detach request never reached the transport".to_string()))
            }
            _ => {
                self.signal_detach("handle detached").await;
                Ok(())
            }
        }
    }

    /// Inbound routing rules 1-2, delegated from `Session` (spec §4.5).
    pub async fn dispatch(self: &Arc<Self>, msg: Envelope) {
        let mut handled = false;

        if let Some(tx_id) = msg.transaction.clone() {
            if self.transaction_manager.is_owned_by(&tx_id, &self.owner_token) {
                match msg.janus.as_str() {
                    JANUS_ACK => {
                        if self.transaction_manager.request_of(&tx_id).as_deref() == Some(JANUS_TRICKLE) {
                            self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg.clone());
                        }
                        handled = true;
                    }
                    janus if is_definitive_response(janus) => {
                        if janus == JANUS_ERROR {
                            let (code, reason) = msg.error_code_reason();
                            self.transaction_manager.close_with_error(&tx_id, &self.owner_token, CoreError::protocol(code, reason));
                        } else {
                            let request = self.transaction_manager.request_of(&tx_id);
                            if matches!(request.as_deref(), Some(JANUS_HANGUP) | Some(JANUS_DETACH)) {
                                self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg.clone());
                            } else {
                                let prepopulated = prepopulate_plugin_data(&msg);
                                let recognized = self.invoke_plugin_hook(&msg, &prepopulated);
                                if recognized.is_none() {
                                    warn!("plugin did not recognize response for handle {}", self.id);
                                }
                                self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg.clone());
                            }
                        }
                        handled = true;
                    }
                    _ => {}
                }
            }
        }

        if handled {
            return;
        }

        match msg.janus.as_str() {
            JANUS_EVENT => {
                let prepopulated = prepopulate_plugin_data(&msg);
                match self.invoke_plugin_hook(&msg, &prepopulated) {
                    Some(plugin_event) => {
                        self.events.emit(CoreEvent::HandlePluginEvent {
                            handle_id: self.id,
                            event: plugin_event.event,
                            data: plugin_event.data,
                        });
                        if let Some(tx_id) = msg.transaction.clone() {
                            if self.transaction_manager.is_owned_by(&tx_id, &self.owner_token) {
                                self.transaction_manager.close_with_success(&tx_id, &self.owner_token, msg.clone());
                            }
                        }
                    }
                    None => {
                        if let Some(tx_id) = msg.transaction.clone() {
                            self.transaction_manager.close_with_error(&tx_id, &self.owner_token, CoreError::Lifecycle("unmanaged event".to_string()));
                        }
                    }
                }
            }
            JANUS_DETACHED => self.signal_detach("detached by server").await,
            JANUS_WEBRTCUP => self.events.emit(CoreEvent::HandleWebrtcUp { handle_id: self.id }),
            JANUS_HANGUP => {
                let reason = msg.field("reason").and_then(Value::as_str).map(str::to_string);
                self.events.emit(CoreEvent::HandleHangup { handle_id: self.id, reason });
            }
            JANUS_ICE_FAILED => self.events.emit(CoreEvent::HandleIceFailed { handle_id: self.id }),
            JANUS_MEDIA => {
                let media_type = msg.field("type").and_then(Value::as_str).unwrap_or_default().to_string();
                let receiving = msg.field("receiving").and_then(Value::as_bool).unwrap_or(false);
                let mid = msg.field("mid").and_then(Value::as_str).map(str::to_string);
                let substream = msg.field("substream").and_then(Value::as_i64);
                let seconds = msg.field("seconds").and_then(Value::as_i64);
                self.events.emit(CoreEvent::HandleMedia { handle_id: self.id, media_type, receiving, mid, substream, seconds });
            }
            JANUS_SLOWLINK => {
                let uplink = msg.field("uplink").and_then(Value::as_bool).unwrap_or(false);
                let media_type = msg.field("media").and_then(Value::as_str).map(str::to_string);
                let mid = msg.field("mid").and_then(Value::as_str).map(str::to_string);
                let lost = msg.field("lost").and_then(Value::as_i64).unwrap_or(0);
                self.events.emit(CoreEvent::HandleSlowlink { handle_id: self.id, uplink, media_type, mid, lost });
            }
            JANUS_TRICKLE => {
                let candidate = msg.field("candidate").cloned();
                let completed = candidate.as_ref().and_then(|c| c.get("completed")).and_then(Value::as_bool).unwrap_or(false);
                if completed {
                    self.events.emit(CoreEvent::HandleTrickle(HandleTrickleEvent::Completed { handle_id: self.id }));
                } else if let Some(candidate) = candidate {
                    let sdp_mid = msg.field("sdpMid").and_then(Value::as_str).map(str::to_string);
                    let sdp_mline_index = msg.field("sdpMLineIndex").and_then(Value::as_i64);
                    self.events.emit(CoreEvent::HandleTrickle(HandleTrickleEvent::Candidate {
                        handle_id: self.id,
                        sdp_mid,
                        sdp_mline_index,
                        candidate,
                    }));
                }
            }
            other => warn!("unknown message type '{other}' for handle {}", self.id),
        }
    }

    fn invoke_plugin_hook(&self, raw: &Envelope, prepopulated: &Value) -> Option<PluginEvent> {
        self.plugin_hook.as_ref().and_then(|hook| hook.handle_message(raw, prepopulated))
    }

    /// `_signalDetach` (spec §4.5 teardown). Idempotent.
    pub(crate) async fn signal_detach(self: &Arc<Self>, reason: &str) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transaction_manager.close_all_with_error(Some(&self.owner_token), reason);
        self.events.emit(CoreEvent::HandleDetached { handle_id: self.id });
    }
}

/// `jsep` pre-population helper (spec §4.5: "If a message carries jsep, the
/// helper pre-populates data.jsep and copies jsep.e2ee if boolean").
fn prepopulate_plugin_data(raw: &Envelope) -> Value {
    let mut data = json!({});
    if let Some(jsep) = raw.field("jsep") {
        data["jsep"] = jsep.clone();
        if let Some(e2ee) = jsep.get("e2ee").and_then(Value::as_bool) {
            data["e2ee"] = json!(e2ee);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepopulate_lifts_jsep_and_e2ee() {
        let msg: Envelope = serde_json::from_str(
            r#"{"janus":"event","jsep":{"type":"offer","sdp":"v=0","e2ee":true}}"#,
        )
        .unwrap();
        let data = prepopulate_plugin_data(&msg);
        assert_eq!(data["jsep"]["type"], "offer");
        assert_eq!(data["e2ee"], true);
    }

    #[test]
    fn prepopulate_is_empty_without_jsep() {
        let msg = Envelope::new(JANUS_EVENT);
        let data = prepopulate_plugin_data(&msg);
        assert_eq!(data, json!({}));
    }
}
