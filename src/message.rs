// src/message.rs

//! The wire envelope exchanged with the signaling server.
//!
//! Every outbound request and every inbound response or event is one
//! `Envelope`: a flat JSON object keyed by `janus`, carrying the routing
//! fields (`transaction`, `session_id`, `handle_id`) alongside whatever
//! verb-specific payload the message needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outbound verb: session lifecycle.
pub const JANUS_CREATE: &str = "create";
pub const JANUS_DESTROY: &str = "destroy";
/// Outbound verb: handle lifecycle.
pub const JANUS_ATTACH: &str = "attach";
pub const JANUS_DETACH: &str = "detach";
/// Outbound verb: session liveness.
pub const JANUS_KEEPALIVE: &str = "keepalive";
/// Outbound verb: plugin RPC / ICE / teardown.
pub const JANUS_MESSAGE: &str = "message";
pub const JANUS_TRICKLE: &str = "trickle";
pub const JANUS_HANGUP: &str = "hangup";
/// Outbound verb: server capabilities.
pub const JANUS_INFO: &str = "info";
/// Inbound: temporary response.
pub const JANUS_ACK: &str = "ack";
/// Inbound: definitive responses.
pub const JANUS_SUCCESS: &str = "success";
pub const JANUS_SERVER_INFO: &str = "server_info";
pub const JANUS_ERROR: &str = "error";
/// Inbound: async notifications.
pub const JANUS_EVENT: &str = "event";
pub const JANUS_DETACHED: &str = "detached";
pub const JANUS_WEBRTCUP: &str = "webrtcup";
pub const JANUS_MEDIA: &str = "media";
pub const JANUS_SLOWLINK: &str = "slowlink";
pub const JANUS_ICE_FAILED: &str = "ice-failed";
pub const JANUS_TIMEOUT: &str = "timeout";

/// Admin verbs (§6), same envelope shape as core verbs.
pub const JANUS_LIST_SESSIONS: &str = "list_sessions";
pub const JANUS_LIST_HANDLES: &str = "list_handles";
pub const JANUS_HANDLE_INFO: &str = "handle_info";
pub const JANUS_START_PCAP: &str = "start_pcap";
pub const JANUS_STOP_PCAP: &str = "stop_pcap";

/// Returns true if `janus` names a definitive (transaction-closing)
/// response, per spec §4.3/§4.4/§4.5.
pub fn is_definitive_response(janus: &str) -> bool {
    matches!(janus, JANUS_SUCCESS | JANUS_SERVER_INFO | JANUS_ERROR)
}

/// One JSON message exchanged with the server.
///
/// `extra` absorbs every field this crate does not need to inspect by name
/// (`data`, `body`, `jsep`, `candidate`, `candidates`, `plugindata`, `error`,
/// `reason`, ...) so a round trip through `Envelope` never loses information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub janus: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Envelope {
    /// Builds a bare envelope for the given verb with no routing fields set
    /// yet; callers stamp `transaction`/`session_id`/`handle_id` as needed.
    pub fn new(janus: impl Into<String>) -> Self {
        Envelope {
            janus: janus.into(),
            transaction: None,
            session_id: None,
            handle_id: None,
            sender: None,
            apisecret: None,
            admin_secret: None,
            token: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_transaction(mut self, id: impl Into<String>) -> Self {
        self.transaction = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, id: u64) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_handle_id(mut self, id: u64) -> Self {
        self.handle_id = Some(id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.extra.insert(key.into(), v);
        }
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Extracts the `{code, reason}` pair from an inbound `janus: "error"`
    /// message. Missing fields default to `0`/empty string rather than
    /// failing, since a malformed error response must still close its
    /// transaction with *some* diagnostic.
    pub fn error_code_reason(&self) -> (i64, String) {
        let code = self
            .extra
            .get("error")
            .and_then(|v| v.get("code"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let reason = self
            .extra
            .get("error")
            .and_then(|v| v.get("reason"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        (code, reason)
    }

    /// The numeric id assigned by the server in a `success` response's
    /// `data.id` field (session/handle creation).
    pub fn data_id(&self) -> Option<u64> {
        self.extra.get("data")?.get("id")?.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let env = Envelope::new(JANUS_CREATE).with_transaction("T1");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"janus\":\"create\""));
        assert!(json.contains("\"transaction\":\"T1\""));
        assert!(!json.contains("session_id"));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.janus, JANUS_CREATE);
        assert_eq!(back.transaction.as_deref(), Some("T1"));
    }

    #[test]
    fn extracts_error_code_and_reason() {
        let json = r#"{"janus":"error","transaction":"T4","session_id":1,"sender":2,"error":{"code":432,"reason":"no such room"}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.error_code_reason(), (432, "no such room".to_string()));
    }

    #[test]
    fn extracts_data_id() {
        let json = r#"{"janus":"success","transaction":"T1","data":{"id":42}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.data_id(), Some(42));
    }

    #[test]
    fn definitive_response_classification() {
        assert!(is_definitive_response(JANUS_SUCCESS));
        assert!(is_definitive_response(JANUS_SERVER_INFO));
        assert!(is_definitive_response(JANUS_ERROR));
        assert!(!is_definitive_response(JANUS_ACK));
        assert!(!is_definitive_response(JANUS_EVENT));
    }

    #[test]
    fn with_field_attaches_arbitrary_payload() {
        let env = Envelope::new(JANUS_TRICKLE).with_field("candidate", serde_json::json!({"completed": true}));
        assert_eq!(env.field("candidate").unwrap()["completed"], true);
    }
}
