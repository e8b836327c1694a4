// src/events.rs

//! Typed publish/subscribe replacement for the source's `EventEmitter`
//! (spec §9 design note). One `tokio::sync::broadcast` channel backs each
//! Connection/Session/Handle instance; subscribers get a `Receiver<CoreEvent>`
//! and filter for the variants they care about.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Every asynchronous notification this core can emit, per spec §6.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ConnectionClosed,
    ConnectionError,
    SessionDestroyed { session_id: u64 },
    HandleDetached { handle_id: u64 },
    /// A plugin-recognized `event` message (spec §4.5 plugin hook contract):
    /// the payload a `Plugin::handle_message` implementation returned.
    HandlePluginEvent {
        handle_id: u64,
        event: Option<String>,
        data: serde_json::Value,
    },
    HandleWebrtcUp { handle_id: u64 },
    HandleHangup { handle_id: u64, reason: Option<String> },
    HandleIceFailed { handle_id: u64 },
    HandleMedia {
        handle_id: u64,
        media_type: String,
        receiving: bool,
        mid: Option<String>,
        substream: Option<i64>,
        seconds: Option<i64>,
    },
    HandleSlowlink {
        handle_id: u64,
        uplink: bool,
        media_type: Option<String>,
        mid: Option<String>,
        lost: i64,
    },
    HandleTrickle(HandleTrickleEvent),
}

/// Payload for `CoreEvent::HandleTrickle`: either an ICE candidate or the
/// completion marker (spec §4.5 trickle routing).
#[derive(Debug, Clone)]
pub enum HandleTrickleEvent {
    Completed { handle_id: u64 },
    Candidate {
        handle_id: u64,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<i64>,
        candidate: serde_json::Value,
    },
}

/// A per-instance event bus. Cloning shares the underlying channel (cheap,
/// `broadcast::Sender` is internally an `Arc`).
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventEmitter { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Best-effort emit: a `SendError` only means there are currently no
    /// subscribers, which is not an error condition for the emitter itself.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        emitter.emit(CoreEvent::SessionDestroyed { session_id: 42 });
        match rx.recv().await.unwrap() {
            CoreEvent::SessionDestroyed { session_id } => assert_eq!(session_id, 42),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let emitter = EventEmitter::new();
        emitter.emit(CoreEvent::ConnectionClosed);
    }
}
