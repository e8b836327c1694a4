// src/lib.rs

//! Protocol runtime for a Janus WebRTC signaling client.
//!
//! A three-level hierarchical state machine, [`connection::Connection`] →
//! [`session::Session`] → [`handle::Handle`], multiplexes concurrent
//! request/response transactions over a single bidirectional transport
//! (WebSocket or Unix datagram socket), drives periodic keepalives, and
//! dispatches asynchronous server-pushed events to the right owner.
//!
//! Plugin-specific behavior, SDP/ICE handling, and configuration loading are
//! deliberately out of scope: this crate only relays.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handle;
pub mod message;
pub mod session;
pub mod transaction;
pub mod transport;

pub use config::{CliArgs, Config, ServerAddress, ServerKey, WsOptions};
pub use connection::Connection;
pub use error::{CoreError, Result};
pub use events::{CoreEvent, HandleTrickleEvent};
pub use handle::{Handle, HandleDescriptor, Plugin, PluginEvent};
pub use message::Envelope;
pub use session::Session;
