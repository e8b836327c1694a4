// src/config.rs

//! Connection configuration and the CLI flags this core consumes.
//!
//! Loading this struct from a file or environment is left to the embedding
//! application (spec §1 Non-goals), this module only defines the shape and
//! its defaults.

use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

fn default_retry_time_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_ws_handshake_timeout_ms() -> u64 {
    5000
}

/// One configured signaling server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAddress {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Label this address is selectable by via `Config::server_key`
    /// (spec §6 `server_key`). Absent for single-address configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ServerAddress {
    pub fn new(url: impl Into<String>) -> Self {
        ServerAddress { url: url.into(), apisecret: None, token: None, key: None }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// WebSocket transport socket options (spec §6 `ws_options`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsOptions {
    #[serde(default = "default_ws_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for WsOptions {
    fn default() -> Self {
        WsOptions { handshake_timeout_ms: default_ws_handshake_timeout_ms() }
    }
}

/// Connection configuration (spec §3 `ServerAddress` list + §6 config
/// object). Invariant: `addresses` is non-empty and every entry has a
/// non-empty `url`, enforced by `Config::validate`, not by the type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub addresses: Vec<ServerAddress>,

    #[serde(default)]
    pub server_key: Option<ServerKey>,

    #[serde(default = "default_retry_time_secs")]
    pub retry_time_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub is_admin: bool,

    #[serde(default)]
    pub ws_options: WsOptions,
}

/// Either a positional index or a string label into a multi-server
/// configuration (spec §6 `server_key`); a missing key falls back to index 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerKey {
    Index(usize),
    Label(String),
}

impl Config {
    pub fn new(addresses: Vec<ServerAddress>) -> Self {
        Config {
            addresses,
            server_key: None,
            retry_time_secs: default_retry_time_secs(),
            max_retries: default_max_retries(),
            is_admin: false,
            ws_options: WsOptions::default(),
        }
    }

    /// Validates the non-empty-list / non-empty-url invariant of spec §3.
    pub fn validate(&self) -> Result<(), String> {
        if self.addresses.is_empty() {
            return Err("config must carry at least one server address".to_string());
        }
        if self.addresses.iter().any(|a| a.url.is_empty()) {
            return Err("every server address must have a non-empty url".to_string());
        }
        Ok(())
    }

    /// Resolves `server_key` to a starting index into `addresses` (spec §6:
    /// "the entry-point accepts either a numeric index or a string key;
    /// missing key falls back to index 0"). An out-of-range index or an
    /// unmatched label also falls back to 0.
    pub fn resolve_initial_index(&self) -> usize {
        match &self.server_key {
            None => 0,
            Some(ServerKey::Index(i)) if *i < self.addresses.len() => *i,
            Some(ServerKey::Index(_)) => 0,
            Some(ServerKey::Label(label)) => self
                .addresses
                .iter()
                .position(|a| a.key.as_deref() == Some(label.as_str()))
                .unwrap_or(0),
        }
    }
}

/// Maps `--janode-log`'s string values (with the `verb`/`warn` aliases) onto
/// a `log::LevelFilter`.
pub fn parse_log_level(raw: &str) -> Result<LevelFilter, String> {
    match raw {
        "none" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warning" | "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "verbose" | "verb" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        other => Err(format!("unrecognized log level '{other}'")),
    }
}

/// CLI flags this core consumes directly (spec §6); an embedding binary's
/// own `clap::Parser` can `#[command(flatten)]` this in.
#[derive(Debug, Clone, Parser)]
pub struct CliArgs {
    /// Log verbosity: none|error|warning|info|verbose|debug (verb/warn
    /// accepted as aliases for verbose/warning).
    #[arg(long = "janode-log", default_value = "info")]
    pub janode_log: String,

    /// Enable periodic transaction-table size logging every 5 seconds.
    #[arg(long = "debug-tx", default_value_t = false)]
    pub debug_tx: bool,
}

impl CliArgs {
    pub fn log_level(&self) -> Result<LevelFilter, String> {
        parse_log_level(&self.janode_log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_address_list() {
        let cfg = Config::new(vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_url() {
        let cfg = Config::new(vec![ServerAddress::new("")]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        let cfg = Config::new(vec![ServerAddress::new("ws://localhost:8188")]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::new(vec![ServerAddress::new("ws://localhost:8188")]);
        assert_eq!(cfg.retry_time_secs, 10);
        assert_eq!(cfg.max_retries, 5);
        assert!(!cfg.is_admin);
        assert_eq!(cfg.ws_options.handshake_timeout_ms, 5000);
    }

    #[test]
    fn log_level_aliases() {
        assert_eq!(parse_log_level("verb").unwrap(), LevelFilter::Trace);
        assert_eq!(parse_log_level("warn").unwrap(), LevelFilter::Warn);
        assert!(parse_log_level("bogus").is_err());
    }

    #[test]
    fn server_key_resolves_by_label() {
        let mut cfg = Config::new(vec![
            ServerAddress::new("ws://a").with_key("primary"),
            ServerAddress::new("ws://b").with_key("backup"),
        ]);
        cfg.server_key = Some(ServerKey::Label("backup".to_string()));
        assert_eq!(cfg.resolve_initial_index(), 1);
    }

    #[test]
    fn server_key_falls_back_to_zero_when_unmatched() {
        let mut cfg = Config::new(vec![ServerAddress::new("ws://a")]);
        cfg.server_key = Some(ServerKey::Label("missing".to_string()));
        assert_eq!(cfg.resolve_initial_index(), 0);

        cfg.server_key = Some(ServerKey::Index(9));
        assert_eq!(cfg.resolve_initial_index(), 0);
    }
}
