//! Engine configuration types.
//!
//! [`DriverConfig`] holds process-level settings (where to listen, where the
//! driver keeps its files).  [`EngineSettings`] holds the protocol engine's
//! tuning knobs and can be loaded from an optional TOML file.
//!
//! Neither struct reads the environment itself; `main.rs` fills them from CLI
//! arguments and environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-level configuration of a driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Address the WebSocket server binds to.
    pub bind_addr: SocketAddr,

    /// Directory where the driver persists its own configuration.  The engine
    /// never writes here; it only passes the path on to driver code.
    pub config_dir: PathBuf,

    /// Explicit `ws://` or `wss://` URL to advertise instead of host/port.
    pub driver_url: Option<String>,

    /// Skip the service announcement (for example when the controller is
    /// configured with the driver address directly).
    pub disable_publish: bool,

    pub engine: EngineSettings,
}

impl Default for DriverConfig {
    /// | Field           | Default        |
    /// |-----------------|----------------|
    /// | bind_addr       | `0.0.0.0:9090` |
    /// | config_dir      | `.`            |
    /// | driver_url      | none           |
    /// | disable_publish | `false`        |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            config_dir: PathBuf::from("."),
            driver_url: None,
            disable_publish: false,
            engine: EngineSettings::default(),
        }
    }
}

impl DriverConfig {
    /// URL controllers should use to reach the driver: the explicit
    /// `driver_url` if it is a `ws://` or `wss://` URL, otherwise
    /// `ws://<listen address>`.
    pub fn websocket_url(&self, listen_addr: SocketAddr) -> String {
        match self.driver_url.as_deref() {
            Some(url) if url.starts_with("ws://") || url.starts_with("wss://") => url.to_string(),
            _ => format!("ws://{listen_addr}"),
        }
    }
}

/// Tuning knobs for the protocol engine.
///
/// ```toml
/// setup_terminal_hold_ms = 1000
/// outbound_queue_capacity = 256
/// voice_queue_capacity = 32
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How long a connection pauses after a setup flow reached `OK` or
    /// `ERROR`, so the configurator can render the final page.
    pub setup_terminal_hold_ms: u64,

    /// Frames that may wait for one slow connection before it is dropped.
    pub outbound_queue_capacity: usize,

    /// Audio chunks buffered per voice session before new chunks are dropped.
    pub voice_queue_capacity: usize,
}

impl EngineSettings {
    pub fn setup_terminal_hold(&self) -> Duration {
        Duration::from_millis(self.setup_terminal_hold_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            setup_terminal_hold_ms: 1_000,
            outbound_queue_capacity: 256,
            voice_queue_capacity: 32,
        }
    }
}
