//! Bus configuration.
//!
//! ```yaml
//! root_url: "ipc:///tmp/streambus"
//! frame_capacity: 65536
//! recv_timeout_ms: 100
//! request_timeout_ms: 30000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BusError;
use crate::frame::DEFAULT_FRAME_CAPACITY;
use crate::transport::SocketOptions;

/// Tunables for a bus endpoint. All fields default sensibly; a config
/// file only needs the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Root URL endpoint names are appended to.
    pub root_url: String,
    /// Maximum frame size in bytes.
    pub frame_capacity: usize,
    /// Receive-poll timeout for background loops, in milliseconds.
    pub recv_timeout_ms: i32,
    /// Reply timeout for blocking command sends, in milliseconds.
    pub request_timeout_ms: i32,
    /// Send timeout for blocking command sends, in milliseconds.
    pub send_timeout_ms: i32,
    /// Outbound high-water mark for publish sockets.
    pub send_hwm: i32,
    /// Initial reconnect interval, in milliseconds.
    pub reconnect_ivl_ms: i32,
    /// Reconnect interval cap, in milliseconds.
    pub reconnect_ivl_max_ms: i32,
}

impl Default for BusConfig {
    fn default() -> Self {
        let options = SocketOptions::default();
        Self {
            root_url: "ipc:///tmp/streambus".to_owned(),
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            recv_timeout_ms: options.recv_timeout_ms,
            request_timeout_ms: options.request_timeout_ms,
            send_timeout_ms: options.send_timeout_ms,
            send_hwm: options.send_hwm,
            reconnect_ivl_ms: options.reconnect_ivl_ms,
            reconnect_ivl_max_ms: options.reconnect_ivl_max_ms,
        }
    }
}

impl BusConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> crate::Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BusError::Configuration(format!("invalid config: {e}")))
    }

    /// The socket tuning derived from this configuration.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            recv_timeout_ms: self.recv_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            send_timeout_ms: self.send_timeout_ms,
            send_hwm: self.send_hwm,
            reconnect_ivl_ms: self.reconnect_ivl_ms,
            reconnect_ivl_max_ms: self.reconnect_ivl_max_ms,
        }
    }
}
