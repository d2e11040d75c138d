//! Server configuration.
//!
//! Every field has a default, so a JSON document only needs the fields it
//! changes:
//!
//! ```
//! use jt808_core::config::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{
//!     "tcp_bind": "0.0.0.0:6808",
//!     "idle_timeout_ms": 120000
//! }"#).unwrap();
//!
//! assert_eq!(config.idle_timeout().as_secs(), 120);
//! assert_eq!(config.fragment_timeout().as_secs(), 30);
//! assert!(config.udp_bind.is_none());
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fragment::{DEFAULT_FRAGMENT_TIMEOUT, DEFAULT_MAX_FRAGMENT_PARTS};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::session::DEFAULT_IDLE_TIMEOUT;
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default interval between session and fragment sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Default bound on messages queued for one connection's handler.
pub const DEFAULT_HANDLER_QUEUE_CAPACITY: usize = 256;

/// Default number of tasks receiving on the UDP socket.
pub const DEFAULT_UDP_WORKERS: usize = 4;

/// Default cap on concurrently running UDP handler calls.
pub const DEFAULT_MAX_UDP_HANDLERS: usize = 256;

/// Settings for [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address; no TCP listener when absent.
    pub tcp_bind: Option<SocketAddr>,
    /// UDP bind address; no UDP socket when absent.
    pub udp_bind: Option<SocketAddr>,
    pub idle_timeout_ms: u64,
    pub fragment_timeout_ms: u64,
    /// Largest part count a fragmented message may announce.
    pub max_fragment_parts: u16,
    pub sweep_interval_ms: u64,
    /// Largest frame buffered from a TCP stream before it is discarded.
    pub max_frame_size: usize,
    /// Messages waiting for a connection's handler; overflow closes the connection.
    pub handler_queue_capacity: usize,
    pub udp_workers: usize,
    pub max_udp_handlers: usize,
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_bind: None,
            udp_bind: None,
            idle_timeout_ms: duration_ms(DEFAULT_IDLE_TIMEOUT),
            fragment_timeout_ms: duration_ms(DEFAULT_FRAGMENT_TIMEOUT),
            max_fragment_parts: DEFAULT_MAX_FRAGMENT_PARTS,
            sweep_interval_ms: duration_ms(DEFAULT_SWEEP_INTERVAL),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handler_queue_capacity: DEFAULT_HANDLER_QUEUE_CAPACITY,
            udp_workers: DEFAULT_UDP_WORKERS,
            max_udp_handlers: DEFAULT_MAX_UDP_HANDLERS,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: duration_ms(DEFAULT_BACKPRESSURE_TIMEOUT),
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ServerConfig {
    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Writer task settings for each TCP connection.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout(),
        }
    }
}
