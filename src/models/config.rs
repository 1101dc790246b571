use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Network interface to capture from
    pub interface: Option<String>,

    /// BPF filter expression
    pub filter: Option<String>,

    /// Enable promiscuous mode
    pub promiscuous: bool,

    /// Bytes captured per packet
    pub snaplen: i32,

    /// Read timeout of the capture handle; bounds how long a stop can take
    pub read_timeout_ms: i32,

    /// Aggregation window
    pub tick_interval: Duration,

    /// Connection table refresh cadence
    pub refresh_interval: Duration,

    /// Bounded wait for background contexts on shutdown
    pub shutdown_timeout: Duration,

    /// SQLite database holding sessions and records
    pub database_path: PathBuf,

    /// Consecutive failed writes before the store reports degraded
    pub degraded_after_failures: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            interface: None,
            filter: None,
            promiscuous: false,
            snaplen: 65535,
            read_timeout_ms: 250,
            tick_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            database_path: PathBuf::from("nettally.db"),
            degraded_after_failures: 3,
        }
    }
}
