use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::flow::LastFlow;

/// Interface-wide rates for one aggregation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSample {
    pub time: DateTime<Utc>,
    /// Bytes per second received
    pub in_rate: f64,
    /// Bytes per second sent
    pub out_rate: f64,
}

/// Per-process rates for one aggregation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTrafficSample {
    pub process_name: String,
    pub pid: Option<u32>,
    pub in_rate: f64,
    pub out_rate: f64,
}

/// Everything one aggregation tick hands to the display boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub session_id: i64,
    pub interface: InterfaceSample,
    pub processes: Vec<ProcessTrafficSample>,
    pub last_flow: Option<LastFlow>,
    /// Length of the window the rates were computed over
    pub window_secs: f64,
    /// Set once record writes keep failing
    pub store_degraded: bool,
}

/// Cumulative capture statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    /// Packets read from the capture handle
    pub packets_seen: u64,

    /// Packets that could not be parsed
    pub packets_unparsed: u64,

    /// Packets attributed to a known process
    pub packets_attributed: u64,

    /// Packets booked under the unknown process
    pub packets_unknown: u64,

    /// Ticks skipped because the previous one overran
    pub ticks_skipped: u64,

    /// Record writes that failed
    pub failed_writes: u64,
}
