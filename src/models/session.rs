use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::flow::Protocol;

/// Identifier of a persisted capture session
pub type SessionId = i64;

/// One bounded capture run on one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub id: SessionId,
    pub interface_name: String,
    pub start_time: DateTime<Utc>,
    /// None while the session is active
    pub end_time: Option<DateTime<Utc>>,
    pub avg_in: f64,
    pub avg_out: f64,
    pub max_in: f64,
    pub max_out: f64,
    pub total_in_bytes: u64,
    pub total_out_bytes: u64,
    pub record_count: u64,
}

impl CaptureSession {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// One persisted aggregation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub in_rate: f64,
    pub out_rate: f64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub process_name: Option<String>,
    pub protocol: Option<Protocol>,
    pub record_time: DateTime<Utc>,
}

/// A record about to be appended to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub in_rate: f64,
    pub out_rate: f64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub src_addr: Option<String>,
    pub dst_addr: Option<String>,
    pub process_name: Option<String>,
    pub protocol: Option<Protocol>,
    pub record_time: DateTime<Utc>,
}

impl NewRecord {
    /// A window with no traffic at all
    pub fn idle(record_time: DateTime<Utc>) -> Self {
        Self {
            in_rate: 0.0,
            out_rate: 0.0,
            in_bytes: 0,
            out_bytes: 0,
            src_addr: None,
            dst_addr: None,
            process_name: None,
            protocol: None,
            record_time,
        }
    }
}

/// Conjunctive filter over a session's records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Accepted protocols; empty means any
    pub protocols: BTreeSet<Protocol>,

    /// Exact process name
    pub process_name: Option<String>,

    /// Minimum inbound rate in bytes per second
    pub min_in_rate: Option<f64>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty() && self.process_name.is_none() && self.min_in_rate.is_none()
    }

    /// Check a record against every predicate
    pub fn matches(&self, record: &TrafficRecord) -> bool {
        if !self.protocols.is_empty() {
            match record.protocol {
                Some(protocol) if self.protocols.contains(&protocol) => {}
                _ => return false,
            }
        }

        if let Some(name) = &self.process_name {
            if record.process_name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }

        if let Some(min) = self.min_in_rate {
            if record.in_rate < min {
                return false;
            }
        }

        true
    }
}

/// Result of ending a session
#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    Ended(CaptureSession),
    NotFound,
}
