use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::models::flow::{Direction, Flow, LastFlow, ProcessIdentity};

/// Bucket for traffic whose owning process could not be resolved
pub const UNKNOWN_PROCESS: &str = "unknown";

/// Ticks a silent process stays around before it is dropped
const MAX_IDLE_TICKS: u32 = 2;

/// In/out accumulators for one process name
#[derive(Debug, Default)]
struct ProcessCounter {
    inbound: AtomicU64,
    outbound: AtomicU64,
    /// Last pid seen under this name, 0 when unknown
    pid: AtomicU32,
    idle_ticks: AtomicU32,
}

/// Bytes drained for one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessBytes {
    pub inbound: u64,
    pub outbound: u64,
    pub pid: Option<u32>,
}

/// Result of one drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    pub total_in: u64,
    pub total_out: u64,
    /// Processes with traffic this window, plus those silent for exactly one window
    pub per_process: HashMap<String, ProcessBytes>,
    pub last_flow: Option<LastFlow>,
}

/// Lock-free byte accounting shared by the capture thread and the aggregator
///
/// Every byte lands in exactly one process bucket (unresolved traffic goes to
/// [`UNKNOWN_PROCESS`]), so the interface-wide totals of a drain are the sum of
/// the buckets swapped out by that same drain. Two separate interface
/// accumulators could be swapped on either side of a concurrent write and let a
/// process outgrow the interface for one window.
#[derive(Debug, Default)]
pub struct ByteCounters {
    processes: DashMap<String, ProcessCounter>,
    last_flow: Mutex<Option<LastFlow>>,
    packets_seen: AtomicU64,
    packets_unparsed: AtomicU64,
    packets_attributed: AtomicU64,
    packets_unknown: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book one classified packet, under its process or the unknown bucket
    pub fn record_packet(&self, flow: &Flow, process: Option<&ProcessIdentity>) {
        let (inbound, outbound) = match flow.direction {
            Direction::Inbound => (flow.size, 0),
            Direction::Outbound => (0, flow.size),
            Direction::Split => (flow.size / 2, flow.size - flow.size / 2),
        };

        self.packets_seen.fetch_add(1, Ordering::Relaxed);
        match process {
            Some(_) => self.packets_attributed.fetch_add(1, Ordering::Relaxed),
            None => self.packets_unknown.fetch_add(1, Ordering::Relaxed),
        };

        let name = process.map(|p| p.name.as_str()).unwrap_or(UNKNOWN_PROCESS);
        let pid = process.map(|p| p.pid).unwrap_or(0);

        // The map guard is held across the adds so a concurrent prune cannot drop them
        if let Some(counter) = self.processes.get(name) {
            Self::add_to(&counter, inbound, outbound, pid);
        } else {
            let counter = self.processes.entry(name.to_string()).or_default();
            Self::add_to(&counter, inbound, outbound, pid);
        }

        *self.last_flow.lock() = Some(LastFlow {
            src_addr: flow.src_addr,
            dst_addr: flow.dst_addr,
            protocol: flow.protocol,
            process_name: name.to_string(),
        });
    }

    fn add_to(counter: &ProcessCounter, inbound: u64, outbound: u64, pid: u32) {
        counter.inbound.fetch_add(inbound, Ordering::SeqCst);
        counter.outbound.fetch_add(outbound, Ordering::SeqCst);
        if pid != 0 {
            counter.pid.store(pid, Ordering::Relaxed);
        }
    }

    /// Count a frame the classifier rejected
    pub fn record_unparsed(&self) -> u64 {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);
        self.packets_unparsed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Atomically take everything accumulated since the previous drain
    pub fn drain_and_reset(&self) -> CounterSnapshot {
        let mut per_process = HashMap::new();
        let mut total_in = 0u64;
        let mut total_out = 0u64;

        for entry in self.processes.iter() {
            let counter = entry.value();
            let inbound = counter.inbound.swap(0, Ordering::SeqCst);
            let outbound = counter.outbound.swap(0, Ordering::SeqCst);
            total_in += inbound;
            total_out += outbound;

            let idle = if inbound == 0 && outbound == 0 {
                counter.idle_ticks.fetch_add(1, Ordering::Relaxed) + 1
            } else {
                counter.idle_ticks.store(0, Ordering::Relaxed);
                0
            };

            // A silent process lingers with a zero sample for one extra window
            if idle < MAX_IDLE_TICKS {
                let pid = counter.pid.load(Ordering::Relaxed);
                per_process.insert(
                    entry.key().clone(),
                    ProcessBytes {
                        inbound,
                        outbound,
                        pid: (pid != 0).then_some(pid),
                    },
                );
            }
        }

        self.processes.retain(|_, counter| {
            counter.idle_ticks.load(Ordering::Relaxed) < MAX_IDLE_TICKS
                || counter.inbound.load(Ordering::SeqCst) != 0
                || counter.outbound.load(Ordering::SeqCst) != 0
        });

        CounterSnapshot {
            total_in,
            total_out,
            per_process,
            last_flow: self.last_flow.lock().clone(),
        }
    }

    pub fn packets_seen(&self) -> u64 {
        self.packets_seen.load(Ordering::Relaxed)
    }

    pub fn packets_unparsed(&self) -> u64 {
        self.packets_unparsed.load(Ordering::Relaxed)
    }

    pub fn packets_attributed(&self) -> u64 {
        self.packets_attributed.load(Ordering::Relaxed)
    }

    pub fn packets_unknown(&self) -> u64 {
        self.packets_unknown.load(Ordering::Relaxed)
    }

    /// Number of process buckets currently tracked
    pub fn tracked_processes(&self) -> usize {
        self.processes.len()
    }
}
