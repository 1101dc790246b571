use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::capture::counters::{ByteCounters, CounterSnapshot};
use crate::models::sample::{InterfaceSample, ProcessTrafficSample, TickReport};
use crate::models::session::{NewRecord, SessionId};
use crate::store::SessionStore;
use crate::utils::error::{AppError, AppResult};

/// Capacity of the report channel; slow subscribers lose the oldest reports
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// Everything one tick produced
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub report: TickReport,
    pub record: NewRecord,
}

/// Turn one drained window into the samples and the record to persist
///
/// `window_secs` is the measured length of the window, not the nominal one.
pub fn build_tick(
    snapshot: CounterSnapshot,
    session_id: SessionId,
    time: DateTime<Utc>,
    window_secs: f64,
    store_degraded: bool,
) -> TickOutput {
    let window = if window_secs > 0.0 { window_secs } else { 1.0 };
    let rate = |bytes: u64| bytes as f64 / window;

    let interface = InterfaceSample {
        time,
        in_rate: rate(snapshot.total_in),
        out_rate: rate(snapshot.total_out),
    };

    let mut processes: Vec<ProcessTrafficSample> = snapshot
        .per_process
        .iter()
        .map(|(name, bytes)| ProcessTrafficSample {
            process_name: name.clone(),
            pid: bytes.pid,
            in_rate: rate(bytes.inbound),
            out_rate: rate(bytes.outbound),
        })
        .collect();
    processes.sort_by(|a, b| {
        (b.in_rate + b.out_rate)
            .total_cmp(&(a.in_rate + a.out_rate))
            .then_with(|| a.process_name.cmp(&b.process_name))
    });

    let had_traffic = snapshot.total_in + snapshot.total_out > 0;
    let record = match (&snapshot.last_flow, had_traffic) {
        (Some(flow), true) => NewRecord {
            in_rate: interface.in_rate,
            out_rate: interface.out_rate,
            in_bytes: snapshot.total_in,
            out_bytes: snapshot.total_out,
            src_addr: Some(flow.src_addr.to_string()),
            dst_addr: Some(flow.dst_addr.to_string()),
            process_name: Some(flow.process_name.clone()),
            protocol: Some(flow.protocol),
            record_time: time,
        },
        _ => NewRecord {
            in_rate: interface.in_rate,
            out_rate: interface.out_rate,
            in_bytes: snapshot.total_in,
            out_bytes: snapshot.total_out,
            ..NewRecord::idle(time)
        },
    };

    TickOutput {
        report: TickReport {
            session_id,
            interface,
            processes,
            last_flow: snapshot.last_flow,
            window_secs: window,
            store_degraded,
        },
        record,
    }
}

/// Ticks the interval dropped between two fires `elapsed` apart
///
/// Overrunning ticks are skipped rather than queued, so the next fire lands on
/// the following period boundary.
pub fn skipped_ticks(elapsed: Duration, period: Duration) -> u64 {
    if period.is_zero() {
        return 0;
    }
    let periods = (elapsed.as_secs_f64() / period.as_secs_f64()).round() as u64;
    periods.saturating_sub(1)
}

/// Wait up to `limit` for in-flight record writes, then abort the rest
///
/// Returns how many writes were abandoned.
async fn flush_writes(mut pending: Vec<JoinHandle<()>>, limit: Duration) -> usize {
    let flush = async {
        for write in pending.iter_mut() {
            let _ = write.await;
        }
    };
    if tokio::time::timeout(limit, flush).await.is_ok() {
        return 0;
    }

    let mut abandoned = 0;
    for write in &pending {
        if !write.is_finished() {
            write.abort();
            abandoned += 1;
        }
    }
    abandoned
}

/// Counters shared between the scheduler and its tick task
#[derive(Debug, Default)]
struct TickStats {
    ticks: AtomicU64,
    skipped: AtomicU64,
}

struct RunningSession {
    session_id: SessionId,
    cancel: watch::Sender<bool>,
    /// Resolves to the record writes still in flight when the loop exits
    task: JoinHandle<Vec<JoinHandle<()>>>,
}

/// Drains the byte counters on a fixed period and fans the result out
pub struct AggregationScheduler {
    counters: Arc<ByteCounters>,
    store: SessionStore,
    reports: broadcast::Sender<TickReport>,
    tick_interval: Duration,
    flush_timeout: Duration,
    state: SchedulerState,
    running: Option<RunningSession>,
    stats: Arc<TickStats>,
}

impl AggregationScheduler {
    pub fn new(
        counters: Arc<ByteCounters>,
        store: SessionStore,
        tick_interval: Duration,
        flush_timeout: Duration,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            counters,
            store,
            reports,
            tick_interval,
            flush_timeout,
            state: SchedulerState::Idle,
            running: None,
            stats: Arc::new(TickStats::default()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Session the ticks are currently written to
    pub fn session_id(&self) -> Option<SessionId> {
        self.running.as_ref().map(|r| r.session_id)
    }

    /// Receive every report from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.reports.subscribe()
    }

    pub fn ticks(&self) -> u64 {
        self.stats.ticks.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    /// Begin ticking for `session_id`, stopping any session already running
    pub async fn start(&mut self, session_id: SessionId) -> AppResult<()> {
        if self.state == SchedulerState::Running {
            info!("Aggregation already running, stopping the previous session first");
            self.stop().await?;
        }

        // Bytes counted before this session belong to nobody
        let stale = self.counters.drain_and_reset();
        if stale.total_in + stale.total_out > 0 {
            debug!("Discarded {} bytes counted before session {}", stale.total_in + stale.total_out, session_id);
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let started = Instant::now();
        let task = tokio::spawn(run_ticks(
            Arc::clone(&self.counters),
            self.store.clone(),
            self.reports.clone(),
            Arc::clone(&self.stats),
            session_id,
            started,
            self.tick_interval,
            cancel_rx,
        ));

        self.running = Some(RunningSession {
            session_id,
            cancel,
            task,
        });
        self.state = SchedulerState::Running;
        info!("Aggregation started for session {} every {:?}", session_id, self.tick_interval);
        Ok(())
    }

    /// Cancel the tick and wait, bounded, for in-flight record writes
    pub async fn stop(&mut self) -> AppResult<()> {
        let Some(running) = self.running.take() else {
            return Err(AppError::NotRunning);
        };
        self.state = SchedulerState::Stopping;

        let _ = running.cancel.send(true);
        let pending = match running.task.await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Aggregation task ended abnormally: {}", e);
                Vec::new()
            }
        };

        if !pending.is_empty() {
            debug!("Flushing {} in-flight record writes", pending.len());
            let abandoned = flush_writes(pending, self.flush_timeout).await;
            if abandoned > 0 {
                warn!(
                    "{} record writes still pending after {:?}, aborted",
                    abandoned, self.flush_timeout
                );
            }
        }

        self.state = SchedulerState::Idle;
        info!("Aggregation stopped for session {}", running.session_id);
        Ok(())
    }
}

async fn run_ticks(
    counters: Arc<ByteCounters>,
    store: SessionStore,
    reports: broadcast::Sender<TickReport>,
    stats: Arc<TickStats>,
    session_id: SessionId,
    started: Instant,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut ticker = interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_tick = started;
    let mut pending: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_tick);
        last_tick = now;

        let skipped = skipped_ticks(elapsed, period);
        if skipped > 0 {
            stats.skipped.fetch_add(skipped, Ordering::Relaxed);
            debug!("Skipped {} aggregation ticks", skipped);
        }

        let output = build_tick(
            counters.drain_and_reset(),
            session_id,
            Utc::now(),
            elapsed.as_secs_f64(),
            store.is_degraded(),
        );
        stats.ticks.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Tick: in {:.1} B/s, out {:.1} B/s, {} processes over {:.3}s",
            output.report.interface.in_rate,
            output.report.interface.out_rate,
            output.report.processes.len(),
            output.report.window_secs
        );

        // No receiver is not an error
        let _ = reports.send(output.report);

        pending.retain(|write| !write.is_finished());
        let store = store.clone();
        pending.push(tokio::spawn(async move {
            // Failures are counted and logged by the store
            let _ = store.append_record(session_id, output.record).await;
        }));
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::counters::UNKNOWN_PROCESS;
    use crate::models::flow::{Direction, Flow, ProcessIdentity, Protocol};

    fn outbound(size: u64) -> Flow {
        Flow {
            src_addr: "192.168.1.10".parse().unwrap(),
            dst_addr: "93.184.216.34".parse().unwrap(),
            src_port: Some(50000),
            dst_port: Some(443),
            protocol: Protocol::Tcp,
            direction: Direction::Outbound,
            size,
        }
    }

    #[test]
    fn ten_outbound_packets_make_one_sample() {
        let counters = ByteCounters::new();
        for _ in 0..10 {
            counters.record_packet(&outbound(100), None);
        }

        let output = build_tick(counters.drain_and_reset(), 1, Utc::now(), 1.0, false);
        assert_eq!(output.report.interface.out_rate, 1000.0);
        assert_eq!(output.report.interface.in_rate, 0.0);
        assert_eq!(output.record.out_bytes, 1000);
        assert_eq!(output.record.protocol, Some(Protocol::Tcp));
        assert_eq!(output.record.process_name.as_deref(), Some(UNKNOWN_PROCESS));
    }

    #[test]
    fn rates_use_the_measured_window() {
        let counters = ByteCounters::new();
        for _ in 0..10 {
            counters.record_packet(&outbound(100), None);
        }

        let output = build_tick(counters.drain_and_reset(), 1, Utc::now(), 1.25, false);
        assert_eq!(output.report.interface.out_rate, 800.0);
        assert_eq!(output.report.window_secs, 1.25);
    }

    #[test]
    fn processes_are_sorted_by_total_rate() {
        let counters = ByteCounters::new();
        let small = ProcessIdentity { pid: 1, name: "small".into() };
        let big = ProcessIdentity { pid: 2, name: "big".into() };
        counters.record_packet(&outbound(10), Some(&small));
        counters.record_packet(&outbound(900), Some(&big));

        let output = build_tick(counters.drain_and_reset(), 1, Utc::now(), 1.0, false);
        let names: Vec<_> = output.report.processes.iter().map(|p| p.process_name.as_str()).collect();
        assert_eq!(names, vec!["big", "small"]);
        assert_eq!(output.report.processes[0].pid, Some(2));
    }

    #[test]
    fn idle_window_yields_an_idle_record() {
        let counters = ByteCounters::new();
        counters.record_packet(&outbound(100), None);
        counters.drain_and_reset();

        let output = build_tick(counters.drain_and_reset(), 1, Utc::now(), 1.0, true);
        assert_eq!(output.record.in_rate, 0.0);
        assert_eq!(output.record.out_rate, 0.0);
        assert_eq!(output.record.protocol, None);
        // The diagnostic last flow survives the drain
        assert!(output.report.last_flow.is_some());
        assert!(output.report.store_degraded);
    }

    #[tokio::test]
    async fn ticks_until_stopped_and_persists_every_window() {
        let store = SessionStore::open_in_memory().unwrap();
        let counters = Arc::new(ByteCounters::new());
        let mut scheduler = AggregationScheduler::new(
            Arc::clone(&counters),
            store.clone(),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let mut reports = scheduler.subscribe();

        let session = store.start_session("test0").await.unwrap();
        scheduler.start(session).await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        counters.record_packet(&outbound(500), None);
        let report = reports.recv().await.unwrap();
        assert_eq!(report.session_id, session);

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let persisted = store.get_records(session, None).await.unwrap();
        assert!(persisted.len() as u64 >= 2);
        assert_eq!(persisted.len() as u64, scheduler.ticks());
        assert_eq!(persisted.iter().map(|r| r.out_bytes).sum::<u64>(), 500);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get_records(session, None).await.unwrap().len(), persisted.len());
    }

    #[tokio::test]
    async fn starting_again_stops_the_previous_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut scheduler = AggregationScheduler::new(
            Arc::new(ByteCounters::new()),
            store.clone(),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );

        let first = store.start_session("test0").await.unwrap();
        let second = store.start_session("test0").await.unwrap();
        scheduler.start(first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.start(second).await.unwrap();
        assert_eq!(scheduler.session_id(), Some(second));

        let frozen = store.get_records(first, None).await.unwrap().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await.unwrap();

        assert_eq!(store.get_records(first, None).await.unwrap().len(), frozen);
        assert!(!store.get_records(second, None).await.unwrap().is_empty());
    }

    #[test]
    fn overrun_counts_the_dropped_ticks() {
        let period = Duration::from_millis(1000);
        assert_eq!(skipped_ticks(Duration::from_millis(1000), period), 0);
        assert_eq!(skipped_ticks(Duration::from_millis(1040), period), 0);
        assert_eq!(skipped_ticks(Duration::from_millis(1600), period), 1);
        assert_eq!(skipped_ticks(Duration::from_millis(3100), period), 2);
        assert_eq!(skipped_ticks(Duration::ZERO, period), 0);
        assert_eq!(skipped_ticks(Duration::from_secs(5), Duration::ZERO), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_starved_tick_fires_once_and_records_the_skips() {
        let store = SessionStore::open_in_memory().unwrap();
        let counters = Arc::new(ByteCounters::new());
        let period = Duration::from_secs(1);
        let mut scheduler = AggregationScheduler::new(Arc::clone(&counters), store.clone(), period, Duration::from_secs(5));
        let mut reports = scheduler.subscribe();

        let session = store.start_session("test0").await.unwrap();
        scheduler.start(session).await.unwrap();
        counters.record_packet(&outbound(3100), None);

        tokio::time::advance(Duration::from_millis(3100)).await;
        let report = reports.recv().await.unwrap();

        assert_eq!(scheduler.ticks(), 1);
        assert_eq!(scheduler.ticks_skipped(), 2);
        // The one window covers the whole stall
        assert!((report.window_secs - 3.1).abs() < 0.05);
        assert!((report.interface.out_rate - 1000.0).abs() < 20.0);
        assert!(reports.try_recv().is_err());

        scheduler.stop().await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_past_the_flush_limit_are_aborted() {
        let landed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let quick = tokio::spawn(async {});
        let slow = {
            let landed = Arc::clone(&landed);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                landed.store(true, Ordering::SeqCst);
            })
        };

        let abandoned = flush_writes(vec![quick, slow], Duration::from_millis(50)).await;
        assert_eq!(abandoned, 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!landed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stopping_when_idle_is_reported() {
        let mut scheduler = AggregationScheduler::new(
            Arc::new(ByteCounters::new()),
            SessionStore::open_in_memory().unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(scheduler.stop().await, Err(AppError::NotRunning)));
    }
}
