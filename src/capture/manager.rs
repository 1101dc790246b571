use log::{debug, error, info, trace, warn};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::attribution::{spawn_refresher, ConnectionAttributionTable};
use crate::capture::aggregator::{AggregationScheduler, SchedulerState};
use crate::capture::classifier::{FlowClassifier, LinkLayer};
use crate::capture::counters::ByteCounters;
use crate::capture::interfaces::InterfaceCatalog;
use crate::capture::source::{validate_filter, FrameReader, PacketSource, ReadOutcome, SourceCloser};
use crate::models::config::AppConfig;
use crate::models::interface::InterfaceDescriptor;
use crate::models::sample::{CaptureStats, TickReport};
use crate::models::session::{EndOutcome, SessionId};
use crate::store::SessionStore;
use crate::utils::error::{AppError, AppResult};

/// Unparsed frames logged individually before going quiet
const UNPARSED_LOG_LIMIT: u64 = 10;

/// How the capture thread finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureExit {
    /// Closed by a stop request or the source ran dry
    Ended,
    /// A read failed, usually because the interface went away
    Failed(String),
}

/// Background contexts of one monitoring run
struct ActiveMonitor {
    session_id: SessionId,
    interface: String,
    closer: SourceCloser,
    capture_thread: thread::JoinHandle<()>,
    exit: watch::Receiver<Option<CaptureExit>>,
    refresher: JoinHandle<()>,
    refresher_shutdown: watch::Sender<bool>,
}

/// Long-lived service wiring capture, attribution, aggregation and storage
pub struct MonitorService {
    config: AppConfig,
    catalog: InterfaceCatalog,
    store: SessionStore,
    table: Arc<ConnectionAttributionTable>,
    counters: Arc<ByteCounters>,
    scheduler: AggregationScheduler,
    active: Option<ActiveMonitor>,
}

impl MonitorService {
    /// Open the session database and use the platform's connection enumerator
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let store = SessionStore::open(&config.database_path, config.degraded_after_failures)?;
        let table = Arc::new(ConnectionAttributionTable::for_platform());
        Ok(Self::with_parts(config, store, table))
    }

    pub fn with_parts(config: AppConfig, store: SessionStore, table: Arc<ConnectionAttributionTable>) -> Self {
        let counters = Arc::new(ByteCounters::new());
        let scheduler = AggregationScheduler::new(
            Arc::clone(&counters),
            store.clone(),
            config.tick_interval,
            config.shutdown_timeout,
        );

        Self {
            config,
            catalog: InterfaceCatalog::default(),
            store,
            table,
            counters,
            scheduler,
            active: None,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn interfaces(&self) -> &InterfaceCatalog {
        &self.catalog
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Session being recorded, if any
    pub fn active_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.session_id)
    }

    /// Whether the capture thread is still reading
    pub fn is_capturing(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.capture_thread.is_finished())
    }

    /// Resolves once the capture thread has exited on its own or been stopped
    ///
    /// The future does not borrow the service, so it can sit in a `select!`
    /// next to other shutdown triggers. Call `stop_monitoring` afterwards.
    pub fn capture_exit(&self) -> impl Future<Output = CaptureExit> + Send + 'static {
        let exit = self.active.as_ref().map(|a| a.exit.clone());

        async move {
            let Some(mut exit) = exit else {
                return CaptureExit::Ended;
            };
            let reported = exit.wait_for(Option::is_some).await.map(|e| (*e).clone());
            match reported {
                Ok(Some(outcome)) => outcome,
                Ok(None) => CaptureExit::Ended,
                Err(_) => CaptureExit::Failed("capture thread exited without reporting".to_string()),
            }
        }
    }

    /// Wait for the capture to end by itself, then tear the session down
    pub async fn wait_for_capture_end(&mut self) -> AppResult<EndOutcome> {
        match self.capture_exit().await {
            CaptureExit::Ended => info!("Capture source ended"),
            CaptureExit::Failed(reason) => warn!("Capture failed, ending the session: {}", reason),
        }
        self.stop_monitoring().await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Per-tick reports from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.scheduler.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            packets_seen: self.counters.packets_seen(),
            packets_unparsed: self.counters.packets_unparsed(),
            packets_attributed: self.counters.packets_attributed(),
            packets_unknown: self.counters.packets_unknown(),
            ticks_skipped: self.scheduler.ticks_skipped(),
            failed_writes: self.store.failed_writes(),
        }
    }

    /// Look the interface up by name and start monitoring it
    pub async fn start_monitoring_by_name(&mut self, device_name: &str, filter: Option<&str>) -> AppResult<SessionId> {
        let descriptor = match self.catalog.find(device_name) {
            Some(descriptor) => descriptor,
            None => {
                // The cache may predate a hotplugged device
                self.catalog.refresh();
                self.catalog
                    .find(device_name)
                    .ok_or_else(|| AppError::InterfaceUnavailable(format!("{} does not exist", device_name)))?
            }
        };

        self.start_monitoring(&descriptor, filter).await
    }

    /// Validate the filter, open the interface and start a new session
    pub async fn start_monitoring(&mut self, interface: &InterfaceDescriptor, filter: Option<&str>) -> AppResult<SessionId> {
        let filter = filter.map(str::trim).filter(|f| !f.is_empty()).map(str::to_string);

        if let Some(expr) = &filter {
            info!("Validating filter: {}", expr);
            validate_filter(expr).await?;
        }

        if self.active.is_some() {
            info!("Monitoring already running, stopping it first");
            self.stop_monitoring().await?;
        }

        let device = interface.device_name.clone();
        let (snaplen, timeout_ms, promiscuous) =
            (self.config.snaplen, self.config.read_timeout_ms, self.config.promiscuous);
        let source = tokio::task::spawn_blocking(move || {
            PacketSource::open(&device, filter.as_deref(), snaplen, timeout_ms, promiscuous)
        })
        .await??;

        self.start_with_source(interface, source).await
    }

    /// Start a session reading from an already opened source
    pub async fn start_with_source<R>(&mut self, interface: &InterfaceDescriptor, mut source: PacketSource<R>) -> AppResult<SessionId>
    where
        R: FrameReader + 'static,
    {
        if self.active.is_some() {
            self.stop_monitoring().await?;
        }

        let link = match LinkLayer::from_linktype(source.link_type()) {
            Ok(link) => link,
            Err(e) => {
                source.close();
                return Err(AppError::InterfaceUnavailable(format!("{}: {}", interface.device_name, e)));
            }
        };

        if interface.addresses.is_empty() {
            warn!(
                "No local addresses known for {}, splitting traffic evenly between directions",
                interface.device_name
            );
        }

        // Attribute the first packets against a fresh table
        let table = Arc::clone(&self.table);
        match tokio::task::spawn_blocking(move || table.refresh()).await? {
            Ok(entries) => debug!("Initial connection table has {} endpoints", entries),
            Err(e) => warn!("Initial connection table refresh failed: {}", e),
        }

        let session_id = match self.store.start_session(&interface.device_name).await {
            Ok(id) => id,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };

        let (refresher_shutdown, shutdown_rx) = watch::channel(false);
        let refresher = spawn_refresher(Arc::clone(&self.table), self.config.refresh_interval, shutdown_rx);

        // Ticking starts before capture so the first window is not discarded as stale
        self.scheduler.start(session_id).await?;

        let closer = source.closer();
        let worker = CaptureWorker {
            classifier: FlowClassifier::new(link),
            local_addresses: interface.addresses.clone(),
            table: Arc::clone(&self.table),
            counters: Arc::clone(&self.counters),
        };
        let (exit_tx, exit) = watch::channel(None);
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", interface.device_name))
            .spawn(move || {
                let outcome = worker.run(source);
                let _ = exit_tx.send(Some(outcome));
            });

        let capture_thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let _ = refresher_shutdown.send(true);
                let _ = self.scheduler.stop().await;
                let _ = self.store.end_session(session_id).await;
                return Err(AppError::Io(e));
            }
        };

        self.active = Some(ActiveMonitor {
            session_id,
            interface: interface.device_name.clone(),
            closer,
            capture_thread,
            exit,
            refresher,
            refresher_shutdown,
        });

        info!("Monitoring {} in session {}", interface.device_name, session_id);
        Ok(session_id)
    }

    /// Stop in order: tick, capture handle, background joins, then close the session
    ///
    /// When the capture had already failed the session is still closed, and the
    /// failure is returned as [`AppError::InterfaceUnavailable`].
    pub async fn stop_monitoring(&mut self) -> AppResult<EndOutcome> {
        let active = self.active.take().ok_or(AppError::NotRunning)?;
        info!("Stopping monitoring on {}", active.interface);

        if let Err(e) = self.scheduler.stop().await {
            warn!("Aggregation was not running: {}", e);
        }

        active.closer.close();
        let _ = active.refresher_shutdown.send(true);

        let timeout = self.config.shutdown_timeout;
        let capture_thread = active.capture_thread;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || capture_thread.join())).await {
            Ok(Ok(Ok(()))) => debug!("Capture thread joined"),
            Ok(Ok(Err(_))) => error!("Capture thread panicked"),
            Ok(Err(e)) => error!("Failed to join capture thread: {}", e),
            Err(_) => warn!("Capture thread did not exit within {:?}", timeout),
        }

        match tokio::time::timeout(timeout, active.refresher).await {
            Ok(Ok(())) => debug!("Connection table refresher joined"),
            Ok(Err(e)) => error!("Connection table refresher failed: {}", e),
            Err(_) => warn!("Connection table refresher did not exit within {:?}", timeout),
        }

        let stats = self.stats();
        info!(
            "Capture stats: {} packets, {} unparsed, {} attributed, {} unknown",
            stats.packets_seen, stats.packets_unparsed, stats.packets_attributed, stats.packets_unknown
        );

        let outcome = self.store.end_session(active.session_id).await?;

        let exit = active.exit.borrow().clone();
        if let Some(CaptureExit::Failed(reason)) = exit {
            return Err(AppError::InterfaceUnavailable(format!("{}: {}", active.interface, reason)));
        }
        Ok(outcome)
    }
}

/// State owned by the capture thread
struct CaptureWorker {
    classifier: FlowClassifier,
    local_addresses: Vec<IpAddr>,
    table: Arc<ConnectionAttributionTable>,
    counters: Arc<ByteCounters>,
}

impl CaptureWorker {
    /// Read until end-of-capture or the first read error
    fn run<R: FrameReader>(self, mut source: PacketSource<R>) -> CaptureExit {
        info!("Capture loop started on {}", source.interface());

        let exit = loop {
            match source.read_next() {
                Ok(ReadOutcome::Packet(packet)) => {
                    match self.classifier.classify(&packet, &self.local_addresses) {
                        Ok(flow) => {
                            let owner = self.table.resolve_flow(&flow, &self.local_addresses);
                            self.counters.record_packet(&flow, owner.process());
                        }
                        Err(e) => {
                            let unparsed = self.counters.record_unparsed();
                            if unparsed <= UNPARSED_LOG_LIMIT {
                                debug!("Skipping unparseable packet ({} bytes): {}", packet.data.len(), e);
                            } else {
                                trace!("Skipping unparseable packet: {}", e);
                            }
                        }
                    }
                }
                Ok(ReadOutcome::EndOfCapture) => break CaptureExit::Ended,
                Err(e) => {
                    error!("Capture on {} failed: {}", source.interface(), e);
                    break CaptureExit::Failed(e.to_string());
                }
            }
        };

        info!("Capture loop stopped for interface: {}", source.interface());
        exit
    }
}

