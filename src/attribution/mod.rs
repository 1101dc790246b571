// Connection attribution: which local process owns which (address, port)
//
// The table is rebuilt wholesale from an OS-level enumeration on its own
// cadence and published by swapping a single `Arc`, so the capture thread only
// ever reads a complete snapshot.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::models::flow::{Flow, ProcessIdentity, Protocol};
use crate::utils::error::{AppError, AppResult};

pub mod iphelper;
pub mod lsof;
#[cfg(target_os = "linux")]
pub mod linux;

/// One socket and the process holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub protocol: Protocol,
    pub process: ProcessIdentity,
}

/// Platform mechanism for listing sockets together with their owning processes
pub trait ConnectionEnumerator: Send + Sync {
    /// Backend name (e.g., "procfs", "lsof", "iphelper")
    fn name(&self) -> &'static str;

    /// Enumerate every socket currently open on the host
    fn enumerate(&self) -> anyhow::Result<Vec<SocketOwner>>;
}

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Process(Arc<ProcessIdentity>),
    Unknown,
}

impl Attribution {
    pub fn process(&self) -> Option<&ProcessIdentity> {
        match self {
            Attribution::Process(identity) => Some(identity),
            Attribution::Unknown => None,
        }
    }
}

/// Immutable mapping built by one refresh
#[derive(Debug, Default)]
pub struct ConnectionSnapshot {
    exact: HashMap<(IpAddr, u16), Arc<ProcessIdentity>>,
    /// Sockets bound to the unspecified address, keyed by port
    wildcard: HashMap<u16, Arc<ProcessIdentity>>,
    generation: u64,
    built_at: Option<DateTime<Utc>>,
}

impl ConnectionSnapshot {
    /// Build a snapshot; when several sockets share an endpoint the first one wins
    pub fn build(owners: Vec<SocketOwner>, generation: u64) -> Self {
        let mut exact = HashMap::new();
        let mut wildcard = HashMap::new();
        let mut identities: HashMap<ProcessIdentity, Arc<ProcessIdentity>> = HashMap::new();

        for owner in owners {
            let identity = identities
                .entry(owner.process.clone())
                .or_insert_with(|| Arc::new(owner.process))
                .clone();

            let addr = canonical(owner.local_addr);
            if addr.is_unspecified() {
                wildcard.entry(owner.local_port).or_insert(identity);
            } else {
                exact.entry((addr, owner.local_port)).or_insert(identity);
            }
        }

        Self {
            exact,
            wildcard,
            generation,
            built_at: Some(Utc::now()),
        }
    }

    pub fn resolve(&self, addr: IpAddr, port: u16) -> Option<&Arc<ProcessIdentity>> {
        self.exact
            .get(&(canonical(addr), port))
            .or_else(|| self.wildcard.get(&port))
    }

    /// Like `resolve`, but a port-only wildcard match needs an address the host receives on
    ///
    /// With no local addresses known every address is accepted.
    pub fn resolve_local(&self, addr: IpAddr, port: u16, local_addresses: &[IpAddr]) -> Option<&Arc<ProcessIdentity>> {
        let addr = canonical(addr);
        if let Some(identity) = self.exact.get(&(addr, port)) {
            return Some(identity);
        }

        let ours = local_addresses.is_empty()
            || local_addresses.iter().any(|local| canonical(*local) == addr)
            || is_group_address(addr);
        if ours {
            self.wildcard.get(&port)
        } else {
            None
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically refreshed (address, port) -> process mapping
pub struct ConnectionAttributionTable {
    current: RwLock<Arc<ConnectionSnapshot>>,
    enumerator: Box<dyn ConnectionEnumerator>,
    /// Serializes refreshes so generations are published in order
    refresh_lock: Mutex<u64>,
}

impl ConnectionAttributionTable {
    pub fn new(enumerator: Box<dyn ConnectionEnumerator>) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConnectionSnapshot::default())),
            enumerator,
            refresh_lock: Mutex::new(0),
        }
    }

    /// Table backed by the enumerator for the current OS
    pub fn for_platform() -> Self {
        Self::new(platform_enumerator())
    }

    pub fn enumerator_name(&self) -> &'static str {
        self.enumerator.name()
    }

    /// Rebuild the whole mapping and publish it; on failure the previous table stays
    pub fn refresh(&self) -> AppResult<usize> {
        let mut generation = self.refresh_lock.lock();

        let owners = self
            .enumerator
            .enumerate()
            .map_err(|e| AppError::Attribution(format!("{}: {:#}", self.enumerator.name(), e)))?;

        *generation += 1;
        let snapshot = Arc::new(ConnectionSnapshot::build(owners, *generation));
        let entries = snapshot.len();

        *self.current.write() = snapshot;

        debug!(
            "Connection table refreshed via {}: {} endpoints (generation {})",
            self.enumerator.name(),
            entries,
            *generation
        );
        Ok(entries)
    }

    /// The table currently published
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn resolve(&self, addr: IpAddr, port: u16) -> Attribution {
        match self.snapshot().resolve(addr, port) {
            Some(identity) => Attribution::Process(Arc::clone(identity)),
            None => Attribution::Unknown,
        }
    }

    /// Resolve whichever local endpoint of the flow is known
    pub fn resolve_flow(&self, flow: &Flow, local_addresses: &[IpAddr]) -> Attribution {
        let snapshot = self.snapshot();

        flow.local_endpoints()
            .into_iter()
            .find_map(|(addr, port)| snapshot.resolve_local(addr, port, local_addresses))
            .map(|identity| Attribution::Process(Arc::clone(identity)))
            .unwrap_or(Attribution::Unknown)
    }
}

/// Run `refresh` on a fixed cadence until `shutdown` flips to true
pub fn spawn_refresher(
    table: Arc<ConnectionAttributionTable>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Connection table refresher started ({} every {:?})",
            table.enumerator_name(),
            period
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let table = Arc::clone(&table);
                    match tokio::task::spawn_blocking(move || table.refresh()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Connection table refresh failed, keeping previous table: {}", e),
                        Err(e) => warn!("Connection table refresh task failed: {}", e),
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        info!("Connection table refresher stopped");
    })
}

/// Enumerator for the OS this binary was built for
pub fn platform_enumerator() -> Box<dyn ConnectionEnumerator> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::ProcfsEnumerator::new())
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(iphelper::IpHelperEnumerator::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Box::new(lsof::LsofEnumerator::new())
    }
}

/// Multicast and broadcast destinations reach listeners bound to the wildcard address
fn is_group_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// Fold IPv4-mapped IPv6 addresses into plain IPv4
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}

/// Parse `host:port` as printed by lsof
///
/// Accepts `1.2.3.4:80`, `[::1]:80`, `[fe80::1%en0]:123`, `*:5353` and `*:*`.
pub(crate) fn parse_endpoint(text: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = text.rsplit_once(':')?;
    let port = if port == "*" { 0 } else { port.parse().ok()? };

    let addr = if host == "*" {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let inner = inner.split('%').next().unwrap_or(inner);
        if inner == "*" {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(inner.parse().ok()?)
        }
    } else {
        host.parse().ok()?
    };

    Some((addr, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::Direction;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn owner(addr: &str, port: u16, pid: u32, name: &str) -> SocketOwner {
        SocketOwner {
            local_addr: addr.parse().unwrap(),
            local_port: port,
            protocol: Protocol::Tcp,
            process: ProcessIdentity { pid, name: name.to_string() },
        }
    }

    /// Hands out a prepared list per call, cycling through them
    struct Scripted {
        tables: Vec<Vec<SocketOwner>>,
        calls: AtomicUsize,
    }

    impl ConnectionEnumerator for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn enumerate(&self) -> anyhow::Result<Vec<SocketOwner>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tables[n % self.tables.len()].clone())
        }
    }

    struct Failing;

    impl ConnectionEnumerator for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn enumerate(&self) -> anyhow::Result<Vec<SocketOwner>> {
            anyhow::bail!("permission denied")
        }
    }

    fn scripted(tables: Vec<Vec<SocketOwner>>) -> ConnectionAttributionTable {
        ConnectionAttributionTable::new(Box::new(Scripted { tables, calls: AtomicUsize::new(0) }))
    }

    #[test]
    fn resolves_after_refresh_and_unknown_before() {
        let table = scripted(vec![vec![owner("10.0.0.2", 443, 7, "nginx")]]);
        let addr = "10.0.0.2".parse().unwrap();

        assert_eq!(table.resolve(addr, 443), Attribution::Unknown);
        assert_eq!(table.refresh().unwrap(), 1);

        let hit = table.resolve(addr, 443);
        assert_eq!(hit.process().map(|p| p.name.as_str()), Some("nginx"));
        assert_eq!(table.resolve(addr, 444), Attribution::Unknown);
    }

    #[test]
    fn entries_missing_from_latest_refresh_become_unknown() {
        let table = scripted(vec![vec![owner("10.0.0.2", 5000, 1, "old")], vec![]]);
        let addr = "10.0.0.2".parse().unwrap();

        table.refresh().unwrap();
        assert!(table.resolve(addr, 5000).process().is_some());

        table.refresh().unwrap();
        assert_eq!(table.resolve(addr, 5000), Attribution::Unknown);
    }

    #[test]
    fn wildcard_and_mapped_addresses_resolve() {
        let table = scripted(vec![vec![
            owner("0.0.0.0", 53, 3, "dnsmasq"),
            owner("::ffff:192.168.1.5", 8080, 4, "java"),
        ]]);
        table.refresh().unwrap();

        let dns = table.resolve("192.168.1.5".parse().unwrap(), 53);
        assert_eq!(dns.process().unwrap().name, "dnsmasq");

        let java = table.resolve("192.168.1.5".parse().unwrap(), 8080);
        assert_eq!(java.process().unwrap().pid, 4);
    }

    #[test]
    fn failed_refresh_keeps_previous_table() {
        let table = ConnectionAttributionTable::new(Box::new(Failing));
        assert!(matches!(table.refresh(), Err(AppError::Attribution(_))));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn resolve_flow_uses_local_side() {
        let table = scripted(vec![vec![owner("10.0.0.2", 40000, 9, "curl")]]);
        table.refresh().unwrap();

        let flow = Flow {
            src_addr: "1.1.1.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            src_port: Some(443),
            dst_port: Some(40000),
            protocol: Protocol::Tcp,
            direction: Direction::Inbound,
            size: 1500,
        };
        let local: [IpAddr; 1] = ["10.0.0.2".parse().unwrap()];
        assert_eq!(table.resolve_flow(&flow, &local).process().unwrap().name, "curl");
    }

    #[test]
    fn wildcard_listeners_do_not_claim_other_hosts_traffic() {
        let table = scripted(vec![vec![owner("0.0.0.0", 443, 5, "nginx"), owner("0.0.0.0", 5353, 6, "mdns")]]);
        table.refresh().unwrap();
        let local: [IpAddr; 1] = ["192.168.1.10".parse().unwrap()];

        let flow = |dst: &str, port: u16| Flow {
            src_addr: "192.168.1.77".parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            src_port: Some(51000),
            dst_port: Some(port),
            protocol: Protocol::Tcp,
            direction: Direction::Inbound,
            size: 100,
        };

        // Seen promiscuously, addressed to a neighbour
        assert_eq!(table.resolve_flow(&flow("192.168.1.20", 443), &local), Attribution::Unknown);
        assert_eq!(table.resolve_flow(&flow("192.168.1.10", 443), &local).process().unwrap().name, "nginx");
        assert_eq!(table.resolve_flow(&flow("224.0.0.251", 5353), &local).process().unwrap().name, "mdns");
        assert_eq!(table.resolve_flow(&flow("255.255.255.255", 5353), &local).process().unwrap().pid, 6);
        // Split mode knows no local address, so the port alone decides
        assert_eq!(table.resolve_flow(&flow("192.168.1.20", 443), &[]).process().unwrap().pid, 5);
    }

    #[test]
    fn readers_never_observe_a_mixed_table() {
        let ports: Vec<u16> = (1000..1064).collect();
        let alpha: Vec<_> = ports.iter().map(|p| owner("10.0.0.2", *p, 1, "alpha")).collect();
        let beta: Vec<_> = ports.iter().map(|p| owner("10.0.0.2", *p, 2, "beta")).collect();
        let table = Arc::new(scripted(vec![alpha, beta]));
        table.refresh().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let start = Arc::new(Barrier::new(2));

        let refresher = {
            let (table, stop, start) = (Arc::clone(&table), Arc::clone(&stop), Arc::clone(&start));
            thread::spawn(move || {
                start.wait();
                for _ in 0..200 {
                    table.refresh().unwrap();
                }
                stop.store(true, Ordering::SeqCst);
            })
        };

        start.wait();
        let addr = "10.0.0.2".parse().unwrap();
        while !stop.load(Ordering::SeqCst) {
            let snapshot = table.snapshot();
            let names: Vec<_> = ports
                .iter()
                .map(|p| snapshot.resolve(addr, *p).unwrap().name.clone())
                .collect();
            assert!(names.iter().all(|n| n == &names[0]), "mixed table: {:?}", names);
        }

        refresher.join().unwrap();
        assert_eq!(table.snapshot().generation(), 201);
    }

    #[test]
    fn parses_lsof_endpoints() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(parse_endpoint("127.0.0.1:8080"), Some((v4, 8080)));
        assert_eq!(parse_endpoint("[::1]:631"), Some(("::1".parse().unwrap(), 631)));
        assert_eq!(parse_endpoint("[fe80::1%en0]:123"), Some(("fe80::1".parse().unwrap(), 123)));
        assert_eq!(parse_endpoint("*:5353"), Some((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5353)));
        assert_eq!(parse_endpoint("*:*"), Some((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)));
        assert_eq!(parse_endpoint("localhost"), None);
    }

    #[tokio::test]
    async fn refresher_runs_until_shutdown() {
        let table = Arc::new(scripted(vec![vec![owner("10.0.0.2", 22, 1, "sshd")]]));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_refresher(Arc::clone(&table), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let generation = table.snapshot().generation();
        assert!(generation >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(table.snapshot().generation(), generation);
    }
}
