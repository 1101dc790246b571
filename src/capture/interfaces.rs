use log::{debug, error, info};
use parking_lot::RwLock;
use std::time::{Duration, Instant};

use crate::models::interface::InterfaceDescriptor;

/// How long an enumeration stays valid before it is redone
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Enumerates capture-capable interfaces, caching the result for a while
pub struct InterfaceCatalog {
    cached: RwLock<Option<(Vec<InterfaceDescriptor>, Instant)>>,
    ttl: Duration,
}

impl Default for InterfaceCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl InterfaceCatalog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cached: RwLock::new(None),
            ttl,
        }
    }

    /// Interfaces from the cache, re-enumerated once the cache expires
    pub fn list(&self) -> Vec<InterfaceDescriptor> {
        {
            let cached = self.cached.read();
            if let Some((interfaces, timestamp)) = &*cached {
                let elapsed = timestamp.elapsed();
                if elapsed < self.ttl {
                    debug!(
                        "Using cached interface list ({} interfaces, {}s old)",
                        interfaces.len(),
                        elapsed.as_secs()
                    );
                    return interfaces.clone();
                }
            }
        }

        self.refresh()
    }

    /// Enumerate now, replacing whatever was cached
    pub fn refresh(&self) -> Vec<InterfaceDescriptor> {
        let interfaces = enumerate();
        *self.cached.write() = Some((interfaces.clone(), Instant::now()));
        interfaces
    }

    /// Look up one interface by device name
    pub fn find(&self, device_name: &str) -> Option<InterfaceDescriptor> {
        self.list().into_iter().find(|i| i.device_name == device_name)
    }
}

fn enumerate() -> Vec<InterfaceDescriptor> {
    // pnet_datalink has been seen to panic on some Windows setups
    let interfaces = match std::panic::catch_unwind(from_pnet) {
        Ok(interfaces) if !interfaces.is_empty() => interfaces,
        _ => {
            info!("No interfaces from pnet_datalink, falling back to pcap");
            from_pcap()
        }
    };

    info!("Found {} network interfaces", interfaces.len());
    interfaces
}

fn from_pnet() -> Vec<InterfaceDescriptor> {
    pnet_datalink::interfaces()
        .into_iter()
        .map(|iface| {
            let description = (!iface.description.is_empty()).then(|| iface.description.clone());
            let mut descriptor = InterfaceDescriptor::new(iface.name.clone())
                .with_description(description)
                .with_addresses(iface.ips.iter().map(|net| net.ip()).collect());
            descriptor.mac_address = iface.mac.map(|mac| mac.to_string());
            descriptor.is_loopback = iface.is_loopback();
            descriptor.is_up = iface.is_up();
            descriptor
        })
        .collect()
}

fn from_pcap() -> Vec<InterfaceDescriptor> {
    match pcap::Device::list() {
        Ok(devices) => devices
            .into_iter()
            .map(|device| {
                let mut descriptor = InterfaceDescriptor::new(device.name)
                    .with_description(device.desc)
                    .with_addresses(device.addresses.iter().map(|a| a.addr).collect());
                descriptor.is_loopback = device.flags.is_loopback();
                descriptor.is_up = device.flags.is_up();
                descriptor
            })
            .collect(),
        Err(e) => {
            error!("Failed to get interfaces from pcap: {}", e);
            Vec::new()
        }
    }
}
