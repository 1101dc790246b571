use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Snapshot of one capturable network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Device system name (used for capture operations)
    pub device_name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Addresses bound to the interface
    pub addresses: Vec<IpAddr>,

    /// MAC address (if available)
    pub mac_address: Option<String>,

    /// Whether this is a loopback interface
    pub is_loopback: bool,

    /// Whether this interface is up/active
    pub is_up: bool,
}

impl InterfaceDescriptor {
    /// Create a descriptor with just the device name
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            description: None,
            addresses: Vec::new(),
            mac_address: None,
            is_loopback: false,
            is_up: true,
        }
    }

    /// Get a display name that prioritizes the description over the device name
    pub fn display_name(&self) -> &str {
        match &self.description {
            Some(desc) if !desc.is_empty() => desc,
            _ => &self.device_name,
        }
    }

    /// Get a formatted string with interface name and first IPv4 (if available)
    pub fn formatted_display(&self) -> String {
        let ipv4 = self.addresses.iter().find(|ip| ip.is_ipv4());

        match ipv4 {
            Some(ip) => format!("{} ({})", self.display_name(), ip),
            None => self.display_name().to_string(),
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }
}
