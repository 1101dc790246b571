use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Transport protocol of a classified packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    /// ICMP and everything else
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Other => "OTHER",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "OTHER" => Ok(Protocol::Other),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Traffic direction relative to the monitored interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
    /// No local address known: half the bytes count each way
    Split,
}

/// The process owning a local socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub name: String,
}

/// One classified packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Protocol,
    pub direction: Direction,
    /// Bytes on the wire
    pub size: u64,
}

impl Flow {
    /// Local endpoints worth looking up in the attribution table, most likely first
    pub fn local_endpoints(&self) -> Vec<(IpAddr, u16)> {
        let src = self.src_port.map(|port| (self.src_addr, port));
        let dst = self.dst_port.map(|port| (self.dst_addr, port));

        match self.direction {
            Direction::Outbound => src.into_iter().collect(),
            Direction::Inbound => dst.into_iter().collect(),
            Direction::Split => src.into_iter().chain(dst).collect(),
        }
    }
}

/// A frame as handed over by the capture handle
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    /// Original length on the wire, which may exceed `data.len()` under a snaplen
    pub wire_len: usize,
    pub timestamp: DateTime<Utc>,
}

impl RawPacket {
    pub fn new(data: Vec<u8>) -> Self {
        let wire_len = data.len();
        Self {
            data,
            wire_len,
            timestamp: Utc::now(),
        }
    }
}

/// Most recently seen flow, kept for diagnostic display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFlow {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: Protocol,
    pub process_name: String,
}
