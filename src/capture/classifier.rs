use log::{log_enabled, trace, Level};
use pnet::packet::{
    ethernet::{EtherType, EtherTypes, EthernetPacket},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    tcp::TcpPacket,
    udp::UdpPacket,
};
use std::net::IpAddr;

use crate::models::flow::{Direction, Flow, Protocol, RawPacket};
use crate::utils::error::ParseError;

const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const VLAN_TAG_LEN: usize = 4;

/// Link layer framing of the capture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux "any" device cooked capture
    LinuxSll,
    /// BSD loopback, 4-byte address family prefix
    Null,
    /// Bare IPv4/IPv6 without a link header
    RawIp,
}

impl LinkLayer {
    /// Map a pcap DLT_* code
    pub fn from_linktype(code: i32) -> Result<Self, ParseError> {
        match code {
            1 => Ok(LinkLayer::Ethernet),
            113 => Ok(LinkLayer::LinuxSll),
            0 | 108 => Ok(LinkLayer::Null),
            12 | 14 | 101 | 228 | 229 => Ok(LinkLayer::RawIp),
            other => Err(ParseError::UnsupportedLinkLayer(other)),
        }
    }
}

/// Network layer payload after stripping link framing
enum NetworkPayload<'a> {
    V4(&'a [u8]),
    V6(&'a [u8]),
}

/// Turns raw frames into classified flows
#[derive(Debug, Clone)]
pub struct FlowClassifier {
    link: LinkLayer,
}

impl FlowClassifier {
    /// Create a classifier for the given framing
    pub fn new(link: LinkLayer) -> Self {
        Self { link }
    }

    pub fn link_layer(&self) -> LinkLayer {
        self.link
    }

    /// Extract addresses, ports and protocol, and decide the direction
    pub fn classify(&self, packet: &RawPacket, local_addresses: &[IpAddr]) -> Result<Flow, ParseError> {
        let network = self.strip_link(&packet.data)?;

        let (src_addr, dst_addr, next, transport) = match network {
            NetworkPayload::V4(data) => {
                let ipv4 = Ipv4Packet::new(data).ok_or(ParseError::Truncated("IPv4"))?;
                (
                    IpAddr::V4(ipv4.get_source()),
                    IpAddr::V4(ipv4.get_destination()),
                    ipv4.get_next_level_protocol(),
                    transport_slice(data, ipv4.get_header_length() as usize * 4)?,
                )
            }
            NetworkPayload::V6(data) => {
                let ipv6 = Ipv6Packet::new(data).ok_or(ParseError::Truncated("IPv6"))?;
                (
                    IpAddr::V6(ipv6.get_source()),
                    IpAddr::V6(ipv6.get_destination()),
                    ipv6.get_next_header(),
                    transport_slice(data, Ipv6Packet::minimum_packet_size())?,
                )
            }
        };

        let (protocol, src_port, dst_port) = Self::parse_transport(next, transport)?;
        let direction = Self::direction(src_addr, dst_addr, local_addresses);

        if log_enabled!(Level::Trace) {
            trace!(
                "{} {:?}:{:?} -> {:?}:{:?} {:?} {} bytes",
                protocol, src_addr, src_port, dst_addr, dst_port, direction, packet.wire_len
            );
        }

        Ok(Flow {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
            direction,
            size: packet.wire_len as u64,
        })
    }

    /// Outbound when the source is ours, inbound otherwise; split when nothing is known
    pub fn direction(src: IpAddr, dst: IpAddr, local_addresses: &[IpAddr]) -> Direction {
        if local_addresses.is_empty() {
            return Direction::Split;
        }

        if local_addresses.contains(&src) {
            Direction::Outbound
        } else if local_addresses.contains(&dst) {
            Direction::Inbound
        } else {
            // Broadcast, multicast and promiscuous traffic arriving on the interface
            Direction::Inbound
        }
    }

    fn strip_link<'a>(&self, data: &'a [u8]) -> Result<NetworkPayload<'a>, ParseError> {
        match self.link {
            LinkLayer::Ethernet => {
                let eth = EthernetPacket::new(data).ok_or(ParseError::Truncated("Ethernet"))?;
                let header_len = EthernetPacket::minimum_packet_size();
                Self::by_ethertype(eth.get_ethertype(), &data[header_len..])
            }
            LinkLayer::LinuxSll => {
                if data.len() < SLL_HEADER_LEN {
                    return Err(ParseError::Truncated("SLL"));
                }
                let ethertype = EtherType(u16::from_be_bytes([data[14], data[15]]));
                Self::by_ethertype(ethertype, &data[SLL_HEADER_LEN..])
            }
            LinkLayer::Null => {
                if data.len() < NULL_HEADER_LEN {
                    return Err(ParseError::Truncated("loopback"));
                }
                Self::by_version(&data[NULL_HEADER_LEN..])
            }
            LinkLayer::RawIp => Self::by_version(data),
        }
    }

    fn by_ethertype(ethertype: EtherType, payload: &[u8]) -> Result<NetworkPayload<'_>, ParseError> {
        match ethertype {
            EtherTypes::Ipv4 => Ok(NetworkPayload::V4(payload)),
            EtherTypes::Ipv6 => Ok(NetworkPayload::V6(payload)),
            EtherTypes::Vlan => {
                if payload.len() < VLAN_TAG_LEN {
                    return Err(ParseError::Truncated("802.1Q"));
                }
                let inner = EtherType(u16::from_be_bytes([payload[2], payload[3]]));
                Self::by_ethertype(inner, &payload[VLAN_TAG_LEN..])
            }
            other => Err(ParseError::NotIp(format!("{:?}", other))),
        }
    }

    fn by_version(payload: &[u8]) -> Result<NetworkPayload<'_>, ParseError> {
        match payload.first().map(|b| b >> 4) {
            Some(4) => Ok(NetworkPayload::V4(payload)),
            Some(6) => Ok(NetworkPayload::V6(payload)),
            Some(v) => Err(ParseError::NotIp(format!("IP version {}", v))),
            None => Err(ParseError::Truncated("IP")),
        }
    }

    fn parse_transport(
        proto: IpNextHeaderProtocol,
        data: &[u8],
    ) -> Result<(Protocol, Option<u16>, Option<u16>), ParseError> {
        match proto {
            IpNextHeaderProtocols::Tcp => {
                let tcp = TcpPacket::new(data).ok_or(ParseError::Truncated("TCP"))?;
                Ok((Protocol::Tcp, Some(tcp.get_source()), Some(tcp.get_destination())))
            }
            IpNextHeaderProtocols::Udp => {
                let udp = UdpPacket::new(data).ok_or(ParseError::Truncated("UDP"))?;
                Ok((Protocol::Udp, Some(udp.get_source()), Some(udp.get_destination())))
            }
            _ => Ok((Protocol::Other, None, None)),
        }
    }
}

/// Bytes following a network header, tolerating snaplen truncation of the payload
fn transport_slice(data: &[u8], header_len: usize) -> Result<&[u8], ParseError> {
    data.get(header_len..).ok_or(ParseError::Truncated("IP"))
}
