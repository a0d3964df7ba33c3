//! IP packet header parsing
//!
//! Only enough parsing to classify a packet and extract its flow key. Full
//! TCP/UDP processing (checksums, reassembly, retransmission) belongs to the
//! userspace stack; malformed packets are rejected here so they never reach
//! it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::flow::FlowKey;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Classification of one ingress packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPacket {
    /// TCP or UDP packet with a complete flow key
    Flow(FlowKey),
    /// ICMP or ICMPv6, not forwarded
    Icmp,
    /// Some other transport protocol
    Other(u8),
}

/// Parse an IP packet header; `None` means the packet is malformed
#[must_use]
pub fn parse_packet(packet: &[u8]) -> Option<ParsedPacket> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        _ => None,
    }
}

fn parse_ipv4(packet: &[u8]) -> Option<ParsedPacket> {
    if packet.len() < 20 {
        return None;
    }

    let ihl = (packet[0] & 0x0f) as usize * 4;
    if ihl < 20 || packet.len() < ihl {
        return None;
    }

    let protocol = packet[9];
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    match protocol {
        PROTO_TCP | PROTO_UDP => {
            if packet.len() < ihl + 4 {
                return None;
            }
            let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
            let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
            let src = SocketAddr::new(IpAddr::V4(src_ip), src_port);
            let dst = SocketAddr::new(IpAddr::V4(dst_ip), dst_port);
            Some(ParsedPacket::Flow(if protocol == PROTO_TCP {
                FlowKey::tcp(src, dst)
            } else {
                FlowKey::udp(src, dst)
            }))
        }
        PROTO_ICMP => Some(ParsedPacket::Icmp),
        other => Some(ParsedPacket::Other(other)),
    }
}

fn parse_ipv6(packet: &[u8]) -> Option<ParsedPacket> {
    if packet.len() < 40 {
        return None;
    }

    // Extension header chains are not walked; a packet carrying them is
    // classified by its first next-header value.
    let protocol = packet[6];

    let mut src_octets = [0u8; 16];
    let mut dst_octets = [0u8; 16];
    src_octets.copy_from_slice(&packet[8..24]);
    dst_octets.copy_from_slice(&packet[24..40]);
    let src_ip = Ipv6Addr::from(src_octets);
    let dst_ip = Ipv6Addr::from(dst_octets);

    match protocol {
        PROTO_TCP | PROTO_UDP => {
            if packet.len() < 44 {
                return None;
            }
            let src_port = u16::from_be_bytes([packet[40], packet[41]]);
            let dst_port = u16::from_be_bytes([packet[42], packet[43]]);
            let src = SocketAddr::new(IpAddr::V6(src_ip), src_port);
            let dst = SocketAddr::new(IpAddr::V6(dst_ip), dst_port);
            Some(ParsedPacket::Flow(if protocol == PROTO_TCP {
                FlowKey::tcp(src, dst)
            } else {
                FlowKey::udp(src, dst)
            }))
        }
        PROTO_ICMPV6 => Some(ParsedPacket::Icmp),
        other => Some(ParsedPacket::Other(other)),
    }
}
