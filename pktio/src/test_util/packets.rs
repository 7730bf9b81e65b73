//! Packet builders for tests.
//!
//! NFLOG hands over bare L3 payloads, so most builders here stop at the
//! network layer; [`ethernet_frame`] wraps one into a frame when needed.

use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv6Packet, Ipv6Repr,
};
use std::net::{Ipv4Addr, Ipv6Addr};

// ============================================================================
// Constants
// ============================================================================

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IPv6 header size
pub const IPV6_HDR_SIZE: usize = 40;

/// Broadcast MAC address
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

// ============================================================================
// Ethernet
// ============================================================================

/// Wrap an L3 payload in an untagged Ethernet header
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + payload.len()];
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(src),
        dst_addr: EthernetAddress(dst),
        ethertype: EthernetProtocol::from(ethertype),
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);
    eth_frame.payload_mut().copy_from_slice(payload);
    frame
}

// ============================================================================
// ARP
// ============================================================================

fn arp_payload(
    operation: ArpOperation,
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_mac: [u8; 6],
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: EthernetAddress(sender_mac),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress(target_mac),
        target_protocol_addr: target_ip,
    };
    let mut payload = vec![0u8; repr.buffer_len()];
    repr.emit(&mut ArpPacket::new_unchecked(&mut payload[..]));
    payload
}

/// Create an ARP request (L3 only)
pub fn arp_request_payload(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    arp_payload(ArpOperation::Request, sender_mac, sender_ip, [0; 6], target_ip)
}

/// Create an ARP reply (L3 only)
pub fn arp_reply_payload(sender_mac: [u8; 6], sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    arp_payload(ArpOperation::Reply, sender_mac, sender_ip, BROADCAST_MAC, target_ip)
}

// ============================================================================
// IPv6 Neighbor Discovery
// ============================================================================

/// Create a Neighbor Solicitation IPv6 packet, sent to the target's
/// solicited-node address, optionally carrying a source link-layer option
pub fn neighbor_solicit_payload(src: Ipv6Addr, target: Ipv6Addr, sll: Option<[u8; 6]>) -> Vec<u8> {
    let t = target.octets();
    let dst = Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, t[13], t[14], t[15],
    ]);

    // type, code, checksum, reserved, target, then an optional 8-byte SLLA
    let icmpv6_len = 24 + if sll.is_some() { 8 } else { 0 };
    let mut packet = vec![0u8; IPV6_HDR_SIZE + icmpv6_len];

    let ipv6_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmpv6_len,
        hop_limit: 255,
    };
    ipv6_repr.emit(&mut Ipv6Packet::new_unchecked(&mut packet[..]));

    let icmpv6 = &mut packet[IPV6_HDR_SIZE..];
    icmpv6[0] = 135;
    icmpv6[8..24].copy_from_slice(&t);
    if let Some(mac) = sll {
        icmpv6[24] = 1;
        icmpv6[25] = 1;
        icmpv6[26..32].copy_from_slice(&mac);
    }
    let checksum = icmpv6_checksum(&src, &dst, icmpv6);
    icmpv6[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// ICMPv6 checksum over the pseudo-header and message
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, icmpv6_data: &[u8]) -> u16 {
    let (src, dst) = (src.octets(), dst.octets());
    let mut sum: u32 = 0;
    for chunk in src.chunks(2).chain(dst.chunks(2)) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += icmpv6_data.len() as u32;
    sum += 58u32;

    let mut chunks = icmpv6_data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let result = !(sum as u16);
    if result == 0 { 0xffff } else { result }
}
