//! Reconstruction of kernel-flooded ARP requests and IPv6 Neighbor
//! Solicitations.
//!
//! The kernel floods these out of every bridge member; NFLOG hands us one
//! copy as a bare L3 payload. We rebuild the Ethernet (and 802.1Q) header
//! and inject the frame into the hardware pipeline once, so the hardware
//! does the flooding. Repeats for the same target within [`DEDUP_WINDOW`]
//! are dropped.

use super::iface::{BridgeKind, InterfaceInfo, InterfaceResolver};
use super::nflog::NflogPacket;
use crate::packet_io::IngressMode;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv6Message, Icmpv6Packet, IpProtocol, Ipv6Packet,
};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Window in which a repeated request for the same target is suppressed.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(1);

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

const ETHERNET_HEADER_SIZE: usize = 14;
const VLAN_TAG_SIZE: usize = 4;

/// ICMPv6 NS: type, code, checksum, reserved, then the 16-byte target.
const NS_TARGET_OFFSET: usize = 8;
const NS_OPTIONS_OFFSET: usize = 24;
const ND_OPT_SOURCE_LL_ADDR: u8 = 1;

/// Last accepted ARP and NS targets.
///
/// Owned by the reactor thread.
#[derive(Debug, Default)]
pub struct DedupState {
    arp: Option<(Ipv4Addr, Instant)>,
    ns: Option<(Ipv6Addr, Instant)>,
}

impl DedupState {
    /// Returns false if `target` was accepted less than [`DEDUP_WINDOW`]
    /// before `now`. Only accepted requests move the window.
    pub fn accept_arp(&mut self, target: Ipv4Addr, now: Instant) -> bool {
        accept(&mut self.arp, target, now)
    }

    /// Same as [`DedupState::accept_arp`] for NS targets.
    pub fn accept_ns(&mut self, target: Ipv6Addr, now: Instant) -> bool {
        accept(&mut self.ns, target, now)
    }
}

fn accept<T: PartialEq>(last: &mut Option<(T, Instant)>, target: T, now: Instant) -> bool {
    if let Some((seen, at)) = last
        && *seen == target
        && now.saturating_duration_since(*at) < DEDUP_WINDOW
    {
        return false;
    }
    *last = Some((target, now));
    true
}

/// A rebuilt frame and how to inject it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstructed {
    pub frame: Vec<u8>,
    pub mode: IngressMode,
}

/// Turns NFLOG copies into injectable frames.
pub struct FloodReconstructor {
    dedup: DedupState,
    interfaces: Arc<dyn InterfaceResolver>,
}

impl FloodReconstructor {
    pub fn new(interfaces: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            dedup: DedupState::default(),
            interfaces,
        }
    }

    pub fn process(&mut self, packet: &NflogPacket, now: Instant) -> Option<Reconstructed> {
        let parsed = match packet.hw_protocol {
            ETHERTYPE_ARP => Flooded::Arp(parse_arp_request(&packet.payload)?),
            ETHERTYPE_IPV6 => Flooded::Ns(parse_neighbor_solicit(&packet.payload)?),
            other => {
                trace!(hw_protocol = format_args!("{other:#06x}"), "Ignoring NFLOG payload");
                return None;
            }
        };

        let Some(iface) = self.interfaces.interface(packet.out_ifindex) else {
            debug!(ifindex = packet.out_ifindex, "No interface context, dropping flooded packet");
            return None;
        };

        let frame = match parsed {
            Flooded::Arp(arp) => {
                if !self.dedup.accept_arp(arp.target, now) {
                    debug!(target = %arp.target, "Duplicate ARP request suppressed");
                    return None;
                }
                build_arp_frame(&arp, &iface)
            }
            Flooded::Ns(ns) => {
                if !self.dedup.accept_ns(ns.target, now) {
                    debug!(target = %ns.target, "Duplicate neighbor solicitation suppressed");
                    return None;
                }
                build_ns_frame(&ns, &packet.payload, &iface)
            }
        };

        let mode = match iface.bridge {
            BridgeKind::Dot1d { bridge_id } => IngressMode::Hybrid(bridge_id),
            BridgeKind::None | BridgeKind::Dot1q => IngressMode::Lookup,
        };
        debug!(
            ifindex = packet.out_ifindex,
            len = frame.len(),
            ?mode,
            "Flooded packet reconstructed"
        );
        Some(Reconstructed { frame, mode })
    }
}

enum Flooded {
    Arp(ArpRequest),
    Ns(NeighborSolicit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    pub sender_mac: EthernetAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: EthernetAddress,
    pub target: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborSolicit {
    pub target: Ipv6Addr,
    pub source_ll_addr: Option<EthernetAddress>,
}

/// Parses a bare ARP payload, accepting only Ethernet/IPv4 requests.
pub fn parse_arp_request(payload: &[u8]) -> Option<ArpRequest> {
    let packet = ArpPacket::new_checked(payload).ok()?;
    match ArpRepr::parse(&packet).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Request,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpRequest {
            sender_mac: source_hardware_addr,
            sender_ip: source_protocol_addr,
            target_mac: target_hardware_addr,
            target: target_protocol_addr,
        }),
        _ => None,
    }
}

/// Parses a bare IPv6 payload, accepting only ICMPv6 Neighbor Solicitations.
pub fn parse_neighbor_solicit(payload: &[u8]) -> Option<NeighborSolicit> {
    let ipv6 = Ipv6Packet::new_checked(payload).ok()?;
    if ipv6.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    let icmp = Icmpv6Packet::new_checked(ipv6.payload()).ok()?;
    if icmp.msg_type() != Icmpv6Message::NeighborSolicit {
        return None;
    }

    let raw = ipv6.payload();
    if raw.len() < NS_OPTIONS_OFFSET {
        return None;
    }
    let target: [u8; 16] = raw[NS_TARGET_OFFSET..NS_OPTIONS_OFFSET].try_into().ok()?;

    Some(NeighborSolicit {
        target: Ipv6Addr::from(target),
        source_ll_addr: source_ll_option(&raw[NS_OPTIONS_OFFSET..]),
    })
}

/// Finds the source link-layer address option. Options are
/// `[type][length in 8-byte units][data]`; a zero length ends the walk.
fn source_ll_option(mut options: &[u8]) -> Option<EthernetAddress> {
    while options.len() >= 2 {
        let len = usize::from(options[1]) * 8;
        if len == 0 || len > options.len() {
            return None;
        }
        if options[0] == ND_OPT_SOURCE_LL_ADDR && len >= 8 {
            return Some(EthernetAddress::from_bytes(&options[2..8]));
        }
        options = &options[len..];
    }
    None
}

/// Solicited-node multicast MAC for an IPv6 target: 33:33:ff + low 24 bits.
pub fn solicited_node_mac(target: Ipv6Addr) -> EthernetAddress {
    let t = target.octets();
    EthernetAddress([0x33, 0x33, 0xff, t[13], t[14], t[15]])
}

fn build_arp_frame(arp: &ArpRequest, iface: &InterfaceInfo) -> Vec<u8> {
    let src = if arp.sender_mac.0 == [0; 6] {
        EthernetAddress(iface.mac.0)
    } else {
        arp.sender_mac
    };
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: arp.sender_mac,
        source_protocol_addr: arp.sender_ip,
        target_hardware_addr: arp.target_mac,
        target_protocol_addr: arp.target,
    };
    build_frame(
        EthernetAddress::BROADCAST,
        src,
        iface.vlan_id,
        ETHERTYPE_ARP,
        repr.buffer_len(),
        |payload| repr.emit(&mut ArpPacket::new_unchecked(payload)),
    )
}

fn build_ns_frame(ns: &NeighborSolicit, payload: &[u8], iface: &InterfaceInfo) -> Vec<u8> {
    let src = ns
        .source_ll_addr
        .unwrap_or(EthernetAddress(iface.mac.0));
    // The IPv6 packet is forwarded untouched so its checksum stays valid.
    build_frame(
        solicited_node_mac(ns.target),
        src,
        iface.vlan_id,
        ETHERTYPE_IPV6,
        payload.len(),
        |buf| buf.copy_from_slice(payload),
    )
}

fn build_frame(
    dst: EthernetAddress,
    src: EthernetAddress,
    vlan_id: Option<u16>,
    ethertype: u16,
    payload_len: usize,
    emit_payload: impl FnOnce(&mut [u8]),
) -> Vec<u8> {
    let tag_len = if vlan_id.is_some() { VLAN_TAG_SIZE } else { 0 };
    let mut buf = vec![0u8; ETHERNET_HEADER_SIZE + tag_len + payload_len];

    let outer = if vlan_id.is_some() {
        ETHERTYPE_VLAN
    } else {
        ethertype
    };
    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype: EthernetProtocol::from(outer),
    };
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    eth_repr.emit(&mut frame);

    let body = frame.payload_mut();
    let body = match vlan_id {
        Some(vid) => {
            body[0..2].copy_from_slice(&(vid & 0x0fff).to_be_bytes());
            body[2..4].copy_from_slice(&ethertype.to_be_bytes());
            &mut body[VLAN_TAG_SIZE..]
        }
        None => body,
    };
    emit_payload(body);
    buf
}
