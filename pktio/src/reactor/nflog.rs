//! NFLOG netlink channel.
//!
//! Subscribes to one nfnetlink_log group in copy-packet mode and turns
//! `NFULNL_MSG_PACKET` messages into [`NflogPacket`]s. Every config command
//! is sent with `NLM_F_ACK` and the subscription fails if the kernel
//! rejects any of them.

use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload};
use netlink_packet_netfilter::constants::{
    AF_BRIDGE, AF_INET, AF_INET6, AF_UNSPEC, NFNETLINK_V0, NFULA_PACKET_HDR,
};
use netlink_packet_netfilter::nflog::nlas::config::{ConfigCmd, ConfigMode, ConfigNla};
use netlink_packet_netfilter::nflog::nlas::packet::{PacketHdr, PacketNla};
use netlink_packet_netfilter::nflog::{NfLogMessage, config_request};
use netlink_packet_netfilter::{NetfilterHeader, NetfilterMessage, NetfilterMessageInner};
use netlink_packet_utils::DecodeError;
use netlink_packet_utils::nla::{DefaultNla, Nla};
use netlink_sys::constants::NETLINK_NETFILTER;
use netlink_sys::Socket;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Copy range requested from the kernel.
const COPY_RANGE: u32 = 0xffff;

/// Receive buffer; one netlink datagram can carry a jumbo payload.
const RECV_BUF_SIZE: usize = 65536;

#[derive(Debug, Error)]
pub enum NflogError {
    #[error("failed to open netlink socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] io::Error),

    #[error("NFLOG config command {command} failed: {source}")]
    Config {
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("netlink receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("malformed netlink message: {0}")]
    Decode(#[from] DecodeError),
}

pub type Result<T> = std::result::Result<T, NflogError>;

/// One logged packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NflogPacket {
    /// Ethertype of the payload (host order).
    pub hw_protocol: u16,
    /// Interface the kernel was sending the packet out of.
    pub out_ifindex: u32,
    /// Layer 3 payload.
    pub payload: Vec<u8>,
}

/// Netlink socket subscribed to an NFLOG group.
pub struct NflogSocket {
    socket: Socket,
    buf: Vec<u8>,
    seq: u32,
}

impl NflogSocket {
    /// Opens a non-blocking netfilter netlink socket and binds it to `group`
    /// for IPv4, IPv6 and bridge traffic.
    pub fn open(group: u16) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_NETFILTER).map_err(NflogError::Socket)?;
        socket.bind_auto().map_err(NflogError::Bind)?;

        let mut nflog = Self::new(socket);
        nflog.subscribe(group)?;
        nflog.set_non_blocking()?;

        info!(group, "NFLOG socket bound");
        Ok(nflog)
    }

    /// Wraps an already subscribed datagram fd.
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        // SAFETY: the fd comes out of an `OwnedFd`, so the socket takes sole
        // ownership and closes it on drop.
        let socket = unsafe { Socket::from_raw_fd(fd.into_raw_fd()) };
        let nflog = Self::new(socket);
        nflog.set_non_blocking()?;
        Ok(nflog)
    }

    fn new(socket: Socket) -> Self {
        Self {
            socket,
            buf: vec![0u8; RECV_BUF_SIZE],
            seq: 0,
        }
    }

    fn set_non_blocking(&self) -> Result<()> {
        self.socket
            .set_non_blocking(true)
            .map_err(NflogError::Socket)
    }

    /// Runs the config sequence for `group` on a blocking socket.
    fn subscribe(&mut self, group: u16) -> Result<()> {
        for family in [AF_INET, AF_INET6, AF_BRIDGE] {
            self.configure("PF_BIND", family, 0, ConfigNla::Cmd(ConfigCmd::PfBind))?;
        }
        self.configure("BIND", AF_UNSPEC, group, ConfigNla::Cmd(ConfigCmd::Bind))?;
        self.configure(
            "COPY_PACKET",
            AF_UNSPEC,
            group,
            ConfigNla::Mode(ConfigMode::new_packet(COPY_RANGE)),
        )
    }

    /// Sends one config command and waits for its ack.
    fn configure(
        &mut self,
        command: &'static str,
        family: u8,
        group: u16,
        nla: ConfigNla,
    ) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let mut request = config_request(family, group, vec![nla]);
        request.header.sequence_number = self.seq;

        let mut out = vec![0u8; request.buffer_len()];
        request.serialize(&mut out);
        self.socket
            .send(&out, 0)
            .map_err(|source| NflogError::Config { command, source })?;

        self.wait_ack(command)?;
        debug!(command, family, group, "NFLOG config acked");
        Ok(())
    }

    fn wait_ack(&mut self, command: &'static str) -> Result<()> {
        loop {
            let n = self
                .socket
                .recv(&mut &mut self.buf[..], 0)
                .map_err(|source| NflogError::Config { command, source })?;

            let mut datagram = &self.buf[..n.min(self.buf.len())];
            while !datagram.is_empty() {
                let msg = NetlinkMessage::<NetfilterMessage>::deserialize(datagram)?;
                if let NetlinkPayload::Error(err) = &msg.payload
                    && msg.header.sequence_number == self.seq
                {
                    return match err.code {
                        None => Ok(()),
                        Some(_) => Err(NflogError::Config {
                            command,
                            source: err.to_io(),
                        }),
                    };
                }
                trace!(
                    seq = msg.header.sequence_number,
                    "Skipping netlink message while waiting for ack"
                );
                datagram = &datagram[next_message(msg.header.length, datagram.len())..];
            }
        }
    }

    /// Reads one datagram. Returns `Ok(None)` when nothing is pending.
    pub fn recv(&mut self) -> Result<Option<Vec<NflogPacket>>> {
        let n = match self.socket.recv(&mut &mut self.buf[..], 0) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(NflogError::Recv(e)),
        };
        Ok(Some(parse_datagram(&self.buf[..n.min(self.buf.len())])?))
    }
}

impl AsFd for NflogSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// Offset of the next message in a datagram of `remaining` bytes.
fn next_message(length: u32, remaining: usize) -> usize {
    match (length as usize + 3) & !3 {
        0 => remaining,
        aligned => aligned.min(remaining),
    }
}

/// Encodes a packet message the way the kernel sends it.
pub fn encode_packet_message(packet: &NflogPacket) -> Vec<u8> {
    let mut hdr = packet.hw_protocol.to_be_bytes().to_vec();
    hdr.extend_from_slice(&[0, 0]);
    let nlas = vec![
        PacketNla::Other(DefaultNla::new(NFULA_PACKET_HDR, hdr)),
        PacketNla::IfIndexOutDev(packet.out_ifindex),
        PacketNla::Payload(packet.payload.clone()),
    ];
    let inner = NetfilterMessage::new(
        NetfilterHeader::new(AF_BRIDGE, NFNETLINK_V0, 0),
        NfLogMessage::Packet(nlas),
    );

    let mut msg = NetlinkMessage::new(NetlinkHeader::default(), NetlinkPayload::from(inner));
    msg.finalize();
    let mut out = vec![0u8; msg.buffer_len()];
    msg.serialize(&mut out);
    out
}

/// Parses every packet message in one netlink datagram.
///
/// Acks, errors and other message types are skipped. A packet message
/// without a payload or header attribute is skipped too.
pub fn parse_datagram(mut buf: &[u8]) -> Result<Vec<NflogPacket>> {
    let mut packets = Vec::new();
    while !buf.is_empty() {
        let msg = NetlinkMessage::<NetfilterMessage>::deserialize(buf)?;
        let length = msg.header.length;

        match msg.payload {
            NetlinkPayload::InnerMessage(NetfilterMessage {
                inner: NetfilterMessageInner::NfLog(NfLogMessage::Packet(nlas)),
                ..
            }) => match packet_from_nlas(nlas) {
                Some(packet) => packets.push(packet),
                None => debug!("NFLOG packet message without payload skipped"),
            },
            NetlinkPayload::Error(err) if err.code.is_some() => {
                warn!(errno = err.raw_code(), "Netlink error message");
            }
            NetlinkPayload::InnerMessage(other) => {
                trace!(msg_type = other.message_type(), "Ignoring netlink message");
            }
            _ => {}
        }

        buf = &buf[next_message(length, buf.len())..];
    }
    Ok(packets)
}

fn packet_from_nlas(nlas: Vec<PacketNla>) -> Option<NflogPacket> {
    let mut hw_protocol = None;
    let mut out_ifindex = 0;
    let mut payload = None;

    for nla in nlas {
        match nla {
            PacketNla::PacketHdr(hdr) => hw_protocol = Some(hw_protocol_of(&hdr)),
            PacketNla::IfIndexOutDev(ifindex) => out_ifindex = ifindex,
            PacketNla::Payload(data) => payload = Some(data),
            _ => {}
        }
    }

    Some(NflogPacket {
        hw_protocol: hw_protocol?,
        out_ifindex,
        payload: payload?,
    })
}

/// `PacketHdr` keeps its fields private; its wire form leads with the
/// big-endian ethertype.
fn hw_protocol_of(hdr: &PacketHdr) -> u16 {
    let mut raw = [0u8; 4];
    hdr.emit_value(&mut raw);
    u16::from_be_bytes([raw[0], raw[1]])
}
