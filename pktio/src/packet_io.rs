//! Host packet path between the switch hardware and the TAP devices.
//!
//! Receive: sampled frames go to the sFlow collector with metadata, control
//! frames run through the ingress filter, everything else is written to the
//! TAP device of the receiving port. Transmit: frames read from TAP devices
//! are sent out of the matching NPU port, bypassing the forwarding pipeline;
//! reconstructed frames are injected into the ingress pipeline instead.

use crate::filter::{Direction, PacketFilter};
use crate::meta::{self, MetaAttrType};
use crate::npu::{
    BridgeId, NpuDriver, NpuError, NpuId, PacketAttrs, PortId, SAMPLE_PACKET_TRAP_ID, TxAttrs,
    TxType,
};
use crate::port::{PortRegistry, PortResolver};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt::Write as _;
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

/// Default sFlow collector.
pub const DEFAULT_SAMPLE_DESTINATION: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 20001);

/// NPU used for frames injected into the ingress pipeline.
const INGRESS_NPU: NpuId = 0;

/// Metadata block size for sampled frames.
const SAMPLE_META_BUF_SIZE: usize = 128;

/// Which directions get hex-dumped to the debug log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketDebug {
    #[default]
    Off,
    In,
    Out,
    Both,
}

impl PacketDebug {
    const IN: u8 = 1 << 1;
    const OUT: u8 = 1 << 2;

    fn bits(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::In => Self::IN,
            Self::Out => Self::OUT,
            Self::Both => Self::IN | Self::OUT,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match (bits & Self::IN != 0, bits & Self::OUT != 0) {
            (false, false) => Self::Off,
            (true, false) => Self::In,
            (false, true) => Self::Out,
            (true, true) => Self::Both,
        }
    }
}

impl std::str::FromStr for PacketDebug {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "false" => Ok(Self::Off),
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "both" | "true" => Ok(Self::Both),
            other => Err(format!("unknown packet debug mode '{other}'")),
        }
    }
}

/// How a reconstructed frame enters the ingress pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressMode {
    /// Full forwarding lookup.
    Lookup,
    /// Lookup scoped to a bridge domain.
    Hybrid(BridgeId),
}

/// What the receive path did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDisposition {
    Sampled,
    Filtered,
    Delivered,
    Dropped,
}

#[derive(Debug, Default)]
struct Counters {
    rx: AtomicU64,
    rx_filtered: AtomicU64,
    rx_errors: AtomicU64,
    tx: AtomicU64,
    tx_bypass: AtomicU64,
    tx_lookup: AtomicU64,
    tx_hybrid: AtomicU64,
    tx_errors: AtomicU64,
    samples: AtomicU64,
    sample_errors: AtomicU64,
}

/// Point-in-time copy of the packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub rx: u64,
    pub rx_filtered: u64,
    pub rx_errors: u64,
    pub tx: u64,
    pub tx_bypass: u64,
    pub tx_lookup: u64,
    pub tx_hybrid: u64,
    pub tx_errors: u64,
    pub samples: u64,
    pub sample_errors: u64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

/// UDP channel to the sFlow collector.
struct SampleSink {
    socket: Socket,
    destination: ArcSwap<SocketAddrV4>,
    count: AtomicU64,
}

impl SampleSink {
    fn new(destination: SocketAddrV4) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        Ok(Self {
            socket,
            destination: ArcSwap::from_pointee(destination),
            count: AtomicU64::new(0),
        })
    }
}

/// The packet I/O dispatcher.
pub struct PacketIo {
    filter: Arc<PacketFilter>,
    ports: Arc<PortRegistry>,
    npu: Arc<dyn NpuDriver>,
    sample: SampleSink,
    counters: Counters,
    debug: AtomicU8,
}

impl PacketIo {
    pub fn new(
        filter: Arc<PacketFilter>,
        ports: Arc<PortRegistry>,
        npu: Arc<dyn NpuDriver>,
        sample_destination: SocketAddrV4,
    ) -> io::Result<Self> {
        Ok(Self {
            filter,
            ports,
            npu,
            sample: SampleSink::new(sample_destination)?,
            counters: Counters::default(),
            debug: AtomicU8::new(0),
        })
    }

    pub fn filter(&self) -> &Arc<PacketFilter> {
        &self.filter
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    /// Entry point for frames punted by the hardware.
    pub fn on_hardware_receive(&self, frame: &[u8], attrs: PacketAttrs) -> RxDisposition {
        let rx = bump(&self.counters.rx);
        self.dump(PacketDebug::IN, frame);
        trace!(
            npu = attrs.npu_id,
            port = attrs.rx_port,
            len = frame.len(),
            rx,
            "Frame received from NPU"
        );

        if attrs.trap_id == SAMPLE_PACKET_TRAP_ID {
            return match self.forward_sample(frame, &attrs) {
                Ok(()) => RxDisposition::Sampled,
                Err(()) => RxDisposition::Dropped,
            };
        }

        let mut attrs = attrs;
        if self.filter.ingress_enabled()
            && self
                .filter
                .evaluate(Direction::Ingress, frame, &mut attrs)
        {
            bump(&self.counters.rx_filtered);
            return RxDisposition::Filtered;
        }

        match self.ports.write(attrs.npu_id, attrs.rx_port, 0, frame) {
            Ok(()) => {
                debug!(npu = attrs.npu_id, port = attrs.rx_port, "Frame written to TAP");
                RxDisposition::Delivered
            }
            Err(e) => {
                bump(&self.counters.rx_errors);
                error!(
                    npu = attrs.npu_id,
                    port = attrs.rx_port,
                    error = %e,
                    "Failed to write frame to TAP"
                );
                RxDisposition::Dropped
            }
        }
    }

    /// Sends `[metadata][frame]` for a sampled frame to the collector.
    fn forward_sample(&self, frame: &[u8], attrs: &PacketAttrs) -> Result<(), ()> {
        let Some(rx_ifindex) = self.ports.ifindex_of(attrs.npu_id, attrs.rx_port) else {
            debug!(npu = attrs.npu_id, port = attrs.rx_port, "Sample from unknown port dropped");
            bump(&self.counters.sample_errors);
            return Err(());
        };
        let tx_ifindex = self
            .ports
            .ifindex_of(attrs.npu_id, attrs.tx_port)
            .unwrap_or_else(|| {
                debug!(npu = attrs.npu_id, port = attrs.tx_port, "No ifindex for sample tx port");
                0
            });

        let sample_count = self.sample.count.fetch_add(1, Ordering::Relaxed);
        let mut meta_buf = [0u8; SAMPLE_META_BUF_SIZE];
        let meta = meta::init_writer(&mut meta_buf).and_then(|mut meta| {
            meta.append_u32(MetaAttrType::RxPort, rx_ifindex)?;
            meta.append_u32(MetaAttrType::TxPort, tx_ifindex)?;
            meta.append_u64(MetaAttrType::SampleCount, sample_count)?;
            meta.append_u32(MetaAttrType::PktLen, frame.len() as u32)?;
            Ok(meta)
        });
        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                bump(&self.counters.sample_errors);
                error!(error = %e, "Failed to build sample metadata");
                return Err(());
            }
        };

        let dest = **self.sample.destination.load();
        let bufs = [IoSlice::new(meta.written()), IoSlice::new(frame)];
        match self.sample.socket.send_to_vectored(&bufs, &SockAddr::from(dest)) {
            Ok(_) => {
                bump(&self.counters.samples);
                trace!(dest = %dest, rx_ifindex, tx_ifindex, sample_count, "Sample forwarded");
                Ok(())
            }
            Err(e) => {
                bump(&self.counters.sample_errors);
                error!(dest = %dest, error = %e, "Failed to forward sample");
                Err(())
            }
        }
    }

    /// Entry point for frames read from a port's TAP device.
    ///
    /// The egress filter only observes; its verdict never blocks the frame.
    pub fn on_kernel_transmit(
        &self,
        npu: NpuId,
        port: PortId,
        frame: &[u8],
    ) -> Result<(), NpuError> {
        let tx = bump(&self.counters.tx);
        bump(&self.counters.tx_bypass);
        self.dump(PacketDebug::OUT, frame);

        if self.filter.egress_enabled() {
            let mut attrs = PacketAttrs {
                npu_id: npu,
                tx_port: port,
                ..Default::default()
            };
            let stop = self.filter.evaluate(Direction::Egress, frame, &mut attrs);
            debug!(npu, port, stop, "Egress filter evaluated");
        }

        let attrs = TxAttrs::bypass(npu, port);
        self.transmit(frame, &attrs)?;
        trace!(npu, port, len = frame.len(), tx, "Frame sent to NPU");
        Ok(())
    }

    /// Injects a frame into the ingress pipeline of the hardware.
    pub fn on_kernel_transmit_to_ingress(
        &self,
        frame: &[u8],
        mode: IngressMode,
    ) -> Result<(), NpuError> {
        bump(&self.counters.tx);
        let attrs = match mode {
            IngressMode::Lookup => {
                bump(&self.counters.tx_lookup);
                TxAttrs {
                    npu_id: INGRESS_NPU,
                    tx_port: 0,
                    tx_type: TxType::PipelineLookup,
                    bridge_id: 0,
                }
            }
            IngressMode::Hybrid(bridge_id) => {
                bump(&self.counters.tx_hybrid);
                TxAttrs {
                    npu_id: INGRESS_NPU,
                    tx_port: 0,
                    tx_type: TxType::PipelineHybrid,
                    bridge_id,
                }
            }
        };
        self.dump(PacketDebug::OUT, frame);
        self.transmit(frame, &attrs)?;
        debug!(len = frame.len(), ?mode, "Frame injected into ingress pipeline");
        Ok(())
    }

    fn transmit(&self, frame: &[u8], attrs: &TxAttrs) -> Result<(), NpuError> {
        self.npu.transmit(frame, attrs).inspect_err(|e| {
            bump(&self.counters.tx_errors);
            error!(
                npu = attrs.npu_id,
                port = attrs.tx_port,
                tx_type = ?attrs.tx_type,
                len = frame.len(),
                error = %e,
                "NPU transmit failed"
            );
        })
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            rx: load(&c.rx),
            rx_filtered: load(&c.rx_filtered),
            rx_errors: load(&c.rx_errors),
            tx: load(&c.tx),
            tx_bypass: load(&c.tx_bypass),
            tx_lookup: load(&c.tx_lookup),
            tx_hybrid: load(&c.tx_hybrid),
            tx_errors: load(&c.tx_errors),
            samples: load(&c.samples),
            sample_errors: load(&c.sample_errors),
        }
    }

    pub fn sample_destination(&self) -> SocketAddrV4 {
        **self.sample.destination.load()
    }

    pub fn set_sample_destination(&self, destination: SocketAddrV4) {
        self.sample.destination.store(Arc::new(destination));
        info!(destination = %destination, "sFlow sample destination updated");
    }

    /// Count to be stamped on the next sample.
    pub fn sample_count(&self) -> u64 {
        self.sample.count.load(Ordering::Relaxed)
    }

    pub fn packet_debug(&self) -> PacketDebug {
        PacketDebug::from_bits(self.debug.load(Ordering::Relaxed))
    }

    pub fn set_packet_debug(&self, mode: PacketDebug) {
        self.debug.store(mode.bits(), Ordering::Relaxed);
        if mode != PacketDebug::Off {
            warn!(?mode, "Packet dumps enabled, expect heavy logging");
        }
    }

    fn dump(&self, direction: u8, frame: &[u8]) {
        if self.debug.load(Ordering::Relaxed) & direction == 0 {
            return;
        }
        let dir = if direction == PacketDebug::IN { "in" } else { "out" };
        debug!(dir, len = frame.len(), "Packet dump\n{}", hex_dump(frame));
    }
}

/// Formats bytes as hex, 16 per line.
fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, line) in bytes.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, b) in line.iter().enumerate() {
            if j > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{b:02x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ActionEntry, ActionSet, MatchEntry, MatchSet};
    use crate::tap::TapDriver;
    use crate::test_util::{MockNpu, PairTapDriver, RecordingWatcher};
    use std::net::UdpSocket;
    use std::time::Duration;

    struct Fixture {
        io: PacketIo,
        npu: Arc<MockNpu>,
        driver: Arc<PairTapDriver>,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(PairTapDriver::new());
        let ports = Arc::new(
            PortRegistry::new(
                Arc::clone(&driver) as Arc<dyn TapDriver>,
                Arc::new(RecordingWatcher::default()),
                1,
                1,
            )
            .unwrap(),
        );
        ports.create_port(0, 1, "tap1").unwrap();
        ports.create_port(0, 2, "tap2").unwrap();
        ports.set_link(0, 1, true).unwrap();
        ports.set_link(0, 2, true).unwrap();

        let filter =
            Arc::new(PacketFilter::new(Arc::clone(&ports) as Arc<dyn PortResolver>).unwrap());
        let npu = Arc::new(MockNpu::default());
        let io = PacketIo::new(
            filter,
            ports,
            Arc::clone(&npu) as Arc<dyn NpuDriver>,
            DEFAULT_SAMPLE_DESTINATION,
        )
        .unwrap();
        Fixture { io, npu, driver }
    }

    fn collector() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let std::net::SocketAddr::V4(addr) = socket.local_addr().unwrap() else {
            panic!("expected IPv4 collector address");
        };
        (socket, addr)
    }

    #[test]
    fn test_receive_delivers_to_tap() {
        let f = fixture();
        let attrs = PacketAttrs {
            npu_id: 0,
            rx_port: 1,
            tx_port: 0,
            trap_id: 3,
        };
        assert_eq!(
            f.io.on_hardware_receive(&[7u8; 60], attrs),
            RxDisposition::Delivered
        );
        assert_eq!(f.driver.take_written("tap1"), vec![vec![7u8; 60]]);
        assert_eq!(f.io.counters().rx, 1);
    }

    #[test]
    fn test_receive_on_down_link_is_silent() {
        let f = fixture();
        f.io.ports().set_link(0, 2, false).unwrap();
        let attrs = PacketAttrs {
            rx_port: 2,
            ..Default::default()
        };
        assert_eq!(
            f.io.on_hardware_receive(&[1u8; 60], attrs),
            RxDisposition::Delivered
        );
        assert!(f.driver.take_written("tap2").is_empty());
    }

    #[test]
    fn test_receive_unknown_port_counts_error() {
        let f = fixture();
        let attrs = PacketAttrs {
            rx_port: 42,
            ..Default::default()
        };
        assert_eq!(
            f.io.on_hardware_receive(&[1u8; 60], attrs),
            RxDisposition::Dropped
        );
        assert_eq!(f.io.counters().rx_errors, 1);
    }

    #[test]
    fn test_ingress_stop_drops_frame() {
        let f = fixture();
        f.io.filter()
            .add_rule(
                Direction::Ingress,
                MatchSet::try_from(vec![MatchEntry::user_trap_id(9)]).unwrap(),
                ActionSet::new(),
                true,
            )
            .unwrap();

        let attrs = PacketAttrs {
            rx_port: 1,
            trap_id: 9,
            ..Default::default()
        };
        assert_eq!(
            f.io.on_hardware_receive(&[1u8; 60], attrs),
            RxDisposition::Filtered
        );
        assert!(f.driver.take_written("tap1").is_empty());
        assert_eq!(f.io.counters().rx_filtered, 1);
    }

    #[test]
    fn test_ingress_redirect_changes_target_port() {
        let f = fixture();
        let tap2_ifindex = f.io.ports().ifindex_of(0, 2).unwrap();
        f.io.filter()
            .add_rule(
                Direction::Ingress,
                MatchSet::try_from(vec![MatchEntry::user_trap_id(9)]).unwrap(),
                ActionSet::try_from(vec![ActionEntry::redirect_if(tap2_ifindex)]).unwrap(),
                false,
            )
            .unwrap();

        let attrs = PacketAttrs {
            rx_port: 1,
            trap_id: 9,
            ..Default::default()
        };
        assert_eq!(
            f.io.on_hardware_receive(&[5u8; 60], attrs),
            RxDisposition::Delivered
        );
        assert!(f.driver.take_written("tap1").is_empty());
        assert_eq!(f.driver.take_written("tap2"), vec![vec![5u8; 60]]);
    }

    #[test]
    fn test_sample_forwarded_with_metadata() {
        let f = fixture();
        let (collector, addr) = collector();
        f.io.set_sample_destination(addr);
        assert_eq!(f.io.sample_destination(), addr);

        let rx_ifindex = f.io.ports().ifindex_of(0, 1).unwrap();
        let tx_ifindex = f.io.ports().ifindex_of(0, 2).unwrap();
        let attrs = PacketAttrs {
            npu_id: 0,
            rx_port: 1,
            tx_port: 2,
            trap_id: SAMPLE_PACKET_TRAP_ID,
        };
        let frame = [0x5au8; 80];
        for expected_count in 0..2u64 {
            assert_eq!(
                f.io.on_hardware_receive(&frame, attrs),
                RxDisposition::Sampled
            );

            let mut buf = [0u8; 512];
            let n = collector.recv(&mut buf).unwrap();
            let datagram = &buf[..n];
            let attrs: Vec<_> = meta::begin_read(datagram)
                .unwrap()
                .map(|a| (a.attr_type().unwrap(), a.data_u64()))
                .collect();
            assert_eq!(
                attrs,
                vec![
                    (MetaAttrType::RxPort, rx_ifindex as u64),
                    (MetaAttrType::TxPort, tx_ifindex as u64),
                    (MetaAttrType::SampleCount, expected_count),
                    (MetaAttrType::PktLen, 80),
                ]
            );
            assert_eq!(&datagram[meta::data_offset(datagram)..], &frame[..]);
        }
        assert_eq!(f.io.sample_count(), 2);
        assert_eq!(f.io.counters().samples, 2);
        // Sampled frames never reach the TAP device.
        assert!(f.driver.take_written("tap1").is_empty());
    }

    #[test]
    fn test_sample_from_unknown_port_dropped() {
        let f = fixture();
        let attrs = PacketAttrs {
            rx_port: 77,
            trap_id: SAMPLE_PACKET_TRAP_ID,
            ..Default::default()
        };
        assert_eq!(
            f.io.on_hardware_receive(&[0u8; 60], attrs),
            RxDisposition::Dropped
        );
        assert_eq!(f.io.counters().sample_errors, 1);
        assert_eq!(f.io.sample_count(), 0);
    }

    #[test]
    fn test_transmit_bypasses_pipeline() {
        let f = fixture();
        f.io.on_kernel_transmit(0, 2, &[9u8; 64]).unwrap();

        let sent = f.npu.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, TxAttrs::bypass(0, 2));
        let c = f.io.counters();
        assert_eq!((c.tx, c.tx_bypass), (1, 1));
    }

    #[test]
    fn test_egress_stop_is_advisory() {
        let f = fixture();
        let mac = [0x01, 0x80, 0xc2, 0x00, 0x00, 0x00];
        f.io.filter()
            .add_rule(
                Direction::Egress,
                MatchSet::try_from(vec![MatchEntry::dst_mac(mac)]).unwrap(),
                ActionSet::new(),
                true,
            )
            .unwrap();

        let mut frame = [0u8; 64];
        frame[..6].copy_from_slice(&mac);
        f.io.on_kernel_transmit(0, 1, &frame).unwrap();
        assert_eq!(f.npu.sent().len(), 1);
    }

    #[test]
    fn test_transmit_failure_counted() {
        let f = fixture();
        f.npu.fail(true);
        assert!(f.io.on_kernel_transmit(0, 1, &[0u8; 64]).is_err());
        assert_eq!(f.io.counters().tx_errors, 1);
    }

    #[test]
    fn test_ingress_injection_modes() {
        let f = fixture();
        f.io
            .on_kernel_transmit_to_ingress(&[1u8; 64], IngressMode::Lookup)
            .unwrap();
        f.io
            .on_kernel_transmit_to_ingress(&[2u8; 64], IngressMode::Hybrid(0x2000_0001))
            .unwrap();

        let sent = f.npu.sent();
        assert_eq!(sent[0].1.tx_type, TxType::PipelineLookup);
        assert_eq!(sent[0].1.npu_id, 0);
        assert_eq!(sent[1].1.tx_type, TxType::PipelineHybrid);
        assert_eq!(sent[1].1.bridge_id, 0x2000_0001);

        let c = f.io.counters();
        assert_eq!((c.tx, c.tx_lookup, c.tx_hybrid, c.tx_bypass), (2, 1, 1, 0));
    }

    #[test]
    fn test_packet_debug_modes() {
        let f = fixture();
        assert_eq!(f.io.packet_debug(), PacketDebug::Off);
        for mode in [PacketDebug::In, PacketDebug::Out, PacketDebug::Both, PacketDebug::Off] {
            f.io.set_packet_debug(mode);
            assert_eq!(f.io.packet_debug(), mode);
        }
        assert_eq!("both".parse::<PacketDebug>().unwrap(), PacketDebug::Both);
        assert!("sideways".parse::<PacketDebug>().is_err());
    }

    #[test]
    fn test_hex_dump_layout() {
        let bytes: Vec<u8> = (0..18).collect();
        assert_eq!(
            hex_dump(&bytes),
            "00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n10 11"
        );
    }
}
