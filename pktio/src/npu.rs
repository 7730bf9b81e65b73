//! Switch hardware (NPU) boundary.
//!
//! The hardware SDK is an external collaborator: it delivers punted frames
//! through [`crate::packet_io::PacketIo::on_hardware_receive`] and accepts
//! frames for transmission through an [`NpuDriver`].

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::trace;

/// Switch (NPU) identifier.
pub type NpuId = u32;

/// Port identifier within an NPU.
pub type PortId = u32;

/// Hardware object id of a bridge domain.
pub type BridgeId = u64;

/// An (npu, port) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NpuPort {
    pub npu: NpuId,
    pub port: PortId,
}

impl NpuPort {
    pub const fn new(npu: NpuId, port: PortId) -> Self {
        Self { npu, port }
    }
}

impl std::fmt::Display for NpuPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.npu, self.port)
    }
}

/// Trap id the hardware reports for sFlow-sampled packets.
pub const SAMPLE_PACKET_TRAP_ID: u64 = 0x1000;

/// NPU transmit errors.
#[derive(Debug, Error)]
pub enum NpuError {
    #[error("NPU {npu} rejected frame for port {port}: {reason}")]
    Rejected {
        npu: NpuId,
        port: PortId,
        reason: String,
    },

    #[error("NPU {0} is not available")]
    Unavailable(NpuId),
}

/// Attributes the hardware attaches to a punted frame.
///
/// Filter actions may rewrite the port fields before the frame is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacketAttrs {
    pub npu_id: NpuId,
    pub rx_port: PortId,
    pub tx_port: PortId,
    pub trap_id: u64,
}

/// How the hardware should handle an injected frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxType {
    /// Send straight out of `tx_port`, skipping forwarding lookup.
    PipelineBypass,
    /// Inject into the ingress pipeline and let the hardware forward it.
    PipelineLookup,
    /// Inject into the ingress pipeline scoped to a bridge domain.
    PipelineHybrid,
}

/// Transmit request handed to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TxAttrs {
    pub npu_id: NpuId,
    pub tx_port: PortId,
    pub tx_type: TxType,
    /// Only meaningful for [`TxType::PipelineHybrid`].
    pub bridge_id: BridgeId,
}

impl TxAttrs {
    pub fn bypass(npu_id: NpuId, tx_port: PortId) -> Self {
        Self {
            npu_id,
            tx_port,
            tx_type: TxType::PipelineBypass,
            bridge_id: 0,
        }
    }
}

/// Hardware transmit entry point.
pub trait NpuDriver: Send + Sync {
    fn transmit(&self, frame: &[u8], attrs: &TxAttrs) -> Result<(), NpuError>;
}

/// Driver used when no hardware SDK is linked in.
///
/// Accepts every frame and only traces it; keeps a running count so the
/// daemon can report how much it would have sent.
#[derive(Debug, Default)]
pub struct LoopbackNpu {
    sent: Mutex<u64>,
}

impl LoopbackNpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        *self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NpuDriver for LoopbackNpu {
    fn transmit(&self, frame: &[u8], attrs: &TxAttrs) -> Result<(), NpuError> {
        trace!(
            npu = attrs.npu_id,
            port = attrs.tx_port,
            tx_type = ?attrs.tx_type,
            bridge_id = attrs.bridge_id,
            len = frame.len(),
            "NPU transmit"
        );
        *self.sent.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
