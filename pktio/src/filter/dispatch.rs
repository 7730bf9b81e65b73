//! Per-type match and action handlers.
//!
//! Handlers live in fixed tables indexed by the type discriminant. Slots
//! without a real handler point at the "not supported" handlers, and a tag
//! outside the table falls back to them too.

use super::rule::{ActionEntry, ActionType, ActionValue, MatchEntry, MatchType, MatchValue};
use super::{FilterError, Result};
use crate::meta::{self, MetaAttrType};
use crate::npu::PacketAttrs;
use crate::port::PortResolver;
use socket2::{SockAddr, Socket};
use std::io::IoSlice;
use tracing::{debug, trace};

/// Buffer size for the metadata block sent ahead of redirected frames.
const META_BUF_SIZE: usize = 128;

/// What action handlers may touch besides the frame.
pub(crate) struct ActionContext<'a> {
    pub socket: &'a Socket,
    pub resolver: &'a dyn PortResolver,
}

type MatchFn = fn(&MatchValue, &[u8], &PacketAttrs) -> bool;
type ActionFn = fn(&ActionContext<'_>, &ActionValue, &[u8], &mut PacketAttrs) -> Result<()>;

const MATCH_SLOTS: usize = MatchType::MAX as usize + 1;
const ACTION_SLOTS: usize = ActionType::MAX as usize + 1;

pub(crate) struct Dispatch {
    matches: [MatchFn; MATCH_SLOTS],
    actions: [ActionFn; ACTION_SLOTS],
}

impl Dispatch {
    pub fn new() -> Self {
        let mut matches = [match_not_supported as MatchFn; MATCH_SLOTS];
        matches[MatchType::HostifUserTrapId as usize] = match_user_trap_id;
        matches[MatchType::DstMac as usize] = match_dst_mac;

        let mut actions = [action_not_supported as ActionFn; ACTION_SLOTS];
        actions[ActionType::RedirectSock as usize] = action_redirect_sock;
        actions[ActionType::CopyToSock as usize] = action_redirect_sock;
        actions[ActionType::RedirectIf as usize] = action_redirect_if;

        Self { matches, actions }
    }

    pub fn run_match(&self, entry: &MatchEntry, frame: &[u8], attrs: &PacketAttrs) -> bool {
        let handler = self
            .matches
            .get(entry.kind as usize)
            .copied()
            .unwrap_or(match_not_supported);
        handler(&entry.value, frame, attrs)
    }

    pub fn run_action(
        &self,
        ctx: &ActionContext<'_>,
        entry: &ActionEntry,
        frame: &[u8],
        attrs: &mut PacketAttrs,
    ) -> Result<()> {
        let handler = self
            .actions
            .get(entry.kind as usize)
            .copied()
            .unwrap_or(action_not_supported);
        handler(ctx, &entry.value, frame, attrs)
    }
}

fn match_user_trap_id(value: &MatchValue, _frame: &[u8], attrs: &PacketAttrs) -> bool {
    trace!(pkt_trap_id = attrs.trap_id, rule = ?value, "Matching user trap id");
    matches!(value, MatchValue::U64(id) if *id == attrs.trap_id)
}

fn match_dst_mac(value: &MatchValue, frame: &[u8], _attrs: &PacketAttrs) -> bool {
    match value {
        MatchValue::Mac(mac) => frame.get(..6) == Some(&mac.0[..]),
        _ => false,
    }
}

fn match_not_supported(value: &MatchValue, _frame: &[u8], _attrs: &PacketAttrs) -> bool {
    debug!(value = ?value, "Match type not supported, treating as no match");
    false
}

/// Sends `[metadata][frame]` to the action's UDP destination.
fn action_redirect_sock(
    ctx: &ActionContext<'_>,
    value: &ActionValue,
    frame: &[u8],
    attrs: &mut PacketAttrs,
) -> Result<()> {
    let ActionValue::Socket(dest) = value else {
        return Err(FilterError::InvalidValue(format!(
            "{value:?} is not a socket destination"
        )));
    };

    let rx_ifindex = ctx
        .resolver
        .ifindex_of(attrs.npu_id, attrs.rx_port)
        .unwrap_or_else(|| {
            debug!(npu = attrs.npu_id, port = attrs.rx_port, "No ifindex for rx port");
            0
        });

    let mut meta_buf = [0u8; META_BUF_SIZE];
    let mut meta = meta::init_writer(&mut meta_buf)?;
    meta.append_u32(MetaAttrType::RxPort, rx_ifindex)?;
    meta.append_u32(MetaAttrType::PktLen, frame.len() as u32)?;
    meta.append_u64(MetaAttrType::TrapId, attrs.trap_id)?;

    let bufs = [IoSlice::new(meta.written()), IoSlice::new(frame)];
    ctx.socket
        .send_to_vectored(&bufs, &SockAddr::from(*dest))
        .map_err(|e| FilterError::Send(*dest, e))?;

    trace!(
        dest = %dest,
        rx_ifindex,
        len = frame.len(),
        "Frame redirected to socket"
    );
    Ok(())
}

/// Rewrites the frame's ports to the NPU port behind an ifindex.
fn action_redirect_if(
    ctx: &ActionContext<'_>,
    value: &ActionValue,
    _frame: &[u8],
    attrs: &mut PacketAttrs,
) -> Result<()> {
    let ActionValue::IfIndex(ifindex) = *value else {
        return Err(FilterError::InvalidValue(format!(
            "{value:?} is not an interface index"
        )));
    };

    let port = ctx
        .resolver
        .port_of(ifindex)
        .ok_or(FilterError::UnknownIfIndex(ifindex))?;

    debug!(
        ifindex,
        npu = port.npu,
        port = port.port,
        old_rx_port = attrs.rx_port,
        "Redirecting frame to interface"
    );
    attrs.npu_id = port.npu;
    attrs.rx_port = port.port;
    attrs.tx_port = port.port;
    Ok(())
}

fn action_not_supported(
    _ctx: &ActionContext<'_>,
    value: &ActionValue,
    _frame: &[u8],
    _attrs: &mut PacketAttrs,
) -> Result<()> {
    Err(FilterError::NotSupported(format!("{value:?}")))
}
