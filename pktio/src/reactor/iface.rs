//! Interface context used when rebuilding flooded control frames.

use crate::filter::MacAddr;
use crate::npu::BridgeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Bridge membership of an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BridgeKind {
    #[default]
    None,
    /// VLAN-aware bridge; frames are forwarded by VLAN lookup.
    Dot1q,
    /// VLAN-unaware bridge domain, addressed by its hardware object id.
    Dot1d { bridge_id: BridgeId },
}

/// What the reactor needs to know about the interface a frame was flooded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub mac: MacAddr,
    pub vlan_id: Option<u16>,
    pub bridge: BridgeKind,
}

impl InterfaceInfo {
    pub fn plain(mac: MacAddr) -> Self {
        Self {
            mac,
            vlan_id: None,
            bridge: BridgeKind::None,
        }
    }
}

pub trait InterfaceResolver: Send + Sync {
    fn interface(&self, ifindex: u32) -> Option<InterfaceInfo>;
}

/// Interface table filled in by the control plane.
///
/// With the kernel fallback enabled, an ifindex missing from the table is
/// looked up in sysfs and treated as a plain, untagged interface.
#[derive(Debug, Default)]
pub struct InterfaceTable {
    entries: RwLock<HashMap<u32, InterfaceInfo>>,
    kernel_fallback: bool,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel_fallback() -> Self {
        Self {
            entries: RwLock::default(),
            kernel_fallback: true,
        }
    }

    pub fn set(&self, ifindex: u32, info: InterfaceInfo) {
        debug!(
            ifindex,
            mac = %info.mac,
            vlan = ?info.vlan_id,
            bridge = ?info.bridge,
            "Interface context updated"
        );
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ifindex, info);
    }

    pub fn remove(&self, ifindex: u32) -> Option<InterfaceInfo> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ifindex)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InterfaceResolver for InterfaceTable {
    fn interface(&self, ifindex: u32) -> Option<InterfaceInfo> {
        let known = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ifindex)
            .copied();
        match known {
            Some(info) => Some(info),
            None if self.kernel_fallback => kernel_mac(ifindex).map(InterfaceInfo::plain),
            None => None,
        }
    }
}

/// MAC address of a kernel interface, read from sysfs.
pub fn kernel_mac(ifindex: u32) -> Option<MacAddr> {
    let mut name = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(ifindex, name.as_mut_ptr()) };
    if ret.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name.as_ptr()) }.to_str().ok()?;
    let address = fs::read_to_string(format!("/sys/class/net/{name}/address")).ok()?;
    address.trim().parse().ok()
}
