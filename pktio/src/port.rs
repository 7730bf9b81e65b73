//! Logical port bindings: (npu, port) ↔ TAP device.
//!
//! The registry keeps three indexes (by npu port, by device name, by kernel
//! ifindex) behind one read-write lock. The hardware receive path only takes
//! the read side; create/delete take the write side. A deleted port's slot
//! points at a shared dummy binding that never carries I/O.

use crate::npu::{NpuId, NpuPort, PortId};
use crate::tap::{TapDescriptor, TapDriver, TapError, TapKind};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default number of link-up attempts before giving up.
pub const DEFAULT_LINK_UP_RETRIES: u32 = 12;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {0} already exists")]
    AlreadyExists(NpuPort),

    #[error("device name '{0}' already bound to another port")]
    NameInUse(String),

    #[error("no such port {0}")]
    NoSuchPort(NpuPort),

    #[error("link up of '{name}' failed after {attempts} attempts: {source}")]
    LinkUp {
        name: String,
        attempts: u32,
        source: TapError,
    },

    #[error("write to port {port} failed: {source}")]
    Write { port: NpuPort, source: io::Error },

    #[error("short write to port {port}: {written} of {len} bytes")]
    ShortWrite {
        port: NpuPort,
        written: usize,
        len: usize,
    },

    #[error(transparent)]
    Tap(#[from] TapError),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Maps between kernel ifindexes and NPU ports.
pub trait PortResolver: Send + Sync {
    fn ifindex_of(&self, npu: NpuId, port: PortId) -> Option<u32>;
    fn port_of(&self, ifindex: u32) -> Option<NpuPort>;
}

/// Something that watches TAP queues for readability (the event loop).
pub trait TapWatcher: Send + Sync {
    fn watch(&self, port: NpuPort, tap: Arc<TapDescriptor>);
    fn unwatch(&self, tap: Arc<TapDescriptor>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Down,
    Up,
}

/// One logical port and its TAP device.
#[derive(Debug)]
pub struct PortBinding {
    port: NpuPort,
    ifindex: u32,
    tap: Arc<TapDescriptor>,
    link_up: AtomicBool,
    dummy: bool,
}

impl PortBinding {
    pub fn port(&self) -> NpuPort {
        self.port
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn tap(&self) -> &Arc<TapDescriptor> {
        &self.tap
    }

    pub fn link_state(&self) -> LinkState {
        if self.link_up.load(Ordering::Acquire) {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.dummy
    }
}

/// Diagnostic view of one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub npu: NpuId,
    pub port: PortId,
    pub name: String,
    pub ifindex: u32,
    pub link: LinkState,
    pub fds: Vec<i32>,
}

#[derive(Debug, Default)]
struct PortMaps {
    by_port: HashMap<NpuPort, Arc<PortBinding>>,
    by_name: HashMap<String, NpuPort>,
    by_ifindex: HashMap<u32, NpuPort>,
}

impl PortMaps {
    fn live(&self, port: NpuPort) -> Option<&Arc<PortBinding>> {
        self.by_port.get(&port).filter(|b| !b.is_dummy())
    }
}

/// Registry of logical ports.
pub struct PortRegistry {
    driver: Arc<dyn TapDriver>,
    watcher: Arc<dyn TapWatcher>,
    queues: usize,
    link_up_retries: u32,
    maps: RwLock<PortMaps>,
    dummy: Arc<PortBinding>,
}

impl PortRegistry {
    pub fn new(
        driver: Arc<dyn TapDriver>,
        watcher: Arc<dyn TapWatcher>,
        queues: usize,
        link_up_retries: u32,
    ) -> Result<Self> {
        let dummy = Arc::new(PortBinding {
            port: NpuPort::new(NpuId::MAX, PortId::MAX),
            ifindex: 0,
            tap: Arc::new(TapDescriptor::new("dummy", 1)?),
            link_up: AtomicBool::new(false),
            dummy: true,
        });
        // Validate once so create_port never fails on the queue count.
        TapDescriptor::new("probe", queues)?;
        Ok(Self {
            driver,
            watcher,
            queues,
            link_up_retries: link_up_retries.max(1),
            maps: RwLock::new(PortMaps::default()),
            dummy,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, PortMaps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn maps_mut(&self) -> RwLockWriteGuard<'_, PortMaps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the TAP device for a port and binds it. The link starts down.
    pub fn create_port(&self, npu: NpuId, port: PortId, name: &str) -> Result<u32> {
        let key = NpuPort::new(npu, port);
        {
            let maps = self.read();
            if maps.live(key).is_some() {
                return Err(PortError::AlreadyExists(key));
            }
            if maps.by_name.contains_key(name) {
                return Err(PortError::NameInUse(name.to_string()));
            }
        }

        let tap = Arc::new(TapDescriptor::new(name, self.queues)?);
        self.driver.operate(name, true)?;
        let ifindex = match self.driver.if_index(name) {
            Ok(ifindex) => ifindex,
            Err(e) => {
                let _ = self.driver.operate(name, false);
                return Err(e.into());
            }
        };

        let binding = Arc::new(PortBinding {
            port: key,
            ifindex,
            tap,
            link_up: AtomicBool::new(false),
            dummy: false,
        });

        let mut maps = self.maps_mut();
        // Another thread may have won the race while the device was created.
        if maps.live(key).is_some() || maps.by_name.contains_key(name) {
            drop(maps);
            let _ = self.driver.operate(name, false);
            return Err(PortError::AlreadyExists(key));
        }
        maps.by_port.insert(key, binding);
        maps.by_name.insert(name.to_string(), key);
        maps.by_ifindex.insert(ifindex, key);

        info!(npu, port, name, ifindex, "Port created");
        Ok(ifindex)
    }

    /// Unbinds a port, closes its queues and lets the kernel device go.
    pub fn delete_port(&self, npu: NpuId, port: PortId) -> Result<()> {
        let binding = self.unbind(NpuPort::new(npu, port))?;
        self.driver.operate(binding.tap.name(), false)?;
        info!(npu, port, name = %binding.tap.name(), "Port deleted");
        Ok(())
    }

    /// Removes a live binding, leaving the dummy in its slot, and closes
    /// its queues. The kernel device is left alone.
    fn unbind(&self, key: NpuPort) -> Result<Arc<PortBinding>> {
        let binding = {
            let mut maps = self.maps_mut();
            let binding = maps
                .live(key)
                .cloned()
                .ok_or(PortError::NoSuchPort(key))?;
            maps.by_port.insert(key, Arc::clone(&self.dummy));
            maps.by_name.remove(binding.tap.name());
            maps.by_ifindex.remove(&binding.ifindex);
            binding
        };
        self.link_down_binding(&binding);
        Ok(binding)
    }

    /// Applies an administrative link state change.
    pub fn set_link(&self, npu: NpuId, port: PortId, up: bool) -> Result<()> {
        let key = NpuPort::new(npu, port);
        let binding = self.binding(key).ok_or(PortError::NoSuchPort(key))?;
        if up {
            self.link_up_binding(&binding)
        } else {
            self.link_down_binding(&binding);
            Ok(())
        }
    }

    fn link_up_binding(&self, binding: &Arc<PortBinding>) -> Result<()> {
        let tap = binding.tap();
        // Down until the new queues exist; a failed re-link leaves it down.
        binding.link_up.store(false, Ordering::Release);
        self.watcher.unwatch(Arc::clone(tap));
        tap.close_all();

        let mut attempt = 0;
        loop {
            match tap.allocate(self.driver.as_ref(), TapKind::Tap, self.queues) {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.link_up_retries {
                        error!(
                            name = %tap.name(),
                            attempts = attempt,
                            error = %e,
                            "Link up failed"
                        );
                        return Err(PortError::LinkUp {
                            name: tap.name().to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let backoff = Duration::from_millis(1 << (attempt - 1).min(16));
                    warn!(
                        name = %tap.name(),
                        attempt,
                        ?backoff,
                        error = %e,
                        "TAP queue allocation failed, retrying"
                    );
                    thread::sleep(backoff);
                }
            }
        }

        binding.link_up.store(true, Ordering::Release);
        self.watcher.watch(binding.port, Arc::clone(tap));
        info!(npu = binding.port.npu, port = binding.port.port, name = %tap.name(), "Link up");
        Ok(())
    }

    fn link_down_binding(&self, binding: &Arc<PortBinding>) {
        binding.link_up.store(false, Ordering::Release);
        self.watcher.unwatch(Arc::clone(binding.tap()));
        let closed = binding.tap().close_all();
        info!(
            npu = binding.port.npu,
            port = binding.port.port,
            name = %binding.tap().name(),
            closed,
            "Link down"
        );
    }

    /// Writes a frame to the port's TAP queue. A port whose link is down
    /// silently accepts the frame.
    pub fn write(&self, npu: NpuId, port: PortId, queue: usize, frame: &[u8]) -> Result<()> {
        let key = NpuPort::new(npu, port);
        let binding = self.binding(key).ok_or(PortError::NoSuchPort(key))?;
        if binding.link_state() != LinkState::Up {
            debug!(npu, port, "Link down, dropping frame for TAP");
            return Ok(());
        }

        match binding.tap().write(queue, frame) {
            Ok(Some(n)) if n == frame.len() => Ok(()),
            Ok(Some(n)) => Err(PortError::ShortWrite {
                port: key,
                written: n,
                len: frame.len(),
            }),
            // Queue closed by a concurrent link down.
            Ok(None) => Ok(()),
            Err(e) => Err(PortError::Write {
                port: key,
                source: e,
            }),
        }
    }

    /// The live binding of a port.
    pub fn binding(&self, port: NpuPort) -> Option<Arc<PortBinding>> {
        self.read().live(port).cloned()
    }

    pub fn is_used(&self, npu: NpuId, port: PortId) -> bool {
        self.read().live(NpuPort::new(npu, port)).is_some()
    }

    pub fn port_by_name(&self, name: &str) -> Option<NpuPort> {
        self.read().by_name.get(name).copied()
    }

    /// All live ports, sorted by (npu, port).
    pub fn dump(&self) -> Vec<PortInfo> {
        let maps = self.read();
        let mut ports: Vec<_> = maps
            .by_port
            .values()
            .filter(|b| !b.is_dummy())
            .map(|b| PortInfo {
                npu: b.port.npu,
                port: b.port.port,
                name: b.tap.name().to_string(),
                ifindex: b.ifindex,
                link: b.link_state(),
                fds: b.tap.fds().raw_fds(),
            })
            .collect();
        ports.sort_by_key(|p| (p.npu, p.port));
        ports
    }

    /// Unbinds every port and closes its queues. The persistent TAP devices
    /// stay in the kernel for the next start to re-attach.
    pub fn shutdown(&self) {
        let ports: Vec<_> = self
            .read()
            .by_port
            .values()
            .filter(|b| !b.is_dummy())
            .map(|b| b.port)
            .collect();
        let mut unbound = 0;
        for port in ports {
            // A concurrent delete_port may have taken it already.
            if self.unbind(port).is_ok() {
                unbound += 1;
            }
        }
        info!(ports = unbound, "Port registry shut down");
    }
}

impl PortResolver for PortRegistry {
    fn ifindex_of(&self, npu: NpuId, port: PortId) -> Option<u32> {
        self.binding(NpuPort::new(npu, port)).map(|b| b.ifindex)
    }

    fn port_of(&self, ifindex: u32) -> Option<NpuPort> {
        self.read().by_ifindex.get(&ifindex).copied()
    }
}
