//! Test utilities: stand-in collaborators and packet builders.
//!
//! TAP queues are simulated with `SOCK_SEQPACKET` socket pairs. The daemon
//! gets one end as the queue fd, the test keeps the other to read what was
//! written and to inject frames. Seqpacket keeps frame boundaries and
//! reports a closed peer with `POLLHUP`.

pub mod packets;

use crate::npu::{NpuDriver, NpuError, NpuId, NpuPort, PortId, TxAttrs};
use crate::port::{PortResolver, TapWatcher};
use crate::tap::{self, TapDescriptor, TapDriver, TapError};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, Socket, Type};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const FIRST_IFINDEX: u32 = 100;

// ============================================================================
// Port resolution
// ============================================================================

/// Fixed ifindex <-> port table.
#[derive(Debug, Default)]
pub struct StaticPorts {
    ports: Vec<(u32, NpuPort)>,
}

impl StaticPorts {
    pub fn new(ports: &[(u32, NpuPort)]) -> Self {
        Self {
            ports: ports.to_vec(),
        }
    }
}

impl PortResolver for StaticPorts {
    fn ifindex_of(&self, npu: NpuId, port: PortId) -> Option<u32> {
        let key = NpuPort::new(npu, port);
        self.ports.iter().find(|(_, p)| *p == key).map(|(i, _)| *i)
    }

    fn port_of(&self, ifindex: u32) -> Option<NpuPort> {
        self.ports.iter().find(|(i, _)| *i == ifindex).map(|(_, p)| *p)
    }
}

// ============================================================================
// TAP driver
// ============================================================================

fn peer_closed(peer: &Socket) -> bool {
    let mut fds = [PollFd::new(peer.as_fd(), PollFlags::POLLIN)];
    matches!(poll(&mut fds, PollTimeout::ZERO), Ok(n) if n > 0)
        && fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLHUP))
}

fn injected(name: &str) -> TapError {
    TapError::Attach(name.to_string(), io::Error::other("injected failure"))
}

#[derive(Default)]
struct DriverState {
    peers: HashMap<String, Vec<Socket>>,
    persistent: BTreeSet<String>,
    ifindex: HashMap<String, u32>,
    opened: usize,
    fail_after: Option<usize>,
    fail_next: usize,
}

/// [`TapDriver`] handing out socket pairs instead of kernel TAP queues.
#[derive(Default)]
pub struct PairTapDriver {
    state: Mutex<DriverState>,
}

impl PairTapDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DriverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues opened successfully so far.
    pub fn opened(&self) -> usize {
        self.state().opened
    }

    /// Lets `n` more opens succeed, then fails every open.
    pub fn fail_after(&self, n: usize) {
        self.state().fail_after = Some(n);
    }

    /// Fails the next `n` opens, then succeeds again.
    pub fn fail_next(&self, n: usize) {
        self.state().fail_next = n;
    }

    /// Queues whose daemon-side fd has been closed.
    pub fn peers_closed(&self) -> usize {
        self.state()
            .peers
            .values()
            .flatten()
            .filter(|p| peer_closed(p))
            .count()
    }

    /// Devices currently marked persistent, sorted by name.
    pub fn persistent(&self) -> Vec<String> {
        self.state().persistent.iter().cloned().collect()
    }

    /// Drains every frame the daemon wrote to any queue of `name`.
    pub fn take_written(&self, name: &str) -> Vec<Vec<u8>> {
        let state = self.state();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 65536];
        for peer in state.peers.get(name).into_iter().flatten() {
            loop {
                match (&*peer).read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => frames.push(buf[..n].to_vec()),
                    Err(_) => break,
                }
            }
        }
        frames
    }

    /// Sends a frame into the first open queue of `name`, as the kernel
    /// would when transmitting on the device.
    pub fn inject(&self, name: &str, frame: &[u8]) {
        let state = self.state();
        let peer = state
            .peers
            .get(name)
            .into_iter()
            .flatten()
            .find(|p| !peer_closed(p))
            .unwrap_or_else(|| panic!("no open queue on {name}"));
        peer.send(frame).unwrap();
    }
}

impl TapDriver for PairTapDriver {
    fn operate(&self, name: &str, create: bool) -> tap::Result<()> {
        tap::check_name(name)?;
        let mut state = self.state();
        if create {
            state.persistent.insert(name.to_string());
        } else {
            state.persistent.remove(name);
        }
        Ok(())
    }

    fn open_queue(&self, name: &str) -> tap::Result<OwnedFd> {
        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(injected(name));
        }
        match state.fail_after {
            Some(0) => return Err(injected(name)),
            Some(n) => state.fail_after = Some(n - 1),
            None => {}
        }

        let (ours, peer) = Socket::pair(Domain::UNIX, Type::SEQPACKET, None)
            .map_err(|e| TapError::Attach(name.to_string(), e))?;
        let ours = OwnedFd::from(ours);
        tap::set_nonblocking(ours.as_fd())
            .map_err(|e| TapError::NonBlocking(name.to_string(), e))?;
        peer.set_nonblocking(true)
            .map_err(|e| TapError::NonBlocking(name.to_string(), e))?;

        state.peers.entry(name.to_string()).or_default().push(peer);
        state.opened += 1;
        Ok(ours)
    }

    fn if_index(&self, name: &str) -> tap::Result<u32> {
        let mut state = self.state();
        let next = FIRST_IFINDEX + state.ifindex.len() as u32;
        Ok(*state.ifindex.entry(name.to_string()).or_insert(next))
    }
}

// ============================================================================
// Watchers and NPU
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Watch(NpuPort, String),
    Unwatch(String),
}

/// [`TapWatcher`] that only records calls.
#[derive(Debug, Default)]
pub struct RecordingWatcher {
    events: Mutex<Vec<WatchEvent>>,
}

impl RecordingWatcher {
    pub fn events(&self) -> Vec<WatchEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TapWatcher for RecordingWatcher {
    fn watch(&self, port: NpuPort, tap: Arc<TapDescriptor>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WatchEvent::Watch(port, tap.name().to_string()));
    }

    fn unwatch(&self, tap: Arc<TapDescriptor>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(WatchEvent::Unwatch(tap.name().to_string()));
    }
}

/// [`NpuDriver`] recording every transmit.
#[derive(Debug, Default)]
pub struct MockNpu {
    sent: Mutex<Vec<(Vec<u8>, TxAttrs)>>,
    fail: AtomicBool,
}

impl MockNpu {
    pub fn sent(&self) -> Vec<(Vec<u8>, TxAttrs)> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Makes every following transmit fail (or succeed again).
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Polls until at least `count` frames were sent or `timeout` passes.
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> Vec<(Vec<u8>, TxAttrs)> {
        let deadline = Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= count || Instant::now() >= deadline {
                return sent;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl NpuDriver for MockNpu {
    fn transmit(&self, frame: &[u8], attrs: &TxAttrs) -> Result<(), NpuError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(NpuError::Rejected {
                npu: attrs.npu_id,
                port: attrs.tx_port,
                reason: "injected failure".into(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((frame.to_vec(), *attrs));
        Ok(())
    }
}
