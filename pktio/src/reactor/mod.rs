//! Kernel-side packet reactor.
//!
//! One dedicated thread waits on every TAP queue fd and on the NFLOG socket.
//! Readable TAP queues are drained in bounded batches and each frame is sent
//! out of the owning NPU port. NFLOG copies of flooded ARP/NS requests are
//! rebuilt and injected into the hardware ingress pipeline.
//!
//! Other threads talk to the reactor through a [`ReactorHandle`]: commands go
//! over a channel and an eventfd wakes the loop up. Commands are applied in
//! the order they were sent, so an unwatch issued before a link's fds are
//! closed is always seen before a later watch of the reopened fds.

pub mod flood;
pub mod iface;
pub mod nflog;

use crate::npu::NpuPort;
use crate::packet_io::PacketIo;
use crate::port::TapWatcher;
use crate::tap::TapDescriptor;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use flood::FloodReconstructor;
use nflog::NflogSocket;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Frames drained from one TAP queue per wakeup.
pub const DEFAULT_READ_BATCH: usize = 10;

/// Largest frame read from a TAP queue.
pub const MAX_PACKET_LEN: usize = 12000;

const WAKEUP_TOKEN: u64 = u64::MAX;
const NFLOG_TOKEN: u64 = u64::MAX - 1;

const MAX_EVENTS: usize = 64;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create epoll instance: {0}")]
    Epoll(#[source] Errno),

    #[error("failed to create eventfd: {0}")]
    EventFd(#[source] Errno),

    #[error("failed to register {what} with epoll: {source}")]
    Register {
        what: &'static str,
        #[source]
        source: Errno,
    },

    #[error("epoll wait failed: {0}")]
    Wait(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, ReactorError>;

#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub read_batch: usize,
    pub max_packet_len: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            read_batch: DEFAULT_READ_BATCH,
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

/// Commands that can be sent to the reactor
pub enum ReactorCommand {
    /// Start polling every open queue of a TAP device.
    Watch {
        port: NpuPort,
        tap: Arc<TapDescriptor>,
    },
    /// Stop polling a TAP device.
    Unwatch { tap: Arc<TapDescriptor> },
    Shutdown,
}

/// Handle for controlling the reactor from other threads.
#[derive(Clone)]
pub struct ReactorHandle {
    command_tx: Sender<ReactorCommand>,
    wakeup: Arc<EventFd>,
}

impl ReactorHandle {
    /// Asks the reactor to deregister everything and return.
    pub fn shutdown(&self) {
        self.send_command(ReactorCommand::Shutdown);
    }

    fn send_command(&self, cmd: ReactorCommand) {
        if self.command_tx.send(cmd).is_err() {
            debug!("Reactor has exited, dropping command");
            return;
        }
        if let Err(e) = self.wakeup.write(1) {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

impl TapWatcher for ReactorHandle {
    fn watch(&self, port: NpuPort, tap: Arc<TapDescriptor>) {
        self.send_command(ReactorCommand::Watch { port, tap });
    }

    fn unwatch(&self, tap: Arc<TapDescriptor>) {
        self.send_command(ReactorCommand::Unwatch { tap });
    }
}

/// NFLOG input together with the state needed to rebuild flooded frames.
pub struct FloodSource {
    pub socket: NflogSocket,
    pub reconstructor: FloodReconstructor,
}

struct TapRegistration {
    port: NpuPort,
    tap: Arc<TapDescriptor>,
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Reactor {
    epoll: Epoll,
    wakeup: Arc<EventFd>,
    command_rx: Receiver<ReactorCommand>,
    taps: HashMap<RawFd, TapRegistration>,
    config: ReactorConfig,
    buf: Vec<u8>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<(Self, ReactorHandle)> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(ReactorError::Epoll)?;
        let wakeup = Arc::new(
            EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                .map_err(ReactorError::EventFd)?,
        );
        epoll
            .add(&*wakeup, EpollEvent::new(EpollFlags::EPOLLIN, WAKEUP_TOKEN))
            .map_err(|source| ReactorError::Register {
                what: "eventfd",
                source,
            })?;

        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let reactor = Reactor {
            epoll,
            wakeup: Arc::clone(&wakeup),
            command_rx,
            taps: HashMap::new(),
            config: ReactorConfig {
                read_batch: config.read_batch.max(1),
                max_packet_len: config.max_packet_len,
            },
            buf: vec![0u8; config.max_packet_len],
        };
        let handle = ReactorHandle { command_tx, wakeup };
        Ok((reactor, handle))
    }

    /// Runs until a shutdown command arrives or every handle is dropped.
    pub fn run(mut self, io: &PacketIo, mut flood: Option<FloodSource>) -> Result<()> {
        if let Some(source) = &flood {
            self.epoll
                .add(&source.socket, EpollEvent::new(EpollFlags::EPOLLIN, NFLOG_TOKEN))
                .map_err(|source| ReactorError::Register {
                    what: "NFLOG socket",
                    source,
                })?;
        }
        info!(
            read_batch = self.config.read_batch,
            nflog = flood.is_some(),
            "Reactor started"
        );

        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    self.teardown(flood.as_ref());
                    return Err(ReactorError::Wait(e));
                }
            };

            for event in &events[..n] {
                match event.data() {
                    WAKEUP_TOKEN => {
                        if let Flow::Shutdown = self.drain_commands() {
                            self.teardown(flood.as_ref());
                            return Ok(());
                        }
                    }
                    NFLOG_TOKEN => {
                        if let Some(source) = flood.as_mut() {
                            on_nflog_readable(io, source);
                        }
                    }
                    token => self.on_tap_readable(io, token as RawFd),
                }
            }
        }
    }

    fn drain_commands(&mut self) -> Flow {
        // Reset the counter; the channel is the source of truth.
        let _ = self.wakeup.read();
        loop {
            match self.command_rx.try_recv() {
                Ok(ReactorCommand::Watch { port, tap }) => self.watch(port, tap),
                Ok(ReactorCommand::Unwatch { tap }) => self.unwatch(&tap),
                Ok(ReactorCommand::Shutdown) => {
                    info!("Shutdown requested");
                    return Flow::Shutdown;
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => {
                    info!("All reactor handles dropped, shutting down");
                    return Flow::Shutdown;
                }
            }
        }
    }

    fn watch(&mut self, port: NpuPort, tap: Arc<TapDescriptor>) {
        let fds = tap.fds().raw_fds();
        for fd in fds {
            if self.taps.contains_key(&fd) {
                debug!(fd, port = %port, name = tap.name(), "fd already registered");
                continue;
            }
            let epoll = &self.epoll;
            let added = tap.with_live_fd(fd, |live| {
                epoll.add(live, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            });
            match added {
                Some(Ok(())) => {
                    debug!(fd, port = %port, name = tap.name(), "TAP queue registered");
                    self.taps.insert(
                        fd,
                        TapRegistration {
                            port,
                            tap: Arc::clone(&tap),
                        },
                    );
                }
                Some(Err(e)) => {
                    error!(fd, port = %port, error = %e, "Failed to register TAP queue")
                }
                None => debug!(fd, port = %port, "TAP queue closed before registration"),
            }
        }
    }

    fn unwatch(&mut self, tap: &Arc<TapDescriptor>) {
        let epoll = &self.epoll;
        let before = self.taps.len();
        self.taps.retain(|fd, reg| {
            if !Arc::ptr_eq(&reg.tap, tap) {
                return true;
            }
            // A closed fd has already left the epoll set.
            if let Some(Err(e)) = reg.tap.with_live_fd(*fd, |live| epoll.delete(live)) {
                warn!(fd, error = %e, "Failed to deregister TAP queue");
            }
            debug!(fd, port = %reg.port, "TAP queue deregistered");
            false
        });
        if self.taps.len() == before {
            debug!(name = tap.name(), "Unwatch for TAP device with no registered queues");
        }
    }

    fn on_tap_readable(&mut self, io: &PacketIo, fd: RawFd) {
        let Some(reg) = self.taps.get(&fd) else {
            debug!(fd, "Event for unregistered fd");
            return;
        };

        for _ in 0..self.config.read_batch {
            match reg.tap.read_live(fd, &mut self.buf) {
                None => {
                    trace!(fd, "TAP queue closed under us");
                    break;
                }
                Some(Ok(0)) => break,
                Some(Ok(n)) => {
                    // Failures are counted and logged by PacketIo.
                    let _ = io.on_kernel_transmit(reg.port.npu, reg.port.port, &self.buf[..n]);
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(Err(e)) => {
                    warn!(fd, port = %reg.port, error = %e, "TAP read failed");
                    break;
                }
            }
        }
    }

    /// Deregisters every TAP queue, then the NFLOG socket and the eventfd.
    fn teardown(&mut self, flood: Option<&FloodSource>) {
        let epoll = &self.epoll;
        let queues = self.taps.len();
        for (fd, reg) in self.taps.drain() {
            if let Some(Err(e)) = reg.tap.with_live_fd(fd, |live| epoll.delete(live)) {
                debug!(fd, error = %e, "Failed to deregister TAP queue");
            }
        }
        if let Some(source) = flood
            && let Err(e) = self.epoll.delete(&source.socket)
        {
            debug!(error = %e, "Failed to deregister NFLOG socket");
        }
        if let Err(e) = self.epoll.delete(&*self.wakeup) {
            debug!(error = %e, "Failed to deregister eventfd");
        }
        info!(queues, "Reactor stopped");
    }
}

fn on_nflog_readable(io: &PacketIo, source: &mut FloodSource) {
    let packets = match source.socket.recv() {
        Ok(Some(packets)) => packets,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "NFLOG receive failed");
            return;
        }
    };
    let now = Instant::now();
    for packet in &packets {
        if let Some(out) = source.reconstructor.process(packet, now) {
            // Failures are counted and logged by PacketIo.
            let _ = io.on_kernel_transmit_to_ingress(&out.frame, out.mode);
        }
    }
}
