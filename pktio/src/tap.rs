//! TAP device management for logical ports.
//!
//! Every logical port is backed by a persistent, multi-queue TAP device.
//! The kernel device outlives link flaps; only the queue file descriptors
//! are opened on link up and closed on link down.

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Longest device name the kernel accepts.
pub const IFNAME_MAX: usize = 15;

/// Most queue file descriptors one device can hold.
pub const MAX_QUEUES: usize = 10;

/// Transmit queue length configured on new devices.
pub const DEFAULT_TXQLEN: u32 = 1000;

#[derive(Debug, Error)]
pub enum TapError {
    #[error("TAP name too long: {0} (max {IFNAME_MAX} chars)")]
    NameTooLong(String),

    #[error("invalid TAP name: {0:?}")]
    InvalidName(String),

    #[error("invalid queue count {0} (1..={MAX_QUEUES})")]
    InvalidQueueCount(usize),

    #[error("unsupported device kind {0:?}, only TAP devices can be allocated")]
    UnsupportedKind(TapKind),

    #[error("failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),

    #[error("failed to attach to TAP device '{0}': {1}")]
    Attach(String, io::Error),

    #[error("failed to set persistence on '{0}': {1}")]
    Persist(String, io::Error),

    #[error("failed to set tx queue length on '{0}': {1}")]
    TxQueueLen(String, io::Error),

    #[error("failed to make queue of '{0}' non-blocking: {1}")]
    NonBlocking(String, io::Error),

    #[error("failed to get interface index for '{0}': {1}")]
    GetIfIndex(String, io::Error),
}

pub type Result<T> = std::result::Result<T, TapError>;

// linux/if_tun.h
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETPERSIST: libc::c_ulong = 0x400454cb;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

#[repr(C)]
struct IfReqQlen {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_qlen: libc::c_int,
    _padding: [u8; 20],
}

fn ifr_name(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ]> {
    check_name(name)?;
    let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, &b) in out.iter_mut().zip(name.as_bytes()) {
        *dst = b as libc::c_char;
    }
    Ok(out)
}

/// Validates a device name against the kernel's rules.
pub fn check_name(name: &str) -> Result<()> {
    if name.len() > IFNAME_MAX {
        return Err(TapError::NameTooLong(name.to_string()));
    }
    if name.is_empty() || name.bytes().any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace()) {
        return Err(TapError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Builds a device name from a prefix and optional location parts:
/// `{prefix}{chassis:x}{instance}-{port}-{subport:x}`.
pub fn device_name(
    prefix: &str,
    chassis: Option<u32>,
    instance: Option<u32>,
    port: Option<u32>,
    subport: Option<u32>,
) -> Result<String> {
    let mut name = prefix.to_string();
    if let Some(chassis) = chassis {
        name.push_str(&format!("{chassis:x}"));
    }
    if let Some(instance) = instance {
        name.push_str(&instance.to_string());
    }
    if let Some(port) = port {
        name.push_str(&format!("-{port}"));
    }
    if let Some(subport) = subport {
        name.push_str(&format!("-{subport:x}"));
    }
    check_name(&name)?;
    Ok(name)
}

/// Declared device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TapKind {
    #[default]
    Undefined,
    Tap,
    Tun,
}

/// Kernel side of TAP devices.
pub trait TapDriver: Send + Sync {
    /// Creates a persistent device, or clears persistence so it goes away
    /// once the last handle closes.
    fn operate(&self, name: &str, create: bool) -> Result<()>;

    /// Opens one non-blocking queue on an existing device.
    fn open_queue(&self, name: &str) -> Result<OwnedFd>;

    /// Kernel interface index of a device.
    fn if_index(&self, name: &str) -> Result<u32>;
}

/// [`TapDriver`] backed by `/dev/net/tun`.
#[derive(Debug, Clone)]
pub struct LinuxTap {
    txqlen: u32,
}

impl Default for LinuxTap {
    fn default() -> Self {
        Self {
            txqlen: DEFAULT_TXQLEN,
        }
    }
}

impl LinuxTap {
    pub fn new(txqlen: u32) -> Self {
        Self { txqlen }
    }

    fn attach(&self, name: &str) -> Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(TapError::OpenTun)?;

        let ifr = IfReqFlags {
            ifr_name: ifr_name(name)?,
            ifr_flags: IFF_TAP | IFF_MULTI_QUEUE | IFF_NO_PI,
            _padding: [0; 22],
        };
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as libc::Ioctl, &ifr) };
        if ret < 0 {
            return Err(TapError::Attach(name.to_string(), io::Error::last_os_error()));
        }
        Ok(OwnedFd::from(file))
    }

    fn set_txqlen(&self, name: &str) -> Result<()> {
        let ifr = IfReqQlen {
            ifr_name: ifr_name(name)?,
            ifr_qlen: self.txqlen as libc::c_int,
            _padding: [0; 20],
        };
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(TapError::TxQueueLen(name.to_string(), io::Error::last_os_error()));
        }
        let ret = unsafe { libc::ioctl(sock, libc::SIOCSIFTXQLEN as libc::Ioctl, &ifr) };
        let err = io::Error::last_os_error();
        unsafe { libc::close(sock) };
        if ret < 0 {
            return Err(TapError::TxQueueLen(name.to_string(), err));
        }
        Ok(())
    }
}

impl TapDriver for LinuxTap {
    fn operate(&self, name: &str, create: bool) -> Result<()> {
        let fd = self.attach(name).inspect_err(|e| {
            error!(name, create, error = %e, "TAP operation failed");
        })?;

        if create
            && let Err(e) = self.set_txqlen(name)
        {
            // The device is still usable with the default queue length.
            warn!(name, txqlen = self.txqlen, error = %e, "Failed to set TAP tx queue length");
        }

        let ret = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                TUNSETPERSIST as libc::Ioctl,
                libc::c_int::from(create),
            )
        };
        if ret < 0 {
            let err = TapError::Persist(name.to_string(), io::Error::last_os_error());
            error!(name, create, error = %err, "TAP operation failed");
            return Err(err);
        }

        info!(name, create, "TAP device operation done");
        Ok(())
    }

    fn open_queue(&self, name: &str) -> Result<OwnedFd> {
        let fd = self.attach(name)?;
        set_nonblocking(fd.as_fd()).map_err(|e| TapError::NonBlocking(name.to_string(), e))?;
        Ok(fd)
    }

    fn if_index(&self, name: &str) -> Result<u32> {
        if_nametoindex(name)
    }
}

/// Kernel interface index of a named interface.
pub fn if_nametoindex(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| TapError::InvalidName(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(TapError::GetIfIndex(
            name.to_string(),
            io::Error::last_os_error(),
        ));
    }
    Ok(index)
}

/// Puts a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

/// Queue descriptors of one device. A slot is either an open fd or empty.
#[derive(Debug)]
pub struct FdSet {
    slots: [Option<OwnedFd>; MAX_QUEUES],
    max_fd: Option<RawFd>,
}

impl Default for FdSet {
    fn default() -> Self {
        Self {
            slots: [const { None }; MAX_QUEUES],
            max_fd: None,
        }
    }
}

impl FdSet {
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.iter().flatten().any(|f| f.as_raw_fd() == fd)
    }

    pub fn queue(&self, queue: usize) -> Option<BorrowedFd<'_>> {
        self.slots.get(queue)?.as_ref().map(|f| f.as_fd())
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.slots.iter().flatten().map(|f| f.as_raw_fd()).collect()
    }

    pub fn max_fd(&self) -> Option<RawFd> {
        self.max_fd
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// A TAP device and its queue descriptors.
///
/// The fd set has its own lock so readers can check that an fd is still
/// live while a concurrent link down closes it.
#[derive(Debug)]
pub struct TapDescriptor {
    name: String,
    queues: usize,
    kind: Mutex<TapKind>,
    fds: Mutex<FdSet>,
}

impl TapDescriptor {
    pub fn new(name: &str, queues: usize) -> Result<Self> {
        check_name(name)?;
        if queues == 0 || queues > MAX_QUEUES {
            return Err(TapError::InvalidQueueCount(queues));
        }
        Ok(Self {
            name: name.to_string(),
            queues,
            kind: Mutex::new(TapKind::Undefined),
            fds: Mutex::new(FdSet::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues opened on link up.
    pub fn queues(&self) -> usize {
        self.queues
    }

    pub fn kind(&self) -> TapKind {
        *self.kind.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fds(&self) -> MutexGuard<'_, FdSet> {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens `queues` descriptors on the device. Either all of them end up
    /// in the fd set or none do.
    pub fn allocate(&self, driver: &dyn TapDriver, kind: TapKind, queues: usize) -> Result<()> {
        if kind != TapKind::Tap {
            return Err(TapError::UnsupportedKind(kind));
        }
        if queues == 0 || queues > MAX_QUEUES {
            return Err(TapError::InvalidQueueCount(queues));
        }
        *self.kind.lock().unwrap_or_else(PoisonError::into_inner) = kind;

        // Dropping `opened` on the error path closes every fd from this call.
        let mut opened = Vec::with_capacity(queues);
        for queue in 0..queues {
            match driver.open_queue(&self.name) {
                Ok(fd) => opened.push(fd),
                Err(e) => {
                    error!(name = %self.name, queue, error = %e, "Failed to open TAP queue");
                    return Err(e);
                }
            }
        }

        let mut guard = self.fds();
        let set = &mut *guard;
        for (slot, fd) in set.slots.iter_mut().zip(opened) {
            let raw = fd.as_raw_fd();
            set.max_fd = Some(set.max_fd.map_or(raw, |m| m.max(raw)));
            // Replacing a stale fd closes it.
            *slot = Some(fd);
        }
        debug!(name = %self.name, queues, max_fd = ?set.max_fd, "TAP queues allocated");
        Ok(())
    }

    /// Closes every open queue. The kernel device stays.
    pub fn close_all(&self) -> usize {
        let mut set = self.fds();
        let closed = set.slots.iter_mut().filter_map(Option::take).count();
        set.max_fd = None;
        if closed > 0 {
            debug!(name = %self.name, closed, "TAP queues closed");
        }
        closed
    }

    /// Runs `f` on `fd` while holding the fd set lock, provided the fd is
    /// still one of this device's open queues.
    pub fn with_live_fd<R>(&self, fd: RawFd, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Option<R> {
        let set = self.fds();
        let owned = set.slots.iter().flatten().find(|o| o.as_raw_fd() == fd)?;
        Some(f(owned.as_fd()))
    }

    /// Writes one frame to a queue. Returns `Ok(None)` when that queue is
    /// not open.
    pub fn write(&self, queue: usize, frame: &[u8]) -> io::Result<Option<usize>> {
        let set = self.fds();
        let Some(fd) = set.queue(queue) else {
            return Ok(None);
        };
        let n = unsafe { libc::write(fd.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Some(n as usize))
    }

    /// Reads one frame from `fd`. Returns `None` when `fd` is no longer one
    /// of this device's open queues.
    pub fn read_live(&self, fd: RawFd, buf: &mut [u8]) -> Option<io::Result<usize>> {
        self.with_live_fd(fd, |fd| {
            let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }
}
