use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::LeafError;
use crate::event::Event;
use crate::interest::Interest;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
pub mod fake;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::EpollDriver;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use self::kqueue::KqueueDriver;
pub use self::fake::{FakeDriver, FakeHandle};

/// What a driver implementation is able to do.
#[derive(Copy, Clone, Debug)]
pub struct Capabilities {
    /// Upper bound on events a single `poll` call can deliver.
    pub max_events: usize,
    pub edge_triggered: bool,
    /// True for completion-model backends; every readiness backend here
    /// reports false.
    pub completion_based: bool,
}

/// Thread-safe wake-only primitive that interrupts the next or current
/// `poll` call.
pub trait WakeHandle: Send + Sync {
    fn wake(&self) -> Result<(), LeafError>;
}

/// Witness over a platform readiness facility.
///
/// Every operation is invoked only on the poll thread; the registration key
/// is chosen by the caller and carried back verbatim in events. `arm`
/// installs a one-shot edge-triggered filter that auto-disables after the
/// next event.
pub trait Driver: Send {
    fn capabilities(&self) -> Capabilities;

    fn register(&mut self, id: u64, fd: RawFd, interest: Interest) -> Result<(), LeafError>;

    fn modify(&mut self, id: u64, interest: Interest) -> Result<(), LeafError>;

    /// Idempotent: deregistering an unknown id succeeds.
    fn deregister(&mut self, id: u64) -> Result<(), LeafError>;

    fn arm(&mut self, id: u64, interest: Interest) -> Result<(), LeafError>;

    /// Blocks for up to `timeout` (forever when `None`), translating
    /// platform records into `out`. `EINTR` is not an error: the call
    /// returns zero events and the loop continues.
    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> Result<usize, LeafError>;

    fn wake_handle(&self) -> Result<Box<dyn WakeHandle>, LeafError>;
}

/// Which platform facility backs a selector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverKind {
    Epoll,
    Kqueue,
}

impl DriverKind {
    pub fn for_platform() -> DriverKind {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            DriverKind::Epoll
        } else {
            DriverKind::Kqueue
        }
    }

    pub fn create(self) -> Result<Box<dyn Driver>, LeafError> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            DriverKind::Epoll => Ok(Box::new(EpollDriver::new().map_err(LeafError::from_os)?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            DriverKind::Kqueue => Ok(Box::new(KqueueDriver::new().map_err(LeafError::from_os)?)),
            #[allow(unreachable_patterns)]
            _ => Err(LeafError::Platform(libc::ENOSYS)),
        }
    }
}
