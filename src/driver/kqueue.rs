use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::trace;

use crate::error::LeafError;
use crate::event::{Event, EventFlags};
use crate::interest::Interest;
use crate::sys::{self, kqueue::kevent_new};

use super::{Capabilities, Driver, WakeHandle};

/// Ident of the EVFILT_USER wakeup event.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
const WAKE_IDENT: usize = 0;

/// Registration key reserved for the self-pipe wakeup channel on platforms
/// without EVFILT_USER.
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
const WAKE_KEY: u64 = u64::MAX;

const MAX_EVENTS: usize = 1024;

struct Reg {
    fd: RawFd,
    /// Filters added to the kqueue (disabled until armed).
    added: Interest,
}

pub struct KqueueDriver {
    kq: Arc<sys::Kqueue>,
    regs: IndexMap<u64, Reg>,
    raw: Vec<libc::kevent>,
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    wake_read: sys::FileDesc,
    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    wake_write: Arc<sys::FileDesc>,
}

impl KqueueDriver {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    pub fn new() -> io::Result<KqueueDriver> {
        let kq = sys::Kqueue::new()?;
        kq.add_user(WAKE_IDENT)?;

        Ok(KqueueDriver {
            kq: Arc::new(kq),
            regs: IndexMap::new(),
            raw: Vec::with_capacity(MAX_EVENTS),
        })
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    pub fn new() -> io::Result<KqueueDriver> {
        let kq = sys::Kqueue::new()?;
        let (wake_read, wake_write) = sys::pipe::pair()?;
        let change = kevent_new(
            wake_read.raw() as usize,
            libc::EVFILT_READ,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
            WAKE_KEY,
        );
        kq.apply(&[change])?;

        Ok(KqueueDriver {
            kq: Arc::new(kq),
            regs: IndexMap::new(),
            raw: Vec::with_capacity(MAX_EVENTS),
            wake_read,
            wake_write: Arc::new(wake_write),
        })
    }

    fn add_filters(&self, fd: RawFd, id: u64, interest: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent_new(
                fd as usize,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_DISABLE,
                0,
                id,
            ));
        }
        if interest.is_writable() {
            changes.push(kevent_new(
                fd as usize,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_DISABLE,
                0,
                id,
            ));
        }
        self.kq.apply(&changes)
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    fn drain_wake_pipe(&self) {
        use std::io::Read;

        let mut buf = [0u8; 64];
        while matches!((&self.wake_read).read(&mut buf), Ok(n) if n > 0) {}
    }
}

fn map_change(err: io::Error) -> LeafError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => LeafError::NotRegistered,
        Some(libc::EBADF) => LeafError::InvalidDescriptor,
        Some(code) => LeafError::Platform(code),
        None => LeafError::Platform(0),
    }
}

impl Driver for KqueueDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_events: MAX_EVENTS,
            edge_triggered: true,
            completion_based: false,
        }
    }

    fn register(&mut self, id: u64, fd: RawFd, interest: Interest) -> Result<(), LeafError> {
        if fd < 0 {
            return Err(LeafError::InvalidDescriptor);
        }
        if interest.is_priority() {
            return Err(LeafError::InvalidInterest);
        }

        let filters = interest & (Interest::readable() | Interest::writable());
        self.add_filters(fd, id, filters).map_err(map_change)?;
        self.regs.insert(id, Reg { fd, added: filters });

        Ok(())
    }

    fn modify(&mut self, id: u64, interest: Interest) -> Result<(), LeafError> {
        if interest.is_priority() {
            return Err(LeafError::InvalidInterest);
        }
        let (fd, added) = match self.regs.get(&id) {
            Some(reg) => (reg.fd, reg.added),
            None => return Err(LeafError::NotRegistered),
        };

        let missing = interest - added;
        if !missing.is_empty() {
            self.add_filters(fd, id, missing).map_err(map_change)?;
            if let Some(reg) = self.regs.get_mut(&id) {
                reg.added.insert(missing);
            }
        }

        Ok(())
    }

    fn deregister(&mut self, id: u64) -> Result<(), LeafError> {
        let reg = match self.regs.swap_remove(&id) {
            Some(reg) => reg,
            None => return Ok(()),
        };

        for (kind, filter) in [
            (Interest::readable(), libc::EVFILT_READ),
            (Interest::writable(), libc::EVFILT_WRITE),
        ] {
            if !reg.added.contains(kind) {
                continue;
            }
            let change = kevent_new(reg.fd as usize, filter, libc::EV_DELETE, 0, id);
            match self.kq.apply(&[change]) {
                Ok(()) => {}
                Err(ref e)
                    if e.raw_os_error() == Some(libc::ENOENT)
                        || e.raw_os_error() == Some(libc::EBADF) => {}
                Err(e) => return Err(map_change(e)),
            }
        }

        Ok(())
    }

    fn arm(&mut self, id: u64, interest: Interest) -> Result<(), LeafError> {
        if !interest.is_readable() && !interest.is_writable() {
            return Err(LeafError::InvalidInterest);
        }
        let (fd, added) = match self.regs.get(&id) {
            Some(reg) => (reg.fd, reg.added),
            None => return Err(LeafError::NotRegistered),
        };

        if !added.contains(interest) {
            self.add_filters(fd, id, interest).map_err(map_change)?;
            if let Some(reg) = self.regs.get_mut(&id) {
                reg.added.insert(interest);
            }
        }

        let filter = if interest.is_readable() {
            libc::EVFILT_READ
        } else {
            libc::EVFILT_WRITE
        };
        // EV_DISPATCH disables the filter again after one delivery.
        let change = kevent_new(
            fd as usize,
            filter,
            libc::EV_ENABLE | libc::EV_DISPATCH | libc::EV_CLEAR,
            0,
            id,
        );
        self.kq.apply(&[change]).map_err(map_change)
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> Result<usize, LeafError> {
        match self.kq.wait(&mut self.raw, timeout) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(0),
            Err(e) => return Err(LeafError::from_os(e)),
        }

        let mut delivered = 0;
        for raw in &self.raw {
            // EV_CLEAR resets the user event automatically.
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            if raw.filter == libc::EVFILT_USER {
                continue;
            }

            let id = raw.udata as u64;

            #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
            if id == WAKE_KEY {
                self.drain_wake_pipe();
                continue;
            }

            if !self.regs.contains_key(&id) {
                trace!("dropping event for unknown id {}", id);
                continue;
            }

            let ready = match raw.filter {
                libc::EVFILT_READ => Interest::readable(),
                libc::EVFILT_WRITE => Interest::writable(),
                _ => continue,
            };

            let mut flags = EventFlags::empty();
            if raw.flags & libc::EV_ERROR != 0 {
                flags |= EventFlags::error();
            }
            if raw.flags & libc::EV_EOF != 0 {
                flags |= if ready.is_readable() {
                    EventFlags::eof()
                } else {
                    EventFlags::hangup()
                };
            }

            out.push(Event::new(id, ready, flags));
            delivered += 1;
        }

        Ok(delivered)
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    fn wake_handle(&self) -> Result<Box<dyn WakeHandle>, LeafError> {
        Ok(Box::new(KqueueWake {
            kq: self.kq.clone(),
        }))
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    fn wake_handle(&self) -> Result<Box<dyn WakeHandle>, LeafError> {
        Ok(Box::new(PipeWake {
            write: self.wake_write.clone(),
        }))
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
struct KqueueWake {
    kq: Arc<sys::Kqueue>,
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl WakeHandle for KqueueWake {
    fn wake(&self) -> Result<(), LeafError> {
        self.kq.trigger_user(WAKE_IDENT).map_err(LeafError::from_os)
    }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
struct PipeWake {
    write: Arc<sys::FileDesc>,
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
impl WakeHandle for PipeWake {
    fn wake(&self) -> Result<(), LeafError> {
        use std::io::Write;

        // A full pipe already guarantees a pending wakeup.
        match (&*self.write).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(LeafError::from_os(e)),
        }
    }
}
