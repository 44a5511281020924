use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use libc::c_int;
use log::trace;

use crate::error::LeafError;
use crate::event::{Event, EventFlags};
use crate::interest::Interest;
use crate::sys;

use super::{Capabilities, Driver, WakeHandle};

/// Registration key reserved for the wakeup eventfd.
const WAKE_KEY: u64 = u64::MAX;

const MAX_EVENTS: usize = 1024;

struct Reg {
    fd: RawFd,
    /// Kernel interest bits currently armed; EPOLLONESHOT clears the whole
    /// mask on delivery, so the undelivered remainder is re-armed from here.
    armed: u32,
}

pub struct EpollDriver {
    epoll: sys::Epoll,
    wake: Arc<sys::EventFd>,
    regs: IndexMap<u64, Reg>,
    raw: Vec<libc::epoll_event>,
}

impl EpollDriver {
    pub fn new() -> io::Result<EpollDriver> {
        let epoll = sys::Epoll::new()?;
        let wake = sys::EventFd::new()?;

        // Level-triggered and never one-shot: the wakeup fd must outlive
        // every arming cycle.
        epoll.add(wake.as_raw_fd(), WAKE_KEY, libc::EPOLLIN as u32)?;

        Ok(EpollDriver {
            epoll,
            wake: Arc::new(wake),
            regs: IndexMap::new(),
            raw: Vec::with_capacity(MAX_EVENTS),
        })
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= libc::EPOLLIN;
    }

    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }

    if interest.is_priority() {
        kind |= libc::EPOLLPRI;
    }

    kind as u32
}

fn translate(raw: &libc::epoll_event) -> (Interest, EventFlags) {
    let epoll = raw.events as c_int;
    let mut ready = Interest::empty();
    let mut flags = EventFlags::empty();

    if epoll & libc::EPOLLIN != 0 {
        ready.insert(Interest::readable());
    }

    if epoll & libc::EPOLLOUT != 0 {
        ready.insert(Interest::writable());
    }

    if epoll & libc::EPOLLPRI != 0 {
        ready.insert(Interest::priority());
    }

    if epoll & libc::EPOLLERR != 0 {
        flags |= EventFlags::error();
    }

    if epoll & libc::EPOLLHUP != 0 {
        flags |= EventFlags::hangup();
    }

    if epoll & libc::EPOLLRDHUP != 0 {
        flags |= EventFlags::read_hangup();
    }

    // An error or hangup without readiness must still reach whoever is
    // waiting on the descriptor.
    if ready.is_empty() && !flags.is_empty() {
        ready = Interest::readable() | Interest::writable();
    }

    (ready, flags)
}

fn map_ctl(err: io::Error) -> LeafError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => LeafError::NotRegistered,
        Some(libc::EBADF) | Some(libc::EPERM) => LeafError::InvalidDescriptor,
        Some(code) => LeafError::Platform(code),
        None => LeafError::Platform(0),
    }
}

impl Driver for EpollDriver {
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

        // Registered disarmed: no readiness mask yet, and one-shot so a
        // pre-arm error or hangup (which epoll always reports) is delivered
        // once instead of spinning the poll loop.
        self.epoll
            .add(fd, id, libc::EPOLLONESHOT as u32)
            .map_err(map_ctl)?;
        self.regs.insert(id, Reg { fd, armed: 0 });
        let _ = interest;

        Ok(())
    }

    fn modify(&mut self, id: u64, _interest: Interest) -> Result<(), LeafError> {
        if self.regs.contains_key(&id) {
            Ok(())
        } else {
            Err(LeafError::NotRegistered)
        }
    }

    fn deregister(&mut self, id: u64) -> Result<(), LeafError> {
        let reg = match self.regs.swap_remove(&id) {
            Some(reg) => reg,
            None => return Ok(()),
        };

        match self.epoll.delete(reg.fd) {
            Ok(()) => Ok(()),
            Err(ref e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            Err(e) => Err(map_ctl(e)),
        }
    }

    fn arm(&mut self, id: u64, interest: Interest) -> Result<(), LeafError> {
        let reg = self.regs.get_mut(&id).ok_or(LeafError::NotRegistered)?;

        reg.armed |= interest_to_epoll(interest);
        let events = reg.armed | (libc::EPOLLONESHOT | libc::EPOLLET) as u32;
        self.epoll.modify(reg.fd, id, events).map_err(map_ctl)
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> Result<usize, LeafError> {
        match self.epoll.wait(&mut self.raw, timeout) {
            Ok(_) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(0),
            Err(e) => return Err(LeafError::from_os(e)),
        }

        let mut delivered = 0;
        for i in 0..self.raw.len() {
            let raw = self.raw[i];
            let key = raw.u64;

            if key == WAKE_KEY {
                let _ = self.wake.read();
                continue;
            }

            let (ready, flags) = translate(&raw);
            let reg = match self.regs.get_mut(&key) {
                Some(reg) => reg,
                // Raced with a deregister; the event has no owner.
                None => continue,
            };

            // EPOLLONESHOT disabled the whole mask; keep any not-yet-fired
            // direction armed.
            if flags.is_empty() {
                reg.armed &= !interest_to_epoll(ready);
            } else {
                reg.armed = 0;
            }
            if reg.armed != 0 {
                let events = reg.armed | (libc::EPOLLONESHOT | libc::EPOLLET) as u32;
                if let Err(e) = self.epoll.modify(reg.fd, key, events) {
                    trace!("re-arm after one-shot failed for id {}: {}", key, e);
                }
            }

            out.push(Event::new(key, ready, flags));
            delivered += 1;
        }

        Ok(delivered)
    }

    fn wake_handle(&self) -> Result<Box<dyn WakeHandle>, LeafError> {
        Ok(Box::new(EpollWake {
            wake: self.wake.clone(),
        }))
    }
}

struct EpollWake {
    wake: Arc<sys::EventFd>,
}

impl WakeHandle for EpollWake {
    fn wake(&self) -> Result<(), LeafError> {
        match self.wake.write(1) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(LeafError::from_os(e)),
        }
    }
}
