use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, ptr};

/// Platform types of the `struct kevent` filter and flags fields; NetBSD
/// widens both to 32 bits.
#[cfg(not(target_os = "netbsd"))]
pub type Filter = i16;
#[cfg(target_os = "netbsd")]
pub type Filter = u32;

#[cfg(not(target_os = "netbsd"))]
pub type Flags = u16;
#[cfg(target_os = "netbsd")]
pub type Flags = u32;

pub struct Kqueue {
    kq: RawFd,
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "openbsd"))]
pub fn kevent_new(
    ident: usize,
    filter: Filter,
    flags: Flags,
    fflags: u32,
    udata: u64,
) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags,
        fflags,
        data: 0,
        udata: udata as *mut libc::c_void,
    }
}

#[cfg(target_os = "freebsd")]
pub fn kevent_new(
    ident: usize,
    filter: Filter,
    flags: Flags,
    fflags: u32,
    udata: u64,
) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags,
        fflags,
        data: 0,
        udata: udata as *mut libc::c_void,
        ext: [0; 4],
    }
}

#[cfg(target_os = "netbsd")]
pub fn kevent_new(
    ident: usize,
    filter: Filter,
    flags: Flags,
    fflags: u32,
    udata: u64,
) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags,
        fflags,
        data: 0,
        udata: udata as libc::intptr_t,
    }
}

impl Kqueue {
    pub fn new() -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;

        Ok(Kqueue { kq })
    }

    /// Applies a changelist without collecting events.
    pub fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null()
        ))?;

        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut Vec<libc::kevent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: to.subsec_nanos() as _,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.clear();
        let cnt = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timespec_ptr
        ))?;

        unsafe { events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }
}

/// EVFILT_USER wakeups; NetBSD and OpenBSD lack the filter and use a
/// self-pipe instead.
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
impl Kqueue {
    /// Installs a user event for cross-thread wakeups.
    pub fn add_user(&self, ident: usize) -> io::Result<()> {
        let change = kevent_new(
            ident,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
            ident as u64,
        );
        self.apply(&[change])
    }

    /// Fires the user event, waking the next or current `wait`.
    pub fn trigger_user(&self, ident: usize) -> io::Result<()> {
        let change = kevent_new(
            ident,
            libc::EVFILT_USER,
            0,
            libc::NOTE_TRIGGER,
            ident as u64,
        );
        self.apply(&[change])
    }
}

impl AsRawFd for Kqueue {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}
