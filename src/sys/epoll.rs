use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, ptr};

use libc::c_int;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    /// Waits for events, appending raw records to `events` (cleared first).
    /// The timeout is rounded up to the next millisecond so short deadlines
    /// do not degrade into busy polling.
    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| {
                let mut ms = to.as_millis();
                if to.subsec_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                cmp::min(ms, c_int::MAX as u128) as c_int
            })
            .unwrap_or(-1);

        events.clear();
        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, key: u64, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event { events, u64: key };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, key: u64, events: u32) -> io::Result<()> {
        let mut info = libc::epoll_event { events, u64: key };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epfd,
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))?;

        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
