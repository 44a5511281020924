use std::io;

use super::fd::FileDesc;

/// Non-blocking close-on-exec pipe pair, used as a wakeup channel on
/// platforms without EVFILT_USER.
pub fn pair() -> io::Result<(FileDesc, FileDesc)> {
    let mut fds = [0 as libc::c_int; 2];
    syscall!(pipe(fds.as_mut_ptr()))?;

    let read = FileDesc::new(fds[0]);
    let write = FileDesc::new(fds[1]);

    for fd in [fds[0], fds[1]] {
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }

    Ok((read, write))
}
