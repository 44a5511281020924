use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void};

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn shutdown(fd: RawFd, how: c_int) -> io::Result<()> {
    syscall!(shutdown(fd, how))?;
    Ok(())
}

pub fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd))?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

/// Reads and clears `SO_ERROR`, the pending asynchronous error on a socket.
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: c_int = 0;
    let mut len = mem::size_of::<c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut c_void,
        &mut len
    ))?;

    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}
