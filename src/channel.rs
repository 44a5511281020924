//! User-facing socket wrapper performing EAGAIN-retry I/O against a
//! selector.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use log::warn;

use crate::error::{ChannelError, LeafError, SelectorError};
use crate::interest::Interest;
use crate::selector::{Armed, BeginOutcome, Registering, Selector, Token};
use crate::sys::socket;

const READ_CLOSED: u8 = 0b001;
const WRITE_CLOSED: u8 = 0b010;
const CLOSED: u8 = 0b100;

/// The registration capability in whichever phase it currently holds.
enum Slot {
    Registering(Token<Registering>),
    Armed(Token<Armed>),
    Vacant,
}

/// Move-only wrapper around a non-blocking descriptor.
///
/// `read`/`write` perform the syscall directly and fall back to arming the
/// selector on `EAGAIN`. Arm failures restore the stored capability, so a
/// failed wait leaves the channel usable.
pub struct Channel {
    fd: RawFd,
    selector: Selector,
    slot: Slot,
    halves: u8,
}

impl Channel {
    /// Switches `fd` to non-blocking mode and registers it. The channel
    /// owns the descriptor from here on.
    pub async fn wrap(
        fd: RawFd,
        selector: &Selector,
        interest: Interest,
    ) -> Result<Channel, ChannelError> {
        socket::set_nonblocking(fd)?;
        let (_, token) = selector.register(fd, interest).await?;

        Ok(Channel {
            fd,
            selector: selector.clone(),
            slot: Slot::Registering(token),
            halves: 0,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Suspends until the descriptor reports `interest`, preserving the
    /// stored capability across failures.
    ///
    /// Uses the two-phase arm so the capability is back in the slot before
    /// any suspension; abandoning the returned future mid-wait leaves the
    /// channel intact.
    async fn wait_ready(&mut self, interest: Interest) -> Result<(), ChannelError> {
        loop {
            if self.arm_once(interest).await? {
                return Ok(());
            }
            // Readiness slipped in between the two phases and became a
            // permit; re-begin to consume it.
        }
    }

    /// One begin/await round; `Ok(false)` means the handle went stale.
    async fn arm_once(&mut self, interest: Interest) -> Result<bool, ChannelError> {
        let handle = match mem::replace(&mut self.slot, Slot::Vacant) {
            Slot::Registering(token) => match self.selector.begin(token, interest) {
                BeginOutcome::Ready { token, .. } => {
                    self.slot = Slot::Armed(token);
                    return Ok(true);
                }
                BeginOutcome::Pending { token, handle } => {
                    self.slot = Slot::Armed(token);
                    handle
                }
                BeginOutcome::Rejected { token, error } => {
                    self.slot = Slot::Registering(token);
                    return Err(error.into());
                }
            },
            Slot::Armed(token) => match self.selector.begin(token, interest) {
                BeginOutcome::Ready { token, .. } => {
                    self.slot = Slot::Armed(token);
                    return Ok(true);
                }
                BeginOutcome::Pending { token, handle } => {
                    self.slot = Slot::Armed(token);
                    handle
                }
                BeginOutcome::Rejected { token, error } => {
                    self.slot = Slot::Armed(token);
                    return Err(error.into());
                }
            },
            Slot::Vacant => {
                return Err(ChannelError::Selector(SelectorError::Os(
                    LeafError::NotRegistered,
                )))
            }
        };

        match self.selector.await_arm(handle, None).await {
            Ok(_) => Ok(true),
            Err(SelectorError::Cancelled) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Reads into `buf`, suspending on `EAGAIN`.
    ///
    /// A zero-length buffer returns 0 with no state change; a read of zero
    /// bytes on a non-empty buffer is EOF and closes the read half.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() || self.halves & READ_CLOSED != 0 {
            return Ok(0);
        }

        loop {
            match socket::read(self.fd, buf) {
                Ok(0) => {
                    self.halves |= READ_CLOSED;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Interest::readable()).await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Writes from `buf`, suspending on `EAGAIN`.
    ///
    /// A zero-byte write against a non-empty buffer is treated as
    /// would-block rather than spinning on exotic descriptors.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.halves & WRITE_CLOSED != 0 {
            return Err(ChannelError::WriteClosed);
        }

        loop {
            match socket::write(self.fd, buf) {
                Ok(0) => {
                    self.wait_ready(Interest::writable()).await?;
                }
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_ready(Interest::writable()).await?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.raw_os_error() == Some(libc::EPIPE) => {
                    self.halves |= WRITE_CLOSED;
                    return Err(ChannelError::WriteClosed);
                }
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Half-closes the read side. Idempotent; "not connected" and
    /// "invalid" are swallowed.
    pub fn shutdown_read(&mut self) -> Result<(), ChannelError> {
        if self.halves & READ_CLOSED != 0 {
            return Ok(());
        }
        shutdown_half(self.fd, libc::SHUT_RD)?;
        self.halves |= READ_CLOSED;
        Ok(())
    }

    /// Half-closes the write side. Idempotent.
    pub fn shutdown_write(&mut self) -> Result<(), ChannelError> {
        if self.halves & WRITE_CLOSED != 0 {
            return Ok(());
        }
        shutdown_half(self.fd, libc::SHUT_WR)?;
        self.halves |= WRITE_CLOSED;
        Ok(())
    }

    /// Reads and clears the pending socket error (`SO_ERROR`).
    ///
    /// Connect completion arms for writability without folding error flags
    /// into a failure; check this unconditionally afterwards.
    pub fn take_error(&self) -> Result<Option<io::Error>, ChannelError> {
        Ok(socket::take_error(self.fd)?)
    }

    /// Deregisters and closes the descriptor. A close that races an
    /// already-closed descriptor (`EBADF`) still succeeds.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        self.halves |= CLOSED;

        match mem::replace(&mut self.slot, Slot::Vacant) {
            Slot::Registering(token) => {
                let _ = self.selector.deregister(token).await;
            }
            Slot::Armed(token) => {
                let _ = self.selector.deregister(token).await;
            }
            Slot::Vacant => {}
        }

        match socket::close(self.fd) {
            Ok(()) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::EBADF) => Ok(()),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    fn token_id(&self) -> Option<u64> {
        match &self.slot {
            Slot::Registering(token) => Some(token.id()),
            Slot::Armed(token) => Some(token.id()),
            Slot::Vacant => None,
        }
    }
}

fn shutdown_half(fd: RawFd, how: libc::c_int) -> Result<(), ChannelError> {
    match socket::shutdown(fd, how) {
        Ok(()) => Ok(()),
        Err(ref e)
            if e.raw_os_error() == Some(libc::ENOTCONN)
                || e.raw_os_error() == Some(libc::EINVAL) =>
        {
            Ok(())
        }
        Err(e) => Err(ChannelError::Io(e)),
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.halves & CLOSED != 0 {
            return;
        }

        if let Some(id) = self.token_id() {
            self.selector.drop_registration(id);
        }
        if let Err(err) = socket::close(self.fd) {
            warn!("failed to close channel fd {}: {}", self.fd, err);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("read_closed", &(self.halves & READ_CLOSED != 0))
            .field("write_closed", &(self.halves & WRITE_CLOSED != 0))
            .finish()
    }
}
