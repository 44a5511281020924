use std::io;

use thiserror::Error;

/// Platform and driver level failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafError {
    #[error("invalid descriptor")]
    InvalidDescriptor,
    #[error("interest must name a supported readiness kind")]
    InvalidInterest,
    #[error("descriptor is not registered")]
    NotRegistered,
    #[error("registration was removed")]
    Deregistered,
    #[error("os error {0}")]
    Platform(i32),
}

impl LeafError {
    pub(crate) fn from_os(err: io::Error) -> LeafError {
        match err.raw_os_error() {
            Some(libc::EBADF) => LeafError::InvalidDescriptor,
            Some(code) => LeafError::Platform(code),
            None => LeafError::Platform(0),
        }
    }
}

/// Failures surfaced by selector operations: an operational leaf wrapped in
/// the lifecycle layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorError {
    #[error(transparent)]
    Os(#[from] LeafError),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("deadline elapsed before readiness")]
    Timeout,
    #[error("selector is shutting down")]
    Shutdown,
}

/// Failures surfaced by the blocking lane.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneError {
    #[error("job queue is full")]
    QueueFull,
    #[error("acceptance queue is full")]
    Overloaded,
    #[error("pool is shutting down")]
    Shutdown,
    #[error("deadline elapsed before acceptance")]
    Timeout,
    #[error("operation was cancelled")]
    Cancelled,
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

/// Failures surfaced by channel I/O.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("write half is closed")]
    WriteClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures constructing a selector.
#[derive(Error, Debug)]
pub enum MakeError {
    #[error("driver setup failed: {0}")]
    Driver(LeafError),
    #[error("failed to spawn selector thread: {0}")]
    Thread(#[from] io::Error),
}
