use std::{fmt, ops};

use crate::interest::Interest;

/// Kernel condition flags attached to a readiness event.
///
/// These are hints: a hangup or error flag does not replace performing the
/// actual operation, which reports the authoritative failure.
#[derive(Copy, PartialEq, Eq, Clone, Hash)]
pub struct EventFlags(u8);

const ERROR: u8 = 0b0001;
const HANGUP: u8 = 0b0010;
const READ_HANGUP: u8 = 0b0100;
const EOF: u8 = 0b1000;

impl EventFlags {
    #[inline]
    pub fn empty() -> EventFlags {
        EventFlags(0)
    }

    #[inline]
    pub fn error() -> EventFlags {
        EventFlags(ERROR)
    }

    #[inline]
    pub fn hangup() -> EventFlags {
        EventFlags(HANGUP)
    }

    #[inline]
    pub fn read_hangup() -> EventFlags {
        EventFlags(READ_HANGUP)
    }

    #[inline]
    pub fn eof() -> EventFlags {
        EventFlags(EOF)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.0 & ERROR != 0
    }

    #[inline]
    pub fn is_hangup(&self) -> bool {
        self.0 & HANGUP != 0
    }

    #[inline]
    pub fn is_read_hangup(&self) -> bool {
        self.0 & READ_HANGUP != 0
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.0 & EOF != 0
    }
}

impl ops::BitOr for EventFlags {
    type Output = EventFlags;

    #[inline]
    fn bitor(self, other: EventFlags) -> EventFlags {
        EventFlags(self.0 | other.0)
    }
}

impl ops::BitOrAssign for EventFlags {
    #[inline]
    fn bitor_assign(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (EventFlags::error(), "Error"),
            (EventFlags::hangup(), "Hangup"),
            (EventFlags::read_hangup(), "ReadHangup"),
            (EventFlags::eof(), "Eof"),
        ];

        write!(fmt, "EventFlags {{")?;

        for (flag, msg) in flags {
            if self.0 & flag.0 != 0 {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

/// A readiness event delivered for a registration.
///
/// Carries the registration id, the readiness that fired and any condition
/// flags the kernel attached.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    id: u64,
    ready: Interest,
    flags: EventFlags,
}

impl Event {
    pub fn new(id: u64, ready: Interest, flags: EventFlags) -> Event {
        Event { id, ready, flags }
    }

    /// The registration id this event belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The readiness that fired.
    pub fn readiness(&self) -> Interest {
        self.ready
    }

    pub fn flags(&self) -> EventFlags {
        self.flags
    }
}
