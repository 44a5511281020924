use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use crate::error::SelectorError;
use crate::event::Event;
use crate::interest::Interest;

/// Index key of a waiter or permit: one registration, one readiness kind.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Key {
    pub id: u64,
    pub interest: Interest,
}

pub(crate) const CANCELLED: u8 = 0b001;
pub(crate) const ARMED: u8 = 0b010;
pub(crate) const DRAINED: u8 = 0b100;

pub(crate) enum Resolution {
    /// This call drained the waiter; fire the waker after unlocking.
    Resumed(Option<Waker>),
    /// Someone already drained it.
    Spent,
}

struct Slot {
    outcome: Option<Result<Event, SelectorError>>,
    waker: Option<Waker>,
}

/// Cell tracking one pending arm.
///
/// Three atomic bits (cancelled, armed, drained) gate the lifecycle; the
/// waker slot is written only before the transition to drained and read
/// only by the one caller that wins it, so a double resume cannot happen.
pub(crate) struct Waiter {
    pub key: Key,
    pub generation: u64,
    state: AtomicU8,
    slot: Mutex<Slot>,
}

impl Waiter {
    /// Two-phase begin: the kernel arm is in flight but no continuation is
    /// installed yet.
    pub fn unarmed(key: Key, generation: u64) -> Waiter {
        Waiter::with_state(key, generation, 0)
    }

    /// Single-phase arm: continuation installation follows immediately.
    pub fn armed(key: Key, generation: u64) -> Waiter {
        Waiter::with_state(key, generation, ARMED)
    }

    fn with_state(key: Key, generation: u64, state: u8) -> Waiter {
        Waiter {
            key,
            generation,
            state: AtomicU8::new(state),
            slot: Mutex::new(Slot {
                outcome: None,
                waker: None,
            }),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Installs the armed bit; returns the previous state so the caller can
    /// detect a double arm or a pre-arm cancellation.
    pub fn arm(&self) -> u8 {
        self.state.fetch_or(ARMED, Ordering::AcqRel)
    }

    /// Flags cancellation without resuming; returns the previous state.
    pub fn cancel(&self) -> u8 {
        self.state.fetch_or(CANCELLED, Ordering::AcqRel)
    }

    /// Drains the waiter exactly once. A set cancelled bit overrides the
    /// outcome with `Cancelled`.
    pub fn resolve(&self, outcome: Result<Event, SelectorError>) -> Resolution {
        let prev = self.state.fetch_or(DRAINED, Ordering::AcqRel);
        if prev & DRAINED != 0 {
            return Resolution::Spent;
        }

        let outcome = if prev & CANCELLED != 0 {
            Err(SelectorError::Cancelled)
        } else {
            outcome
        };

        let mut slot = self.slot.lock().unwrap();
        slot.outcome = Some(outcome);
        Resolution::Resumed(slot.waker.take())
    }

    pub fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<Event, SelectorError>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(outcome) = slot.outcome.take() {
            Poll::Ready(outcome)
        } else {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::EventFlags;

    fn key() -> Key {
        Key {
            id: 1,
            interest: Interest::readable(),
        }
    }

    fn event() -> Event {
        Event::new(1, Interest::readable(), EventFlags::empty())
    }

    #[test]
    fn resolve_exactly_once() {
        let waiter = Waiter::armed(key(), 0);

        assert!(matches!(waiter.resolve(Ok(event())), Resolution::Resumed(_)));
        assert!(matches!(waiter.resolve(Ok(event())), Resolution::Spent));
    }

    #[test]
    fn cancelled_bit_overrides_outcome() {
        let waiter = Waiter::armed(key(), 0);
        waiter.cancel();

        match waiter.resolve(Ok(event())) {
            Resolution::Resumed(_) => {}
            Resolution::Spent => panic!("first resolve must win"),
        }

        let noop = futures::task::noop_waker();
        let mut cx = Context::from_waker(&noop);
        match waiter.poll_outcome(&mut cx) {
            Poll::Ready(Err(SelectorError::Cancelled)) => {}
            other => panic!("expected cancelled, got {:?}", other),
        }
    }

    #[test]
    fn arm_reports_previous_state() {
        let waiter = Waiter::unarmed(key(), 0);
        assert_eq!(waiter.arm() & ARMED, 0);
        assert_ne!(waiter.arm() & ARMED, 0);
    }
}
