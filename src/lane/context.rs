use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use crate::error::LaneError;

/// Type-erased result of a lane operation.
///
/// `make` pairs with exactly one of `take` (move the payload out) or drop
/// (discard without reading); ownership makes any other pairing
/// unrepresentable.
pub struct PayloadBox(Box<dyn Any + Send>);

impl PayloadBox {
    pub fn make<T: Send + 'static>(value: T) -> PayloadBox {
        PayloadBox(Box::new(value))
    }

    /// Destructively moves the payload out, asserting its type. Returns the
    /// box unchanged when the assertion fails.
    pub fn take<T: Send + 'static>(self) -> Result<T, PayloadBox> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(raw) => Err(PayloadBox(raw)),
        }
    }
}

impl fmt::Debug for PayloadBox {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "PayloadBox")
    }
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;
const FAILED: u8 = 3;

struct CellSlot {
    outcome: Option<Result<PayloadBox, LaneError>>,
    waker: Option<Waker>,
}

/// Exactly-once resumer for one submitted operation.
///
/// The atomic state decides the winner; only the winner touches the slot,
/// and the caller observes the outcome through the same slot lock, so the
/// continuation can never fire twice.
pub(crate) struct OpCell {
    state: AtomicU8,
    slot: Mutex<CellSlot>,
}

impl OpCell {
    pub fn new() -> OpCell {
        OpCell {
            state: AtomicU8::new(PENDING),
            slot: Mutex::new(CellSlot {
                outcome: None,
                waker: None,
            }),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub fn was_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Delivers the operation result. On a lost race the payload comes back
    /// so the worker can discard it.
    pub fn complete(&self, value: PayloadBox) -> Result<(), PayloadBox> {
        if self
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }

        self.deliver(Ok(value));
        Ok(())
    }

    /// Fails the context; returns whether this call won the transition.
    pub fn fail(&self, error: LaneError) -> bool {
        let target = if matches!(error, LaneError::Cancelled) {
            CANCELLED
        } else {
            FAILED
        };

        if self
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.deliver(Err(error));
        true
    }

    pub fn cancel(&self) -> bool {
        self.fail(LaneError::Cancelled)
    }

    fn deliver(&self, outcome: Result<PayloadBox, LaneError>) {
        let waker = {
            let mut slot = self.slot.lock().unwrap();
            slot.outcome = Some(outcome);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<PayloadBox, LaneError>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(outcome) = slot.outcome.take() {
            Poll::Ready(outcome)
        } else {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
