//! Dedicated OS thread owning the driver handle. It alone performs driver
//! syscalls: registration requests are acknowledged over the reply bridge,
//! poll results travel over the event bridge.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::driver::Driver;
use crate::error::{LeafError, SelectorError};
use crate::event::Event;

use super::{Batch, Reply, Request, Shared, NO_REPLY};

pub(crate) fn poll_main(mut driver: Box<dyn Driver>, shared: Arc<Shared>) {
    let max_events = driver.capabilities().max_events.max(1);
    let mut buf: Vec<Event> = Vec::with_capacity(max_events);

    loop {
        if shared.poll_shutdown.load(Ordering::Acquire) {
            shutdown_drain(driver.as_mut(), &shared);
            return;
        }

        let mut replied = false;
        while let Ok(request) = shared.requests.pop() {
            replied |= serve(driver.as_mut(), &shared, request);
        }
        if replied {
            // Nudge the dispatch thread to drain the reply bridge.
            shared.events.push(Batch::Tick);
        }

        let timeout = next_timeout(&shared);
        buf.clear();
        match driver.poll(timeout, &mut buf) {
            Ok(0) => {
                claim_due_deadline(&shared);
                shared.events.push(Batch::Tick);
            }
            Ok(count) => {
                trace!("poll delivered {} events", count);
                shared.events.push(Batch::Events(buf.clone()));
            }
            Err(err) => {
                warn!("driver poll failed: {}", err);
                shared.events.close();
                shared.replies.close();
                return;
            }
        }
    }
}

/// Runs one request against the driver; returns whether a reply was pushed.
fn serve(driver: &mut dyn Driver, shared: &Shared, request: Request) -> bool {
    match request {
        Request::Register {
            reply,
            id,
            fd,
            interest,
        } => push_reply(shared, reply, driver.register(id, fd, interest)),
        Request::Modify {
            reply,
            id,
            interest,
        } => push_reply(shared, reply, driver.modify(id, interest)),
        Request::Deregister { reply, id } => {
            let result = driver.deregister(id);
            if reply == NO_REPLY {
                false
            } else {
                push_reply(shared, reply, result)
            }
        }
        Request::Arm { id, interest } => {
            if let Err(err) = driver.arm(id, interest) {
                // The registration is gone; the waiter is resumed through
                // deregistration or shutdown instead.
                trace!("arm failed for id {}: {}", id, err);
            }
            false
        }
    }
}

fn push_reply(shared: &Shared, key: usize, result: Result<(), LeafError>) -> bool {
    shared.replies.push(Reply {
        key,
        result: result.map_err(SelectorError::Os),
    })
}

fn next_timeout(shared: &Shared) -> Option<Duration> {
    let ns = shared.next_deadline.load(Ordering::Acquire);
    if ns == u64::MAX {
        return None;
    }

    let target = shared.epoch + Duration::from_nanos(ns);
    Some(target.saturating_duration_since(Instant::now()))
}

/// After waking for a due deadline, park the slot so the next poll blocks
/// until the dispatch thread republishes.
fn claim_due_deadline(shared: &Shared) {
    let ns = shared.next_deadline.load(Ordering::Acquire);
    if ns == u64::MAX {
        return;
    }

    let due = Instant::now() >= shared.epoch + Duration::from_nanos(ns);
    if due {
        let _ = shared.next_deadline.compare_exchange(
            ns,
            u64::MAX,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Drain remaining requests with typed rejections, honor deregistrations,
/// release the driver and close both bridges.
fn shutdown_drain(driver: &mut dyn Driver, shared: &Shared) {
    while let Ok(request) = shared.requests.pop() {
        match request {
            Request::Register { reply, .. } | Request::Modify { reply, .. } => {
                shared.replies.push(Reply {
                    key: reply,
                    result: Err(SelectorError::Shutdown),
                });
            }
            Request::Deregister { reply, id } => {
                let result = driver.deregister(id);
                if reply != NO_REPLY {
                    push_reply(shared, reply, result);
                }
            }
            Request::Arm { .. } => {}
        }
    }

    shared.events.close();
    shared.replies.close();
    debug!("poll thread exiting");
}
