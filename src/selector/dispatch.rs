//! The single resumption funnel: consumes event batches, replies, notes
//! and expired deadlines, and is the only place a waiter is ever resumed.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Waker;
use std::time::Instant;

use log::{debug, trace};

use crate::error::{LeafError, SelectorError};
use crate::event::Event;

use super::waiter::{Key, Resolution, ARMED};
use super::{Batch, Note, Record, Reply, Request, Shared, State, NO_REPLY};

pub(crate) fn dispatch_main(shared: Arc<Shared>) {
    while let Some(batch) = shared.events.next() {
        let mut wakers: Vec<Waker> = Vec::new();
        {
            let mut state = shared.state.lock().unwrap();

            while let Some(reply) = shared.replies.try_next() {
                handle_reply(&shared, &mut state, reply, &mut wakers);
            }

            // Events first, then cancellations, then expired deadlines:
            // an event and a deadline landing in the same turn resolve in
            // the event's favor.
            if let Batch::Events(events) = &batch {
                for event in events {
                    handle_event(&mut state, event, &mut wakers);
                }
            }

            while let Ok(note) = shared.notes.pop() {
                handle_note(&mut state, note, &mut wakers);
            }

            handle_deadlines(&mut state, &mut wakers);

            republish_deadline(&shared, &mut state);
        }

        // Resumptions happen strictly outside the state lock.
        for waker in wakers {
            waker.wake();
        }
    }

    final_drain(&shared);
}

fn handle_reply(shared: &Shared, state: &mut State, reply: Reply, wakers: &mut Vec<Waker>) {
    let cell = match state.replies.try_remove(reply.key) {
        Some(cell) => cell,
        None => return,
    };

    if reply.result.is_ok() {
        match cell.record {
            Record::Register { id, fd, interest } => {
                if cell.is_abandoned() {
                    // The caller vanished before the reply; undo the
                    // kernel-side registration.
                    let _ = shared.requests.push(Request::Deregister { reply: NO_REPLY, id });
                    shared.wake_poll();
                } else {
                    state
                        .registrations
                        .insert(id, super::Registration { fd, interest });
                }
            }
            Record::Modify { id, interest } => {
                if let Some(reg) = state.registrations.get_mut(&id) {
                    reg.interest = interest;
                }
            }
            Record::Deregister { id } => {
                state.registrations.swap_remove(&id);
            }
        }
    }

    if let Some(waker) = cell.resolve(reply.result) {
        wakers.push(waker);
    }
}

fn handle_event(state: &mut State, event: &Event, wakers: &mut Vec<Waker>) {
    for kind in event.readiness().kinds() {
        let key = Key {
            id: event.id(),
            interest: kind,
        };

        let waiter_state = state.waiters.get(&key).map(|waiter| waiter.state());
        match waiter_state {
            Some(bits) if bits & ARMED != 0 => {
                let waiter = state.waiters.swap_remove(&key).unwrap();
                state.bump_generation(key);
                let delivered = Event::new(event.id(), kind, event.flags());
                match waiter.resolve(Ok(delivered)) {
                    Resolution::Resumed(Some(waker)) => wakers.push(waker),
                    Resolution::Resumed(None) => {}
                    // Already drained elsewhere; the readiness is not lost.
                    Resolution::Spent => state.put_permit(key, event.flags()),
                }
            }
            Some(_) => {
                // Two-phase arm still in flight: cache the readiness for
                // phase one and invalidate the in-flight handle.
                state.waiters.swap_remove(&key);
                state.bump_generation(key);
                state.put_permit(key, event.flags());
            }
            None => {
                if state.registrations.contains_key(&event.id()) {
                    state.put_permit(key, event.flags());
                }
            }
        }
    }
}

fn handle_note(state: &mut State, note: Note, wakers: &mut Vec<Waker>) {
    match note {
        Note::Cancel { key, generation } => {
            if state.live_generation(key) != Some(generation) {
                return;
            }
            if let Some(waiter) = state.waiters.get(&key) {
                let waiter = waiter.clone();
                state.waiters.swap_remove(&key);
                state.bump_generation(key);
                if let Resolution::Resumed(Some(waker)) =
                    waiter.resolve(Err(SelectorError::Cancelled))
                {
                    wakers.push(waker);
                }
            }
        }
        Note::Deregister { id } => {
            if let Some(reg) = state.registrations.swap_remove(&id) {
                trace!(
                    "dropping registration of fd {} ({:?})",
                    reg.fd,
                    reg.interest
                );
            }

            let keys: Vec<Key> = state
                .waiters
                .keys()
                .filter(|key| key.id == id)
                .copied()
                .collect();
            for key in keys {
                let waiter = state.waiters.swap_remove(&key).unwrap();
                state.bump_generation(key);
                if let Resolution::Resumed(Some(waker)) =
                    waiter.resolve(Err(SelectorError::Os(LeafError::Deregistered)))
                {
                    wakers.push(waker);
                }
            }

            state.permits.retain(|key, _| key.id != id);
            state.generations.retain(|key, _| key.id != id);
        }
    }
}

enum HeapTop {
    Stale,
    Due,
    Wait,
    Empty,
}

fn classify_top(state: &State, now: Option<Instant>) -> HeapTop {
    match state.deadlines.peek() {
        None => HeapTop::Empty,
        Some(entry) => {
            if state.live_generation(entry.key) != Some(entry.generation) {
                HeapTop::Stale
            } else if now.map(|now| entry.when <= now).unwrap_or(false) {
                HeapTop::Due
            } else {
                HeapTop::Wait
            }
        }
    }
}

fn handle_deadlines(state: &mut State, wakers: &mut Vec<Waker>) {
    let now = Instant::now();
    loop {
        match classify_top(state, Some(now)) {
            // Stale entries for a reused key are dropped silently.
            HeapTop::Stale => {
                state.deadlines.pop();
            }
            HeapTop::Due => {
                let entry = state.deadlines.pop().unwrap();
                let armed = state
                    .waiters
                    .get(&entry.key)
                    .map(|waiter| waiter.state() & ARMED != 0)
                    .unwrap_or(false);
                if armed {
                    let waiter = state.waiters.swap_remove(&entry.key).unwrap();
                    state.bump_generation(entry.key);
                    if let Resolution::Resumed(Some(waker)) =
                        waiter.resolve(Err(SelectorError::Timeout))
                    {
                        wakers.push(waker);
                    }
                }
                // Unarmed waiters are untouched: the deadline bounds the
                // suspension, not the two-phase gap.
            }
            HeapTop::Wait | HeapTop::Empty => break,
        }
    }
}

fn republish_deadline(shared: &Shared, state: &mut State) {
    let next = loop {
        match classify_top(state, None) {
            HeapTop::Stale => {
                state.deadlines.pop();
            }
            HeapTop::Empty => break None,
            _ => break state.deadlines.peek().map(|entry| entry.when),
        }
    };

    let ns = next
        .map(|when| shared.deadline_ns(when))
        .unwrap_or(u64::MAX);
    let old = shared.next_deadline.swap(ns, Ordering::AcqRel);
    if ns < old {
        shared.wake_poll();
    }
}

/// Bridges closed: resume everything still parked with `Shutdown` and
/// clear every table.
fn final_drain(shared: &Shared) {
    let mut wakers = Vec::new();
    {
        let mut state = shared.state.lock().unwrap();

        let waiters: Vec<_> = state.waiters.drain(..).map(|(_, waiter)| waiter).collect();
        for waiter in waiters {
            if let Resolution::Resumed(Some(waker)) =
                waiter.resolve(Err(SelectorError::Shutdown))
            {
                wakers.push(waker);
            }
        }

        let cells: Vec<_> = state.replies.drain().collect();
        for cell in cells {
            if let Some(waker) = cell.resolve(Err(SelectorError::Shutdown)) {
                wakers.push(waker);
            }
        }

        state.permits.clear();
        state.generations.clear();
        state.deadlines.clear();
        state.registrations.clear();
        while shared.notes.pop().is_ok() {}
    }

    for waker in wakers {
        waker.wake();
    }

    debug!("dispatch thread drained and exiting");
}
