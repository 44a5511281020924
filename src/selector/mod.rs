//! Readiness selector: registrations, arming, permits and deadlines over a
//! pluggable platform driver.
//!
//! The selector splits work across two dedicated threads. The poll thread
//! owns the driver handle and blocks in `poll`; the dispatch thread is the
//! single resumption funnel, consuming event batches and replies off the
//! bridges and resuming callers. Entry points called from async context
//! mutate selector state under the state lock but never resume anyone.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Instant;

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use slab::Slab;

use crate::driver::{Driver, DriverKind, WakeHandle};
use crate::error::{LeafError, MakeError, SelectorError};
use crate::event::{Event, EventFlags};
use crate::interest::Interest;

mod bridge;
mod dispatch;
mod poll_thread;
mod token;
mod waiter;

pub use token::{Armed, Phase, Registering, Token};

use bridge::Bridge;
use waiter::{Key, Resolution, Waiter, ARMED, CANCELLED, DRAINED};

pub(crate) const NO_REPLY: usize = usize::MAX;

const RUNNING: u8 = 0;
const SHUTTING: u8 = 1;
const DONE: u8 = 2;

/// Message on the event bridge.
pub(crate) enum Batch {
    Events(Vec<Event>),
    /// No events; the dispatch thread should drain replies, cancellations
    /// and expired deadlines.
    Tick,
}

pub(crate) struct Reply {
    pub key: usize,
    pub result: Result<(), SelectorError>,
}

pub(crate) enum Request {
    Register {
        reply: usize,
        id: u64,
        fd: RawFd,
        interest: Interest,
    },
    Modify {
        reply: usize,
        id: u64,
        interest: Interest,
    },
    Deregister {
        reply: usize,
        id: u64,
    },
    /// Fire-and-forget: an arm failure means the registration is gone and
    /// the waiter is resumed through another path.
    Arm {
        id: u64,
        interest: Interest,
    },
}

/// Out-of-band notes for the dispatch thread.
pub(crate) enum Note {
    Cancel { key: Key, generation: u64 },
    Deregister { id: u64 },
}

pub(crate) struct Registration {
    pub fd: RawFd,
    pub interest: Interest,
}

/// What to record locally once the poll thread acknowledges a request.
#[derive(Copy, Clone)]
pub(crate) enum Record {
    Register {
        id: u64,
        fd: RawFd,
        interest: Interest,
    },
    Modify {
        id: u64,
        interest: Interest,
    },
    Deregister {
        id: u64,
    },
}

struct ReplySlot {
    outcome: Option<Result<(), SelectorError>>,
    waker: Option<Waker>,
}

pub(crate) struct ReplyCell {
    pub record: Record,
    abandoned: AtomicBool,
    slot: Mutex<ReplySlot>,
}

impl ReplyCell {
    fn new(record: Record) -> ReplyCell {
        ReplyCell {
            record,
            abandoned: AtomicBool::new(false),
            slot: Mutex::new(ReplySlot {
                outcome: None,
                waker: None,
            }),
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn resolve(&self, outcome: Result<(), SelectorError>) -> Option<Waker> {
        let mut slot = self.slot.lock().unwrap();
        slot.outcome = Some(outcome);
        slot.waker.take()
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<(), SelectorError>> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(outcome) = slot.outcome.take() {
            Poll::Ready(outcome)
        } else {
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Min-heap entry for an armed deadline; valid only while its generation
/// matches the generation table.
pub(crate) struct DeadlineEntry {
    pub when: Instant,
    pub key: Key,
    pub generation: u64,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &DeadlineEntry) -> CmpOrdering {
        // Reversed so the BinaryHeap surfaces the earliest deadline.
        other.when.cmp(&self.when)
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &DeadlineEntry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &DeadlineEntry) -> bool {
        self.when == other.when
    }
}

impl Eq for DeadlineEntry {}

pub(crate) struct State {
    pub registrations: IndexMap<u64, Registration>,
    pub waiters: IndexMap<Key, Arc<Waiter>>,
    pub permits: IndexMap<Key, EventFlags>,
    pub generations: IndexMap<Key, u64>,
    pub deadlines: BinaryHeap<DeadlineEntry>,
    pub replies: Slab<Arc<ReplyCell>>,
}

impl State {
    fn new() -> State {
        State {
            registrations: IndexMap::new(),
            waiters: IndexMap::new(),
            permits: IndexMap::new(),
            generations: IndexMap::new(),
            deadlines: BinaryHeap::new(),
            replies: Slab::new(),
        }
    }

    pub fn live_generation(&self, key: Key) -> Option<u64> {
        self.generations.get(&key).copied()
    }

    pub fn generation_for(&mut self, key: Key) -> u64 {
        *self.generations.entry(key).or_insert(0)
    }

    pub fn bump_generation(&mut self, key: Key) {
        *self.generations.entry(key).or_insert(0) += 1;
    }

    pub fn put_permit(&mut self, key: Key, flags: EventFlags) {
        *self.permits.entry(key).or_insert(EventFlags::empty()) |= flags;
    }
}

pub(crate) struct Shared {
    pub state: Mutex<State>,
    pub requests: ConcurrentQueue<Request>,
    pub notes: ConcurrentQueue<Note>,
    pub events: Bridge<Batch>,
    pub replies: Bridge<Reply>,
    pub poll_wake: Box<dyn WakeHandle>,
    /// Earliest armed deadline in nanoseconds past `epoch`; `u64::MAX`
    /// means none. The poll thread uses this as its syscall timeout.
    pub next_deadline: AtomicU64,
    pub epoch: Instant,
    pub poll_shutdown: AtomicBool,
    lifecycle: AtomicU8,
    /// Parks shutdown callers that lost the lifecycle race until the
    /// winner finishes joining.
    lifecycle_lock: Mutex<()>,
    lifecycle_cv: Condvar,
    next_id: AtomicU64,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn wake_poll(&self) {
        if let Err(err) = self.poll_wake.wake() {
            warn!("failed to wake poll thread: {}", err);
        }
    }

    pub(crate) fn deadline_ns(&self, when: Instant) -> u64 {
        let ns = when.saturating_duration_since(self.epoch).as_nanos();
        ns.min((u64::MAX - 1) as u128) as u64
    }

    pub(crate) fn publish_deadline(&self, when: Instant) {
        let ns = self.deadline_ns(when);
        let old = self.next_deadline.fetch_min(ns, Ordering::AcqRel);
        if ns < old {
            self.wake_poll();
        }
    }
}

/// Copyable handle to a two-phase arm in flight.
#[derive(Copy, Clone, Debug)]
pub struct ArmHandle {
    id: u64,
    interest: Interest,
    generation: u64,
}

impl ArmHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }
}

/// Result of a single-phase arm. The capability always comes back: `Armed`
/// once the kernel arm was issued, in its original phase when the arm never
/// reached the kernel.
pub enum ArmOutcome<P: Phase> {
    /// Readiness delivered.
    Ready { token: Token<Armed>, event: Event },
    /// The kernel filter was armed but the wait ended without readiness.
    Incomplete {
        token: Token<Armed>,
        error: SelectorError,
    },
    /// The arm never reached the kernel; the token phase is unchanged.
    Rejected {
        token: Token<P>,
        error: SelectorError,
    },
}

/// Result of phase one of a two-phase arm.
pub enum BeginOutcome<P: Phase> {
    /// A cached permit satisfied the arm synchronously.
    Ready { token: Token<Armed>, event: Event },
    /// The kernel arm is in flight; await the handle for the event.
    Pending {
        token: Token<Armed>,
        handle: ArmHandle,
    },
    Rejected {
        token: Token<P>,
        error: SelectorError,
    },
}

struct ReplyWait {
    cell: Arc<ReplyCell>,
    done: bool,
}

impl Future for ReplyWait {
    type Output = Result<(), SelectorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.cell.poll_outcome(cx) {
            Poll::Ready(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ReplyWait {
    fn drop(&mut self) {
        if !self.done {
            self.cell.abandoned.store(true, Ordering::Release);
        }
    }
}

struct ArmWait {
    shared: Arc<Shared>,
    waiter: Arc<Waiter>,
    done: bool,
}

impl Future for ArmWait {
    type Output = Result<Event, SelectorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.waiter.poll_outcome(cx) {
            Poll::Ready(outcome) => {
                this.done = true;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ArmWait {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Synchronous flag flip; the dispatch thread performs the actual
        // drain so the resumption funnel stays intact.
        let prev = self.waiter.cancel();
        if prev & (DRAINED | CANCELLED) == 0 {
            let _ = self.shared.notes.push(Note::Cancel {
                key: self.waiter.key,
                generation: self.waiter.generation,
            });
            self.shared.events.push(Batch::Tick);
        }
    }
}

struct Join2<'a, T> {
    a: Pin<Box<dyn Future<Output = T> + 'a>>,
    b: Pin<Box<dyn Future<Output = T> + 'a>>,
    ra: Option<T>,
    rb: Option<T>,
}

impl<'a, T> Future for Join2<'a, T> {
    type Output = (T, T);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `a` and `b` are independently pinned behind `Box`, and
        // `ra`/`rb` are plain values that are never pinned in place, so
        // projecting the fields here does not require `T: Unpin`.
        let this = unsafe { self.get_unchecked_mut() };
        if this.ra.is_none() {
            if let Poll::Ready(value) = this.a.as_mut().poll(cx) {
                this.ra = Some(value);
            }
        }
        if this.rb.is_none() {
            if let Poll::Ready(value) = this.b.as_mut().poll(cx) {
                this.rb = Some(value);
            }
        }
        if this.ra.is_some() && this.rb.is_some() {
            Poll::Ready((this.ra.take().unwrap(), this.rb.take().unwrap()))
        } else {
            Poll::Pending
        }
    }
}

/// Diagnostic table depths, mostly useful for shutdown assertions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorDepths {
    pub registrations: usize,
    pub waiters: usize,
    pub permits: usize,
    pub pending_replies: usize,
    pub deadlines: usize,
}

/// Multiplexes descriptor registrations over one poll thread and resumes
/// async callers from a single dispatch thread.
#[derive(Clone)]
pub struct Selector {
    shared: Arc<Shared>,
}

impl Selector {
    /// Builds a selector over the platform default driver.
    pub fn new() -> Result<Selector, MakeError> {
        let driver = DriverKind::for_platform()
            .create()
            .map_err(MakeError::Driver)?;
        Selector::make(driver)
    }

    /// Builds a selector over an explicit driver, spawning the poll and
    /// dispatch threads.
    pub fn make(driver: Box<dyn Driver>) -> Result<Selector, MakeError> {
        let poll_wake = driver.wake_handle().map_err(MakeError::Driver)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            requests: ConcurrentQueue::unbounded(),
            notes: ConcurrentQueue::unbounded(),
            events: Bridge::new(),
            replies: Bridge::new(),
            poll_wake,
            next_deadline: AtomicU64::new(u64::MAX),
            epoch: Instant::now(),
            poll_shutdown: AtomicBool::new(false),
            lifecycle: AtomicU8::new(RUNNING),
            lifecycle_lock: Mutex::new(()),
            lifecycle_cv: Condvar::new(),
            next_id: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
        });

        let poll_shared = shared.clone();
        let poll = thread::Builder::new()
            .name("relay-poll".into())
            .spawn(move || poll_thread::poll_main(driver, poll_shared))?;

        let dispatch_shared = shared.clone();
        let dispatch = match thread::Builder::new()
            .name("relay-selector".into())
            .spawn(move || dispatch::dispatch_main(dispatch_shared))
        {
            Ok(handle) => handle,
            Err(err) => {
                shared.poll_shutdown.store(true, Ordering::Release);
                shared.requests.close();
                shared.wake_poll();
                let _ = poll.join();
                return Err(MakeError::Thread(err));
            }
        };

        shared.threads.lock().unwrap().extend([poll, dispatch]);
        debug!("selector started");

        Ok(Selector { shared })
    }

    fn check_running(&self) -> Result<(), SelectorError> {
        if self.shared.lifecycle.load(Ordering::Acquire) == RUNNING {
            Ok(())
        } else {
            Err(SelectorError::Shutdown)
        }
    }

    fn submit_request(&self, request: Request) -> Result<(), SelectorError> {
        if self.shared.requests.push(request).is_err() {
            return Err(SelectorError::Shutdown);
        }
        self.shared.wake_poll();
        Ok(())
    }

    /// Runs a registration request through the poll thread and awaits the
    /// reply.
    async fn round_trip(&self, record: Record) -> Result<(), SelectorError> {
        let cell = Arc::new(ReplyCell::new(record));
        let key = {
            let mut state = self.shared.state.lock().unwrap();
            state.replies.insert(cell.clone())
        };

        let request = match record {
            Record::Register { id, fd, interest } => Request::Register {
                reply: key,
                id,
                fd,
                interest,
            },
            Record::Modify { id, interest } => Request::Modify {
                reply: key,
                id,
                interest,
            },
            Record::Deregister { id } => Request::Deregister { reply: key, id },
        };

        if let Err(err) = self.submit_request(request) {
            self.shared.state.lock().unwrap().replies.try_remove(key);
            return Err(err);
        }

        ReplyWait { cell, done: false }.await
    }

    /// Registers a descriptor, yielding its id and the registering
    /// capability. Readiness is delivered only once the token is armed.
    pub async fn register(
        &self,
        fd: RawFd,
        interest: Interest,
    ) -> Result<(u64, Token<Registering>), SelectorError> {
        if fd < 0 {
            return Err(SelectorError::Os(LeafError::InvalidDescriptor));
        }
        if !interest.is_readable() && !interest.is_writable() {
            return Err(SelectorError::Os(LeafError::InvalidInterest));
        }
        self.check_running()?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.round_trip(Record::Register { id, fd, interest }).await?;
        trace!("registered fd {} as id {}", fd, id);

        Ok((id, Token::new(id)))
    }

    /// Replaces the recorded interest of a registration.
    pub async fn modify<P: Phase>(
        &self,
        token: &Token<P>,
        interest: Interest,
    ) -> Result<(), SelectorError> {
        if !interest.is_readable() && !interest.is_writable() {
            return Err(SelectorError::Os(LeafError::InvalidInterest));
        }
        self.check_running()?;

        self.round_trip(Record::Modify {
            id: token.id(),
            interest,
        })
        .await
    }

    /// Arms one readiness kind and waits for the event.
    ///
    /// A cached permit completes synchronously; the kernel is re-armed for
    /// the next edge either way. `interest` must name exactly one kind.
    pub async fn arm<P: Phase>(
        &self,
        token: Token<P>,
        interest: Interest,
        deadline: Option<Instant>,
    ) -> ArmOutcome<P> {
        let id = token.id();
        if !interest.is_single() {
            return ArmOutcome::Rejected {
                token,
                error: SelectorError::Os(LeafError::InvalidInterest),
            };
        }
        if let Err(error) = self.check_running() {
            return ArmOutcome::Rejected { token, error };
        }

        enum Pre {
            Permit(EventFlags),
            Wait(Arc<Waiter>),
        }

        let key = Key { id, interest };
        let (pre, stale_waker) = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.registrations.contains_key(&id) {
                return ArmOutcome::Rejected {
                    token,
                    error: SelectorError::Os(LeafError::NotRegistered),
                };
            }

            if let Some(flags) = state.permits.swap_remove(&key) {
                (Pre::Permit(flags), None)
            } else {
                let generation = state.generation_for(key);
                let waiter = Arc::new(Waiter::armed(key, generation));
                let stale = state
                    .waiters
                    .insert(key, waiter.clone())
                    .and_then(|old| match old.resolve(Err(SelectorError::Cancelled)) {
                        Resolution::Resumed(waker) => waker,
                        Resolution::Spent => None,
                    });
                if let Some(when) = deadline {
                    state.deadlines.push(DeadlineEntry {
                        when,
                        key,
                        generation,
                    });
                }
                (Pre::Wait(waiter), stale)
            }
        };
        if let Some(waker) = stale_waker {
            waker.wake();
        }

        match pre {
            Pre::Permit(flags) => {
                // Still arm the kernel so the next edge is observable.
                if let Err(err) = self.submit_request(Request::Arm { id, interest }) {
                    trace!("arm request dropped during shutdown: {}", err);
                }
                ArmOutcome::Ready {
                    token: Token::new(id),
                    event: Event::new(id, interest, flags),
                }
            }
            Pre::Wait(waiter) => {
                if let Err(error) = self.submit_request(Request::Arm { id, interest }) {
                    // The waiter is drained by the dispatch teardown.
                    return ArmOutcome::Rejected { token, error };
                }
                if let Some(when) = deadline {
                    self.shared.publish_deadline(when);
                }
                let wait = ArmWait {
                    shared: self.shared.clone(),
                    waiter,
                    done: false,
                };
                match wait.await {
                    Ok(event) => ArmOutcome::Ready {
                        token: Token::new(id),
                        event,
                    },
                    Err(error) => ArmOutcome::Incomplete {
                        token: Token::new(id),
                        error,
                    },
                }
            }
        }
    }

    /// Phase one of a two-phase arm: consult the permit cache and issue the
    /// kernel arm without installing a continuation.
    pub fn begin<P: Phase>(&self, token: Token<P>, interest: Interest) -> BeginOutcome<P> {
        let id = token.id();
        if !interest.is_single() {
            return BeginOutcome::Rejected {
                token,
                error: SelectorError::Os(LeafError::InvalidInterest),
            };
        }
        if let Err(error) = self.check_running() {
            return BeginOutcome::Rejected { token, error };
        }

        let key = Key { id, interest };
        let (out, stale_waker) = {
            let mut state = self.shared.state.lock().unwrap();
            if !state.registrations.contains_key(&id) {
                return BeginOutcome::Rejected {
                    token,
                    error: SelectorError::Os(LeafError::NotRegistered),
                };
            }

            if let Some(flags) = state.permits.swap_remove(&key) {
                (
                    BeginOutcome::Ready {
                        token: Token::new(id),
                        event: Event::new(id, interest, flags),
                    },
                    None,
                )
            } else {
                let generation = state.generation_for(key);
                let waiter = Arc::new(Waiter::unarmed(key, generation));
                let stale = state
                    .waiters
                    .insert(key, waiter)
                    .and_then(|old| match old.resolve(Err(SelectorError::Cancelled)) {
                        Resolution::Resumed(waker) => waker,
                        Resolution::Spent => None,
                    });
                (
                    BeginOutcome::Pending {
                        token: Token::new(id),
                        handle: ArmHandle {
                            id,
                            interest,
                            generation,
                        },
                    },
                    stale,
                )
            }
        };
        if let Some(waker) = stale_waker {
            waker.wake();
        }

        if let Err(err) = self.submit_request(Request::Arm { id, interest }) {
            trace!("arm request dropped during shutdown: {}", err);
        }

        out
    }

    /// Phase two: install the continuation and wait.
    ///
    /// Fails with `Cancelled` when the waiter is gone or its generation
    /// changed (an event already converted it into a permit). Permits are
    /// not consulted here; they belong to phase one.
    pub async fn await_arm(
        &self,
        handle: ArmHandle,
        deadline: Option<Instant>,
    ) -> Result<Event, SelectorError> {
        self.check_running()?;

        let key = Key {
            id: handle.id,
            interest: handle.interest,
        };
        let wait = {
            let mut state = self.shared.state.lock().unwrap();
            let waiter = match state.waiters.get(&key) {
                Some(waiter) if waiter.generation == handle.generation => waiter.clone(),
                _ => return Err(SelectorError::Cancelled),
            };

            let prev = waiter.arm();
            if prev & ARMED != 0 {
                // A waiter is armed exactly once.
                return Err(SelectorError::Cancelled);
            }
            if let Some(when) = deadline {
                state.deadlines.push(DeadlineEntry {
                    when,
                    key,
                    generation: handle.generation,
                });
            }

            ArmWait {
                shared: self.shared.clone(),
                waiter,
                done: false,
            }
        };
        if let Some(when) = deadline {
            self.shared.publish_deadline(when);
        }

        wait.await
    }

    /// Composes two begins and awaits any resulting handles concurrently,
    /// allowing overlapping deadlines.
    pub async fn arm_two<P1: Phase, P2: Phase>(
        &self,
        first: (Token<P1>, Interest, Option<Instant>),
        second: (Token<P2>, Interest, Option<Instant>),
    ) -> (ArmOutcome<P1>, ArmOutcome<P2>) {
        enum Half<P: Phase> {
            Done(ArmOutcome<P>),
            Wait(Token<Armed>, ArmHandle),
        }

        fn half<P: Phase>(outcome: BeginOutcome<P>) -> Half<P> {
            match outcome {
                BeginOutcome::Ready { token, event } => {
                    Half::Done(ArmOutcome::Ready { token, event })
                }
                BeginOutcome::Pending { token, handle } => Half::Wait(token, handle),
                BeginOutcome::Rejected { token, error } => {
                    Half::Done(ArmOutcome::Rejected { token, error })
                }
            }
        }

        fn finish<P: Phase>(
            token: Token<Armed>,
            result: Result<Event, SelectorError>,
        ) -> ArmOutcome<P> {
            match result {
                Ok(event) => ArmOutcome::Ready { token, event },
                Err(error) => ArmOutcome::Incomplete { token, error },
            }
        }

        let (token_a, interest_a, deadline_a) = first;
        let (token_b, interest_b, deadline_b) = second;

        let a = half(self.begin(token_a, interest_a));
        let b = half(self.begin(token_b, interest_b));

        match (a, b) {
            (Half::Done(x), Half::Done(y)) => (x, y),
            (Half::Done(x), Half::Wait(token, handle)) => {
                let result = self.await_arm(handle, deadline_b).await;
                (x, finish(token, result))
            }
            (Half::Wait(token, handle), Half::Done(y)) => {
                let result = self.await_arm(handle, deadline_a).await;
                (finish(token, result), y)
            }
            (Half::Wait(token_a, handle_a), Half::Wait(token_b, handle_b)) => {
                let join = Join2 {
                    a: Box::pin(self.await_arm(handle_a, deadline_a)),
                    b: Box::pin(self.await_arm(handle_b, deadline_b)),
                    ra: None,
                    rb: None,
                };
                let (ra, rb) = join.await;
                (finish(token_a, ra), finish(token_b, rb))
            }
        }
    }

    /// Removes a registration: every waiter on the id is drained with
    /// `Deregistered`, generations are bumped, and the kernel-side removal
    /// is awaited best-effort.
    pub async fn deregister<P: Phase>(&self, token: Token<P>) -> Result<(), SelectorError> {
        self.check_running()?;
        let id = token.id();

        // The drain happens on the dispatch thread so resumptions stay in
        // the funnel.
        let _ = self.shared.notes.push(Note::Deregister { id });
        self.shared.events.push(Batch::Tick);

        let _ = self.round_trip(Record::Deregister { id }).await;
        trace!("deregistered id {}", id);

        Ok(())
    }

    /// Fire-and-forget removal for drop paths that cannot await.
    pub(crate) fn drop_registration(&self, id: u64) {
        let _ = self.shared.notes.push(Note::Deregister { id });
        self.shared.events.push(Batch::Tick);
        let _ = self.shared.requests.push(Request::Deregister { reply: NO_REPLY, id });
        self.shared.wake_poll();
    }

    pub fn depths(&self) -> SelectorDepths {
        let state = self.shared.state.lock().unwrap();
        SelectorDepths {
            registrations: state.registrations.len(),
            waiters: state.waiters.len(),
            permits: state.permits.len(),
            pending_replies: state.replies.len(),
            deadlines: state.deadlines.len(),
        }
    }

    /// Stops both threads and drains every waiter and pending reply with
    /// `Shutdown`. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .lifecycle
            .compare_exchange(RUNNING, SHUTTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Second caller parks until the winner finishes.
            let mut guard = self.shared.lifecycle_lock.lock().unwrap();
            while self.shared.lifecycle.load(Ordering::Acquire) != DONE {
                guard = self.shared.lifecycle_cv.wait(guard).unwrap();
            }
            return;
        }

        debug!("selector shutdown requested");
        self.shared.poll_shutdown.store(true, Ordering::Release);
        self.shared.requests.close();
        self.shared.wake_poll();

        self.join_threads();
        {
            let _guard = self.shared.lifecycle_lock.lock().unwrap();
            self.shared.lifecycle.store(DONE, Ordering::Release);
        }
        self.shared.lifecycle_cv.notify_all();
        debug!("selector shutdown complete");
    }

    fn join_threads(&self) {
        let handles: Vec<_> = self.shared.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "Selector")
    }
}
