//! Blocking lane: a worker-thread pool that runs opaque blocking
//! operations and resumes async callers exactly once.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;

use log::debug;

use crate::error::LaneError;

mod context;
mod metrics;
mod ring;
mod worker;

pub use context::PayloadBox;
pub use metrics::{LatencyStat, MetricsSnapshot};

use context::OpCell;
use metrics::{Counters, Metrics};
use ring::Ring;

/// Policy when the job queue is at capacity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backpressure {
    /// Park the submission in the acceptance queue until capacity frees.
    Wait,
    /// Fail the submission immediately with `QueueFull`.
    FailFast,
}

/// Dequeue order for the job queue.
///
/// `Lifo` favors cache locality but can starve older jobs under sustained
/// load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheduling {
    Fifo,
    Lifo,
}

/// Edge-triggered job-queue occupancy transitions, delivered outside the
/// lane lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueTransition {
    BecameEmpty,
    BecameNonEmpty,
    BecameSaturated,
    BecameNotSaturated,
}

#[derive(Clone)]
pub struct PoolConfig {
    /// Worker threads; defaults to the CPU count.
    pub workers: usize,
    pub queue_limit: usize,
    /// Acceptance ring capacity; defaults to 4x the queue limit.
    pub acceptance_limit: usize,
    pub backpressure: Backpressure,
    pub scheduling: Scheduling,
    /// Jobs a worker takes per lock acquisition.
    pub drain_limit: usize,
    pub on_transition: Option<Arc<dyn Fn(QueueTransition) + Send + Sync>>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            queue_limit: 256,
            acceptance_limit: 1024,
            backpressure: Backpressure::Wait,
            scheduling: Scheduling::Fifo,
            drain_limit: 16,
            on_transition: None,
        }
    }
}

impl PoolConfig {
    fn validated(mut self) -> PoolConfig {
        self.workers = self.workers.max(1);
        self.queue_limit = self.queue_limit.max(1);
        self.acceptance_limit = self.acceptance_limit.max(1);
        self.drain_limit = self.drain_limit.max(1);
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("PoolConfig")
            .field("workers", &self.workers)
            .field("queue_limit", &self.queue_limit)
            .field("acceptance_limit", &self.acceptance_limit)
            .field("backpressure", &self.backpressure)
            .field("scheduling", &self.scheduling)
            .field("drain_limit", &self.drain_limit)
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}

pub(crate) struct Job {
    ticket: u64,
    op: Box<dyn FnOnce() -> PayloadBox + Send>,
    ctx: Arc<OpCell>,
    submitted_at: Instant,
    enqueued_at: Instant,
}

pub(crate) struct AcceptEntry {
    /// `None` once the deadline manager expired the entry in place.
    job: Option<Job>,
    deadline: Option<Instant>,
}

pub(crate) struct LaneState {
    queue: Ring<Job>,
    acceptance: Ring<AcceptEntry>,
    shutdown: bool,
    sleeping: usize,
}

pub(crate) struct PoolShared {
    state: Mutex<LaneState>,
    worker_cv: Condvar,
    deadline_cv: Condvar,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    next_ticket: AtomicU64,
    metrics: Metrics,
    config: PoolConfig,
}

fn queue_edges(before: (bool, bool), after: (bool, bool), out: &mut Vec<QueueTransition>) {
    if before.0 && !after.0 {
        out.push(QueueTransition::BecameNonEmpty);
    }
    if !before.0 && after.0 {
        out.push(QueueTransition::BecameEmpty);
    }
    if !before.1 && after.1 {
        out.push(QueueTransition::BecameSaturated);
    }
    if before.1 && !after.1 {
        out.push(QueueTransition::BecameNotSaturated);
    }
}

fn deliver_transitions(shared: &PoolShared, transitions: &[QueueTransition]) {
    if let Some(callback) = &shared.config.on_transition {
        for transition in transitions {
            callback(*transition);
        }
    }
}

/// Thread pool that runs blocking operations on dedicated OS threads and
/// resolves a future per submission.
///
/// # Examples
///
/// ```no_run
/// use relay_io::{Pool, PoolConfig};
///
/// let pool = Pool::new(PoolConfig::default());
/// let sum = futures::executor::block_on(pool.run(None, || (1..=10).sum::<i32>()));
/// assert_eq!(sum.unwrap(), 55);
/// pool.shutdown();
/// ```
pub struct Pool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Pool {
    /// Spawns the worker and deadline-manager threads.
    ///
    /// Panics when a thread cannot be spawned.
    pub fn new(config: PoolConfig) -> Pool {
        let config = config.validated();

        let shared = Arc::new(PoolShared {
            state: Mutex::new(LaneState {
                queue: Ring::with_capacity(config.queue_limit),
                acceptance: Ring::with_capacity(config.acceptance_limit),
                shutdown: false,
                sleeping: 0,
            }),
            worker_cv: Condvar::new(),
            deadline_cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            next_ticket: AtomicU64::new(0),
            metrics: Metrics::new(),
            config: config.clone(),
        });

        let mut threads = Vec::with_capacity(config.workers + 1);
        for index in 0..config.workers {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("relay-worker-{}", index))
                .spawn(move || worker::worker_main(shared))
                .expect("failed to spawn lane worker");
            threads.push(handle);
        }

        let deadline_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("relay-deadline".into())
            .spawn(move || worker::deadline_main(deadline_shared))
            .expect("failed to spawn deadline manager");
        threads.push(handle);

        debug!("lane started with {} workers", config.workers);

        Pool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// Submits an operation, returning a handle that resolves to its
    /// result. `deadline` bounds only the acceptance wait: once a worker
    /// owns the job it runs to completion.
    pub fn submit<T, F>(&self, deadline: Option<Instant>, op: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let ctx = Arc::new(OpCell::new());
        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = JobHandle {
            shared: self.shared.clone(),
            ctx: ctx.clone(),
            ticket,
            finished: false,
            _marker: PhantomData,
        };

        let now = Instant::now();
        let job = Job {
            ticket,
            op: Box::new(move || PayloadBox::make(op())),
            ctx: ctx.clone(),
            submitted_at: now,
            enqueued_at: now,
        };

        let mut transitions = Vec::new();
        let mut signal_deadline = false;
        let rejected = {
            let mut st = self.shared.state.lock().unwrap();
            if st.shutdown {
                Some(LaneError::Shutdown)
            } else if !st.queue.is_full() {
                let before = (st.queue.is_empty(), st.queue.is_full());
                let _ = st.queue.push_back(job);
                Counters::bump(&self.shared.metrics.counters.enqueued);
                queue_edges(before, (false, st.queue.is_full()), &mut transitions);
                if before.0 {
                    // Empty -> non-empty edge; broadcast so no sleeper
                    // misses the wakeup.
                    self.shared.worker_cv.notify_all();
                }
                None
            } else {
                match self.shared.config.backpressure {
                    Backpressure::FailFast => Some(LaneError::QueueFull),
                    Backpressure::Wait => {
                        if st.acceptance.is_full() {
                            Some(LaneError::Overloaded)
                        } else {
                            signal_deadline = deadline.is_some();
                            let _ = st.acceptance.push_back(AcceptEntry {
                                job: Some(job),
                                deadline,
                            });
                            None
                        }
                    }
                }
            }
        };

        if let Some(error) = rejected {
            match error {
                LaneError::QueueFull => Counters::bump(&self.shared.metrics.counters.fail_fast),
                LaneError::Overloaded => Counters::bump(&self.shared.metrics.counters.overloaded),
                _ => {}
            }
            ctx.fail(error);
        }
        if signal_deadline {
            self.shared.deadline_cv.notify_one();
        }
        deliver_transitions(&self.shared, &transitions);

        handle
    }

    /// Runs an operation to completion.
    pub async fn run<T, F>(&self, deadline: Option<Instant>, op: F) -> Result<T, LaneError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(deadline, op).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let (queue_depth, acceptance_depth, sleeping_workers) = {
            let st = self.shared.state.lock().unwrap();
            (st.queue.len(), st.acceptance.len(), st.sleeping)
        };
        let aggregates = self.shared.metrics.aggregates.lock().unwrap();
        let counters = &self.shared.metrics.counters;

        MetricsSnapshot {
            queue_depth,
            acceptance_depth,
            executing: self.shared.in_flight.load(Ordering::Acquire),
            sleeping_workers,
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            started: counters.started.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            promoted: counters.promoted.load(Ordering::Relaxed),
            acceptance_timeouts: counters.acceptance_timeout.load(Ordering::Relaxed),
            fail_fast: counters.fail_fast.load(Ordering::Relaxed),
            overloaded: counters.overloaded.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            enqueue_to_start: aggregates.enqueue_to_start,
            execution: aggregates.execution,
            acceptance_wait: aggregates.acceptance_wait,
        }
    }

    /// Drains the lane and joins its threads.
    ///
    /// Acceptance waiters fail with `Shutdown`; jobs already queued run to
    /// completion. Idempotent.
    pub fn shutdown(&self) {
        let mut drained = Vec::new();
        {
            let mut st = self.shared.state.lock().unwrap();
            if !st.shutdown {
                st.shutdown = true;
                self.shared.shutting_down.store(true, Ordering::Release);
                for entry in st.acceptance.drain() {
                    if let Some(job) = entry.job {
                        drained.push(job);
                    }
                }
                self.shared.worker_cv.notify_all();
                self.shared.deadline_cv.notify_all();
            }
        }

        for job in drained {
            job.ctx.fail(LaneError::Shutdown);
        }

        {
            let mut st = self.shared.state.lock().unwrap();
            while self.shared.in_flight.load(Ordering::Acquire) > 0 || !st.queue.is_empty() {
                st = self.shared.worker_cv.wait(st).unwrap();
            }
        }

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("lane shutdown complete");
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Pool")
    }
}

/// Future for a submitted operation.
///
/// Dropping the handle cancels the submission; a worker that already picked
/// the job up still runs it and discards the orphaned result.
pub struct JobHandle<T> {
    shared: Arc<PoolShared>,
    ctx: Arc<OpCell>,
    ticket: u64,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JobHandle<T> {
    /// Monotonic identifier assigned at submission.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// A cloneable cancel capability for this submission.
    pub fn canceller(&self) -> JobCanceller {
        JobCanceller {
            shared: self.shared.clone(),
            ctx: self.ctx.clone(),
        }
    }

    /// Abandons the handle without cancelling the operation.
    pub fn detach(mut self) {
        self.finished = true;
    }
}

impl<T: Send + 'static> Future for JobHandle<T> {
    type Output = Result<T, LaneError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.ctx.poll_outcome(cx) {
            Poll::Ready(outcome) => {
                this.finished = true;
                Poll::Ready(outcome.and_then(|payload| {
                    payload
                        .take::<T>()
                        .map_err(|_| LaneError::Invariant("result type mismatch"))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for JobHandle<T> {
    fn drop(&mut self) {
        if !self.finished && self.ctx.cancel() {
            Counters::bump(&self.shared.metrics.counters.cancelled);
        }
    }
}

/// Cancels a submission from anywhere; the first winner resumes the caller
/// with `Cancelled`.
#[derive(Clone)]
pub struct JobCanceller {
    shared: Arc<PoolShared>,
    ctx: Arc<OpCell>,
}

impl JobCanceller {
    /// Returns whether this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        let won = self.ctx.cancel();
        if won {
            Counters::bump(&self.shared.metrics.counters.cancelled);
        }
        won
    }
}
