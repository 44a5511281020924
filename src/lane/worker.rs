use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{trace, warn};

use crate::error::LaneError;

use super::metrics::Counters;
use super::{deliver_transitions, queue_edges, Job, LaneState, PoolShared, Scheduling};

enum Popped {
    Job(Job),
    Expired(Job),
    None,
}

/// Pops the next live acceptance waiter, lazily discarding entries whose
/// context already resolved and surfacing expired ones for a timeout
/// failure.
fn pop_acceptance(shared: &PoolShared, st: &mut LaneState) -> Popped {
    let now = Instant::now();
    loop {
        let entry = match st.acceptance.pop_front() {
            Some(entry) => entry,
            None => return Popped::None,
        };
        let mut job = match entry.job {
            Some(job) => job,
            // Husk left behind by the deadline manager.
            None => continue,
        };
        if !job.ctx.is_pending() {
            continue;
        }
        if let Some(when) = entry.deadline {
            if when <= now {
                return Popped::Expired(job);
            }
        }

        job.enqueued_at = now;
        Counters::bump(&shared.metrics.counters.promoted);
        shared
            .metrics
            .aggregates
            .lock()
            .unwrap()
            .acceptance_wait
            .record(now.saturating_duration_since(job.submitted_at));
        return Popped::Job(job);
    }
}

/// Refills the job queue from the acceptance ring after capacity freed.
fn promote(shared: &PoolShared, st: &mut LaneState, expired: &mut Vec<Job>) {
    while !st.queue.is_full() {
        match pop_acceptance(shared, st) {
            Popped::Job(job) => {
                let was_empty = st.queue.is_empty();
                let _ = st.queue.push_back(job);
                Counters::bump(&shared.metrics.counters.enqueued);
                if was_empty {
                    shared.worker_cv.notify_all();
                }
            }
            Popped::Expired(job) => expired.push(job),
            Popped::None => break,
        }
    }
}

fn expire_job(shared: &PoolShared, job: Job) {
    Counters::bump(&shared.metrics.counters.acceptance_timeout);
    trace!("acceptance deadline elapsed for ticket {}", job.ticket);
    job.ctx.fail(LaneError::Timeout);
}

fn execute(shared: &PoolShared, job: Job) {
    let start = Instant::now();
    Counters::bump(&shared.metrics.counters.started);
    {
        let mut agg = shared.metrics.aggregates.lock().unwrap();
        agg.enqueue_to_start
            .record(start.saturating_duration_since(job.enqueued_at));
    }

    let Job { ticket, op, ctx, .. } = job;
    let result = catch_unwind(AssertUnwindSafe(op));
    {
        let mut agg = shared.metrics.aggregates.lock().unwrap();
        agg.execution.record(start.elapsed());
    }

    match result {
        Ok(payload) => {
            Counters::bump(&shared.metrics.counters.completed);
            // A lost race drops the orphaned payload here.
            if ctx.complete(payload).is_err() && ctx.was_cancelled() {
                trace!("ticket {} finished after cancellation", ticket);
            }
        }
        Err(_) => {
            warn!("lane operation panicked (ticket {})", ticket);
            ctx.fail(LaneError::Invariant("operation panicked"));
        }
    }
}

pub(crate) fn worker_main(shared: Arc<PoolShared>) {
    let drain_limit = shared.config.drain_limit;

    loop {
        let mut batch: Vec<Job> = Vec::new();
        let mut expired: Vec<Job> = Vec::new();
        let mut transitions = Vec::new();
        {
            let mut st = shared.state.lock().unwrap();
            loop {
                if st.shutdown && st.queue.is_empty() && st.acceptance.is_empty() {
                    drop(st);
                    // Let the shutdown waiter re-check quiescence.
                    shared.worker_cv.notify_all();
                    return;
                }
                if !st.queue.is_empty() || !st.acceptance.is_empty() {
                    break;
                }
                st.sleeping += 1;
                st = shared.worker_cv.wait(st).unwrap();
                st.sleeping -= 1;
            }

            let before = (st.queue.is_empty(), st.queue.is_full());
            while batch.len() < drain_limit {
                let job = match shared.config.scheduling {
                    Scheduling::Fifo => st.queue.pop_front(),
                    Scheduling::Lifo => st.queue.pop_back(),
                };
                if let Some(job) = job {
                    batch.push(job);
                    continue;
                }
                match pop_acceptance(&shared, &mut st) {
                    Popped::Job(job) => batch.push(job),
                    Popped::Expired(job) => expired.push(job),
                    Popped::None => break,
                }
            }
            promote(&shared, &mut st, &mut expired);
            let after = (st.queue.is_empty(), st.queue.is_full());
            queue_edges(before, after, &mut transitions);

            if !batch.is_empty() {
                shared.in_flight.fetch_add(batch.len(), Ordering::AcqRel);
            }
        }

        deliver_transitions(&shared, &transitions);
        for job in expired {
            expire_job(&shared, job);
        }

        let ran = batch.len();
        for job in batch {
            execute(&shared, job);
        }

        if ran > 0 {
            shared.in_flight.fetch_sub(ran, Ordering::AcqRel);
        }

        // Fast path: no second lock acquisition unless a shutdown drain may
        // be waiting on quiescence.
        if shared.shutting_down.load(Ordering::Acquire) {
            let st = shared.state.lock().unwrap();
            let quiescent =
                shared.in_flight.load(Ordering::Acquire) == 0 && st.queue.is_empty();
            drop(st);
            if quiescent {
                shared.worker_cv.notify_all();
            }
        }
    }
}

pub(crate) fn deadline_main(shared: Arc<PoolShared>) {
    let mut st = shared.state.lock().unwrap();
    loop {
        if st.shutdown {
            return;
        }

        let next = st
            .acceptance
            .iter()
            .filter_map(|entry| match (&entry.job, entry.deadline) {
                (Some(job), Some(when)) if job.ctx.is_pending() => Some(when),
                _ => None,
            })
            .min();

        match next {
            None => {
                st = shared.deadline_cv.wait(st).unwrap();
            }
            Some(when) => {
                let now = Instant::now();
                if when <= now {
                    let mut expired = Vec::new();
                    for entry in st.acceptance.iter_mut() {
                        let due = matches!(entry.deadline, Some(when) if when <= now);
                        if due {
                            // Taking the job marks the slot resumed; the
                            // ring position is reclaimed by a later dequeue.
                            if let Some(job) = entry.job.take() {
                                if job.ctx.is_pending() {
                                    expired.push(job);
                                }
                            }
                        }
                    }
                    drop(st);
                    for job in expired {
                        expire_job(&shared, job);
                    }
                    st = shared.state.lock().unwrap();
                } else {
                    let (guard, _) = shared.deadline_cv.wait_timeout(st, when - now).unwrap();
                    st = guard;
                }
            }
        }
    }
}
