use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;

use relay_io::{Backpressure, LaneError, Pool, PoolConfig, QueueTransition, Scheduling};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tiny_pool(backpressure: Backpressure) -> Pool {
    Pool::new(PoolConfig {
        workers: 1,
        queue_limit: 1,
        acceptance_limit: 4,
        backpressure,
        ..PoolConfig::default()
    })
}

/// Submits an operation that parks the single worker until released and
/// confirms it started.
fn occupy_worker(pool: &Pool) -> (relay_io::JobHandle<usize>, mpsc::Sender<()>) {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let handle = pool.submit(None, move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        0usize
    });
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker never started the gating job");
    (handle, release_tx)
}

#[test]
fn backpressure_wait_then_promote() {
    init_logs();
    let pool = tiny_pool(Backpressure::Wait);
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    let c = pool.submit(None, || 2usize);
    let d = pool.submit(None, || 3usize);

    let snapshot = pool.metrics();
    assert_eq!(snapshot.queue_depth, 1);
    assert_eq!(snapshot.acceptance_depth, 2);
    assert_eq!(snapshot.executing, 1);

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    assert_eq!(block_on(b).unwrap(), 1);
    assert_eq!(block_on(c).unwrap(), 2);
    assert_eq!(block_on(d).unwrap(), 3);

    pool.shutdown();
    let snapshot = pool.metrics();
    assert_eq!(snapshot.promoted, 2);
    assert_eq!(snapshot.completed, 4);
    assert_eq!(snapshot.queue_depth, 0);
    assert_eq!(snapshot.acceptance_depth, 0);
    assert_eq!(snapshot.executing, 0);
    assert!(snapshot.acceptance_wait.count >= 2);
    assert!(snapshot.execution.count >= 4);
}

#[test]
fn fail_fast_overflow() {
    init_logs();
    let pool = tiny_pool(Backpressure::FailFast);
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    let c = pool.submit(None, || 2usize);
    assert!(matches!(block_on(c), Err(LaneError::QueueFull)));

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    assert_eq!(block_on(b).unwrap(), 1);

    pool.shutdown();
    let snapshot = pool.metrics();
    assert_eq!(snapshot.fail_fast, 1);
    // The rejected submission never reached a worker.
    assert_eq!(snapshot.started, 2);
}

#[test]
fn acceptance_ring_overflow_is_overloaded() {
    init_logs();
    let pool = Pool::new(PoolConfig {
        workers: 1,
        queue_limit: 1,
        acceptance_limit: 1,
        backpressure: Backpressure::Wait,
        ..PoolConfig::default()
    });
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    let c = pool.submit(None, || 2usize);
    let d = pool.submit(None, || 3usize);
    assert!(matches!(block_on(d), Err(LaneError::Overloaded)));

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    assert_eq!(block_on(b).unwrap(), 1);
    assert_eq!(block_on(c).unwrap(), 2);

    pool.shutdown();
    assert_eq!(pool.metrics().overloaded, 1);
}

#[test]
fn acceptance_deadline_times_out() {
    init_logs();
    let pool = tiny_pool(Backpressure::Wait);
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    let deadline = Instant::now() + Duration::from_millis(50);
    let c = pool.submit(Some(deadline), || 2usize);

    let started = Instant::now();
    assert!(matches!(block_on(c), Err(LaneError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(2));

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    assert_eq!(block_on(b).unwrap(), 1);

    pool.shutdown();
    assert_eq!(pool.metrics().acceptance_timeouts, 1);
}

#[test]
fn cancel_resumes_caller_while_op_finishes() {
    init_logs();
    let pool = Pool::new(PoolConfig {
        workers: 1,
        queue_limit: 4,
        ..PoolConfig::default()
    });

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let a = pool.submit(None, move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        done_tx.send(()).unwrap();
        7usize
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let canceller = a.canceller();
    assert!(canceller.cancel());
    // Second cancel does not resume again.
    assert!(!canceller.cancel());

    let resumed_at = Instant::now();
    assert!(matches!(block_on(a), Err(LaneError::Cancelled)));
    assert!(resumed_at.elapsed() < Duration::from_millis(500));

    // The operation still runs to completion on its worker and the orphan
    // result is discarded.
    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    pool.shutdown();
    assert_eq!(pool.metrics().cancelled, 1);
}

#[test]
fn dropping_handle_cancels() {
    init_logs();
    let pool = tiny_pool(Backpressure::Wait);
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    drop(b);

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    pool.shutdown();
    assert_eq!(pool.metrics().cancelled, 1);
}

#[test]
fn shutdown_is_idempotent_and_rejects_new_work() {
    init_logs();
    let pool = Pool::new(PoolConfig {
        workers: 2,
        ..PoolConfig::default()
    });
    assert_eq!(block_on(pool.run(None, || 11usize)).unwrap(), 11);

    pool.shutdown();
    pool.shutdown();

    let rejected = pool.submit(None, || 0usize);
    assert!(matches!(block_on(rejected), Err(LaneError::Shutdown)));
}

#[test]
fn shutdown_fails_acceptance_waiters() {
    init_logs();
    let pool = Arc::new(tiny_pool(Backpressure::Wait));
    let (a, release) = occupy_worker(&pool);

    let b = pool.submit(None, || 1usize);
    let c = pool.submit(None, || 2usize);

    let shutter = {
        let pool = pool.clone();
        thread::spawn(move || pool.shutdown())
    };

    // The acceptance ring is drained immediately, even while the worker is
    // still busy.
    assert!(matches!(block_on(c), Err(LaneError::Shutdown)));

    release.send(()).unwrap();
    assert_eq!(block_on(a).unwrap(), 0);
    assert_eq!(block_on(b).unwrap(), 1);
    shutter.join().unwrap();
}

#[test]
fn lifo_runs_newest_first() {
    init_logs();
    let order = Arc::new(Mutex::new(Vec::new()));
    let pool = Pool::new(PoolConfig {
        workers: 1,
        queue_limit: 8,
        scheduling: Scheduling::Lifo,
        ..PoolConfig::default()
    });
    let (a, release) = occupy_worker(&pool);

    let mut handles = Vec::new();
    for label in ["b", "c", "d"] {
        let order = order.clone();
        handles.push(pool.submit(None, move || {
            order.lock().unwrap().push(label);
            label
        }));
    }

    release.send(()).unwrap();
    for handle in handles {
        block_on(handle).unwrap();
    }
    block_on(a).unwrap();
    pool.shutdown();

    assert_eq!(*order.lock().unwrap(), vec!["d", "c", "b"]);
}

#[test]
fn queue_transitions_fire_on_edges() {
    init_logs();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pool = Pool::new(PoolConfig {
        workers: 1,
        queue_limit: 1,
        on_transition: Some(Arc::new(move |transition| {
            sink.lock().unwrap().push(transition);
        })),
        ..PoolConfig::default()
    });

    assert_eq!(block_on(pool.run(None, || 1usize)).unwrap(), 1);
    pool.shutdown();

    let seen = seen.lock().unwrap();
    assert!(seen.contains(&QueueTransition::BecameNonEmpty));
    assert!(seen.contains(&QueueTransition::BecameSaturated));
    assert!(seen.contains(&QueueTransition::BecameEmpty));
    assert!(seen.contains(&QueueTransition::BecameNotSaturated));
}

#[test]
fn panicking_operation_fails_typed() {
    init_logs();
    let pool = Pool::new(PoolConfig {
        workers: 1,
        ..PoolConfig::default()
    });

    let handle = pool.submit(None, || -> usize { panic!("deliberate") });
    assert!(matches!(block_on(handle), Err(LaneError::Invariant(_))));

    // The worker survives the panic.
    assert_eq!(block_on(pool.run(None, || 5usize)).unwrap(), 5);
    pool.shutdown();
}

#[test]
fn tickets_are_monotonic() {
    init_logs();
    let pool = Pool::new(PoolConfig::default());
    let a = pool.submit(None, || 0usize);
    let b = pool.submit(None, || 0usize);
    assert!(b.ticket() > a.ticket());
    block_on(a).unwrap();
    block_on(b).unwrap();
    pool.shutdown();
}
