use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;

use relay_io::driver::fake;
use relay_io::{
    ArmOutcome, BeginOutcome, EventFlags, FakeHandle, Interest, LeafError, Selector, SelectorError,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fake_selector() -> (Selector, FakeHandle) {
    let (driver, handle) = fake::pair();
    let selector = Selector::make(Box::new(driver)).unwrap();
    (selector, handle)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn register_arm_receive_event() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    assert!(fake.is_registered(id));

    let injector = {
        let fake = fake.clone();
        thread::spawn(move || {
            wait_until(|| fake.is_armed(id, Interest::readable()));
            fake.ready(id, Interest::readable(), EventFlags::empty());
        })
    };

    match block_on(selector.arm(token, Interest::readable(), None)) {
        ArmOutcome::Ready { token, event } => {
            assert_eq!(event.id(), id);
            assert_eq!(event.readiness(), Interest::readable());
            assert!(event.flags().is_empty());
            let _ = block_on(selector.deregister(token));
        }
        _ => panic!("expected readiness"),
    }

    injector.join().unwrap();
    assert!(!fake.is_registered(id));
    selector.shutdown();
}

#[test]
fn arm_deadline_times_out() {
    init_logs();
    let (selector, _fake) = fake_selector();

    let (_, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let started = Instant::now();
    let deadline = started + Duration::from_millis(50);

    match block_on(selector.arm(token, Interest::readable(), Some(deadline))) {
        ArmOutcome::Incomplete { error, .. } => assert_eq!(error, SelectorError::Timeout),
        _ => panic!("expected a timeout"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4));

    selector.shutdown();
}

#[test]
fn event_wins_over_timeout() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let injector = {
        let fake = fake.clone();
        thread::spawn(move || {
            wait_until(|| fake.is_armed(id, Interest::readable()));
            fake.ready(id, Interest::readable(), EventFlags::empty());
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    match block_on(selector.arm(token, Interest::readable(), Some(deadline))) {
        ArmOutcome::Ready { .. } => {}
        _ => panic!("the event must win"),
    }

    injector.join().unwrap();
    selector.shutdown();
}

#[test]
fn permit_satisfies_next_arm_and_rearms_kernel() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id, token) = block_on(selector.register(3, Interest::readable())).unwrap();

    // Arm with a short deadline and let it lapse; the kernel filter stays
    // armed with nobody waiting.
    let deadline = Instant::now() + Duration::from_millis(30);
    let token = match block_on(selector.arm(token, Interest::readable(), Some(deadline))) {
        ArmOutcome::Incomplete { token, error } => {
            assert_eq!(error, SelectorError::Timeout);
            token
        }
        _ => panic!("expected a timeout"),
    };
    assert_eq!(fake.arm_count(id, Interest::readable()), 1);

    // Readiness with no waiter becomes a permit.
    fake.ready(id, Interest::readable(), EventFlags::empty());
    wait_until(|| selector.depths().permits == 1);

    // The next arm completes synchronously from the permit, and a fresh
    // kernel arm is still issued so the following edge is observable.
    match block_on(selector.arm(token, Interest::readable(), None)) {
        ArmOutcome::Ready { event, .. } => {
            assert_eq!(event.readiness(), Interest::readable());
        }
        _ => panic!("expected the cached permit"),
    }
    assert_eq!(selector.depths().permits, 0);
    wait_until(|| fake.arm_count(id, Interest::readable()) == 2);

    selector.shutdown();
}

#[test]
fn two_phase_event_between_begin_and_await() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let (token, handle) = match selector.begin(token, Interest::readable()) {
        BeginOutcome::Pending { token, handle } => (token, handle),
        _ => panic!("no permit yet"),
    };

    // The event lands before the continuation is installed: the waiter
    // becomes a permit and the in-flight handle goes stale.
    wait_until(|| fake.is_armed(id, Interest::readable()));
    fake.ready(id, Interest::readable(), EventFlags::empty());
    wait_until(|| selector.depths().permits == 1);

    assert!(matches!(
        block_on(selector.await_arm(handle, None)),
        Err(SelectorError::Cancelled)
    ));

    // Phase one consumes the cached permit.
    match selector.begin(token, Interest::readable()) {
        BeginOutcome::Ready { token, .. } => {
            let _ = block_on(selector.deregister(token));
        }
        _ => panic!("expected the permit"),
    }

    selector.shutdown();
}

#[test]
fn two_phase_await_receives_event() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let (_token, handle) = match selector.begin(token, Interest::readable()) {
        BeginOutcome::Pending { token, handle } => (token, handle),
        _ => panic!("no permit yet"),
    };

    let waiter = {
        let selector = selector.clone();
        thread::spawn(move || block_on(selector.await_arm(handle, None)))
    };

    thread::sleep(Duration::from_millis(50));
    fake.ready(id, Interest::readable(), EventFlags::empty());

    let event = waiter.join().unwrap().unwrap();
    assert_eq!(event.id(), id);
    selector.shutdown();
}

#[test]
fn arm_two_waits_both_kinds() {
    init_logs();
    let (selector, fake) = fake_selector();

    let (id_r, token_r) = block_on(selector.register(3, Interest::readable())).unwrap();
    let (id_w, token_w) = block_on(selector.register(4, Interest::writable())).unwrap();

    let injector = {
        let fake = fake.clone();
        thread::spawn(move || {
            wait_until(|| {
                fake.is_armed(id_r, Interest::readable()) && fake.is_armed(id_w, Interest::writable())
            });
            fake.ready(id_r, Interest::readable(), EventFlags::empty());
            fake.ready(id_w, Interest::writable(), EventFlags::empty());
        })
    };

    let (first, second) = block_on(selector.arm_two(
        (token_r, Interest::readable(), None),
        (token_w, Interest::writable(), None),
    ));
    assert!(matches!(first, ArmOutcome::Ready { .. }));
    assert!(matches!(second, ArmOutcome::Ready { .. }));

    injector.join().unwrap();
    selector.shutdown();
}

#[test]
fn deregister_drains_waiters() {
    init_logs();
    let (selector, _fake) = fake_selector();

    let (_, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let (token, handle) = match selector.begin(token, Interest::readable()) {
        BeginOutcome::Pending { token, handle } => (token, handle),
        _ => panic!("no permit yet"),
    };

    let waiter = {
        let selector = selector.clone();
        thread::spawn(move || block_on(selector.await_arm(handle, None)))
    };
    thread::sleep(Duration::from_millis(50));

    block_on(selector.deregister(token)).unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(
        result,
        Err(SelectorError::Os(LeafError::Deregistered)) | Err(SelectorError::Cancelled)
    ));

    let depths = selector.depths();
    assert_eq!(depths.waiters, 0);
    assert_eq!(depths.registrations, 0);
    selector.shutdown();
}

#[test]
fn deregister_then_register_yields_fresh_id() {
    init_logs();
    let (selector, _fake) = fake_selector();

    let (first, token) = block_on(selector.register(5, Interest::readable())).unwrap();
    block_on(selector.deregister(token)).unwrap();
    let (second, token) = block_on(selector.register(5, Interest::readable())).unwrap();
    assert_ne!(first, second);

    block_on(selector.deregister(token)).unwrap();
    selector.shutdown();
}

#[test]
fn shutdown_quiesces_and_rejects() {
    init_logs();
    let (selector, _fake) = fake_selector();

    let (_, token_a) = block_on(selector.register(3, Interest::readable())).unwrap();
    let (_, token_b) = block_on(selector.register(4, Interest::readable())).unwrap();

    // One armed waiter parked on another thread.
    let parked = {
        let selector = selector.clone();
        thread::spawn(move || block_on(selector.arm(token_a, Interest::readable(), None)))
    };
    wait_until(|| selector.depths().waiters == 1);

    selector.shutdown();
    selector.shutdown();

    match parked.join().unwrap() {
        ArmOutcome::Incomplete { error, .. } => assert_eq!(error, SelectorError::Shutdown),
        _ => panic!("the parked arm must be drained with Shutdown"),
    }

    let depths = selector.depths();
    assert_eq!(depths.registrations, 0);
    assert_eq!(depths.waiters, 0);
    assert_eq!(depths.permits, 0);
    assert_eq!(depths.pending_replies, 0);
    assert_eq!(depths.deadlines, 0);

    assert!(matches!(
        block_on(selector.register(9, Interest::readable())),
        Err(SelectorError::Shutdown)
    ));
    match selector.begin(token_b, Interest::readable()) {
        BeginOutcome::Rejected { error, .. } => assert_eq!(error, SelectorError::Shutdown),
        _ => panic!("begin must be rejected after shutdown"),
    }
}

#[test]
fn concurrent_shutdown_callers_both_return() {
    init_logs();
    let (selector, _fake) = fake_selector();

    let (_, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    let parked = {
        let selector = selector.clone();
        thread::spawn(move || block_on(selector.arm(token, Interest::readable(), None)))
    };
    wait_until(|| selector.depths().waiters == 1);

    // Both callers race the lifecycle transition; the loser must park
    // until the winner finishes joining, then return.
    let racer = {
        let selector = selector.clone();
        thread::spawn(move || selector.shutdown())
    };
    selector.shutdown();
    racer.join().unwrap();

    match parked.join().unwrap() {
        ArmOutcome::Incomplete { error, .. } => assert_eq!(error, SelectorError::Shutdown),
        _ => panic!("the parked arm must be drained with Shutdown"),
    }
    assert_eq!(selector.depths().waiters, 0);
}

#[test]
fn rejects_invalid_arguments() {
    init_logs();
    let (selector, _fake) = fake_selector();

    assert!(matches!(
        block_on(selector.register(-1, Interest::readable())),
        Err(SelectorError::Os(LeafError::InvalidDescriptor))
    ));
    assert!(matches!(
        block_on(selector.register(3, Interest::priority())),
        Err(SelectorError::Os(LeafError::InvalidInterest))
    ));

    let (_, token) = block_on(selector.register(3, Interest::readable())).unwrap();
    match block_on(selector.arm(token, Interest::readable() | Interest::writable(), None)) {
        ArmOutcome::Rejected { error, .. } => {
            assert_eq!(error, SelectorError::Os(LeafError::InvalidInterest));
        }
        _ => panic!("multi-kind arms are rejected"),
    }

    selector.shutdown();
}

#[cfg(unix)]
mod kernel {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn arm_then_event_on_a_real_socket() {
        init_logs();
        let selector = Selector::new().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();

        let (id, token) =
            block_on(selector.register(ours.as_raw_fd(), Interest::readable())).unwrap();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            (&theirs).write_all(&[1]).unwrap();
            theirs
        });

        match block_on(selector.arm(token, Interest::readable(), None)) {
            ArmOutcome::Ready { token, event } => {
                assert_eq!(event.id(), id);
                assert!(event.readiness().is_readable());
                assert!(!event.flags().is_error());
                let _ = block_on(selector.deregister(token));
            }
            _ => panic!("expected readiness from the kernel"),
        }

        let _theirs = writer.join().unwrap();
        selector.shutdown();
    }
}
