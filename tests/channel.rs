#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;

use relay_io::{Channel, ChannelError, Interest, Selector};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wired_channel() -> (Selector, Channel, UnixStream) {
    let selector = Selector::new().unwrap();
    let (ours, theirs) = UnixStream::pair().unwrap();
    let channel = block_on(Channel::wrap(
        ours.into_raw_fd(),
        &selector,
        Interest::readable() | Interest::writable(),
    ))
    .unwrap();
    (selector, channel, theirs)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn read_suspends_until_data_arrives() {
    init_logs();
    let (selector, mut channel, theirs) = wired_channel();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        (&theirs).write_all(b"ping").unwrap();
        theirs
    });

    let mut buf = [0u8; 16];
    let n = block_on(channel.read(&mut buf)).unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Peer close surfaces as EOF, and EOF is sticky.
    let theirs = writer.join().unwrap();
    drop(theirs);
    assert_eq!(block_on(channel.read(&mut buf)).unwrap(), 0);
    assert_eq!(block_on(channel.read(&mut buf)).unwrap(), 0);

    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn zero_length_buffers_are_noops() {
    init_logs();
    let (selector, mut channel, _theirs) = wired_channel();

    let mut empty: [u8; 0] = [];
    assert_eq!(block_on(channel.read(&mut empty)).unwrap(), 0);
    assert_eq!(block_on(channel.write(&[])).unwrap(), 0);

    // The zero-length read did not consume the EOF state machine: a real
    // read still works afterwards.
    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn write_backpressure_resolves_when_peer_drains() {
    init_logs();
    let (selector, mut channel, theirs) = wired_channel();

    const TOTAL: usize = 1 << 20;
    let reader = thread::spawn(move || {
        thread::sleep(Duration::from_millis(40));
        let mut sunk = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while sunk < TOTAL {
            sunk += (&theirs).read(&mut buf).unwrap();
        }
        sunk
    });

    let chunk = vec![7u8; 64 * 1024];
    let mut sent = 0usize;
    while sent < TOTAL {
        let n = block_on(channel.write(&chunk[..chunk.len().min(TOTAL - sent)])).unwrap();
        assert!(n > 0);
        sent += n;
    }

    assert_eq!(reader.join().unwrap(), TOTAL);
    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn shutdown_write_is_idempotent() {
    init_logs();
    let (selector, mut channel, theirs) = wired_channel();

    channel.shutdown_write().unwrap();
    channel.shutdown_write().unwrap();

    assert!(matches!(
        block_on(channel.write(b"x")),
        Err(ChannelError::WriteClosed)
    ));

    // The peer observes the half-close as EOF.
    let mut buf = [0u8; 4];
    assert_eq!((&theirs).read(&mut buf).unwrap(), 0);

    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn shutdown_read_is_idempotent() {
    init_logs();
    let (selector, mut channel, theirs) = wired_channel();

    channel.shutdown_read().unwrap();
    channel.shutdown_read().unwrap();

    // Reads report EOF without touching the descriptor.
    let mut buf = [0u8; 4];
    assert_eq!(block_on(channel.read(&mut buf)).unwrap(), 0);

    drop(theirs);
    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn healthy_socket_has_no_pending_error() {
    init_logs();
    let (selector, channel, _theirs) = wired_channel();

    assert!(channel.take_error().unwrap().is_none());

    block_on(channel.close()).unwrap();
    selector.shutdown();
}

#[test]
fn dropping_a_channel_deregisters_it() {
    init_logs();
    let (selector, channel, _theirs) = wired_channel();
    assert_eq!(selector.depths().registrations, 1);

    drop(channel);
    wait_until(|| selector.depths().registrations == 0);

    selector.shutdown();
}
