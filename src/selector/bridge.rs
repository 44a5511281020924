use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Single-consumer FIFO between the poll thread and the dispatch thread.
///
/// Producers never block; the consumer parks on the condvar when empty.
/// `close` flushes the backlog and makes the outstanding and every future
/// `next` return `None`. Notification happens after the lock is released.
pub(crate) struct Bridge<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> Bridge<T> {
    pub fn new() -> Bridge<T> {
        Bridge {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Returns false when the bridge is closed; the value is dropped.
    pub fn push(&self, value: T) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            inner.queue.push_back(value);
        }
        self.cv.notify_one();
        true
    }

    /// Blocks until a value arrives or the bridge closes.
    pub fn next(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(value) = inner.queue.pop_front() {
                return Some(value);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    pub fn try_next(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            None
        } else {
            inner.queue.pop_front()
        }
    }

    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            inner.queue.clear();
        }
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::Bridge;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_next() {
        let bridge = Bridge::new();
        assert!(bridge.push(5));
        assert_eq!(bridge.next(), Some(5));
        assert_eq!(bridge.try_next(), None);
    }

    #[test]
    fn next_blocks_until_push() {
        let bridge = Arc::new(Bridge::new());
        let producer = bridge.clone();
        let handle = thread::spawn(move || {
            producer.push(42);
        });

        assert_eq!(bridge.next(), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn close_releases_consumer() {
        let bridge: Arc<Bridge<i32>> = Arc::new(Bridge::new());
        let closer = bridge.clone();
        let handle = thread::spawn(move || {
            closer.close();
        });

        assert_eq!(bridge.next(), None);
        handle.join().unwrap();

        assert!(!bridge.push(1));
        assert_eq!(bridge.next(), None);
    }
}
