//! Deterministic in-memory driver for tests.
//!
//! Injected readiness is delivered only for keys that are currently armed,
//! mirroring the one-shot kernel contract: delivery disarms the key, and
//! readiness injected while a key is unarmed stays pending until the next
//! arm.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};

use crate::error::LeafError;
use crate::event::{Event, EventFlags};
use crate::interest::Interest;

use super::{Capabilities, Driver, WakeHandle};

struct CoreState {
    registered: IndexMap<u64, Interest>,
    armed: IndexSet<(u64, Interest)>,
    pending: Vec<Event>,
    arm_log: Vec<(u64, Interest)>,
    wake: bool,
}

struct Core {
    state: Mutex<CoreState>,
    cv: Condvar,
}

pub struct FakeDriver {
    core: Arc<Core>,
}

/// Test-side handle: injects readiness and observes driver state.
#[derive(Clone)]
pub struct FakeHandle {
    core: Arc<Core>,
}

/// Builds a connected driver/handle pair.
pub fn pair() -> (FakeDriver, FakeHandle) {
    let core = Arc::new(Core {
        state: Mutex::new(CoreState {
            registered: IndexMap::new(),
            armed: IndexSet::new(),
            pending: Vec::new(),
            arm_log: Vec::new(),
            wake: false,
        }),
        cv: Condvar::new(),
    });

    (
        FakeDriver { core: core.clone() },
        FakeHandle { core },
    )
}

impl FakeHandle {
    /// Injects readiness for `id`. Delivered by the next poll once the
    /// matching key is armed.
    pub fn ready(&self, id: u64, interest: Interest, flags: EventFlags) {
        let mut st = self.core.state.lock().unwrap();
        st.pending.push(Event::new(id, interest, flags));
        drop(st);
        self.core.cv.notify_all();
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.core.state.lock().unwrap().registered.contains_key(&id)
    }

    pub fn is_armed(&self, id: u64, interest: Interest) -> bool {
        self.core.state.lock().unwrap().armed.contains(&(id, interest))
    }

    /// How many times `(id, interest)` has been armed so far.
    pub fn arm_count(&self, id: u64, interest: Interest) -> usize {
        self.core
            .state
            .lock()
            .unwrap()
            .arm_log
            .iter()
            .filter(|entry| **entry == (id, interest))
            .count()
    }
}

impl Driver for FakeDriver {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_events: 64,
            edge_triggered: true,
            completion_based: false,
        }
    }

    fn register(&mut self, id: u64, fd: RawFd, interest: Interest) -> Result<(), LeafError> {
        if fd < 0 {
            return Err(LeafError::InvalidDescriptor);
        }
        let mut st = self.core.state.lock().unwrap();
        st.registered.insert(id, interest);
        Ok(())
    }

    fn modify(&mut self, id: u64, interest: Interest) -> Result<(), LeafError> {
        let mut st = self.core.state.lock().unwrap();
        match st.registered.get_mut(&id) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(LeafError::NotRegistered),
        }
    }

    fn deregister(&mut self, id: u64) -> Result<(), LeafError> {
        let mut st = self.core.state.lock().unwrap();
        st.registered.swap_remove(&id);
        st.armed.retain(|(key, _)| *key != id);
        st.pending.retain(|ev| ev.id() != id);
        Ok(())
    }

    fn arm(&mut self, id: u64, interest: Interest) -> Result<(), LeafError> {
        let mut st = self.core.state.lock().unwrap();
        if !st.registered.contains_key(&id) {
            return Err(LeafError::NotRegistered);
        }
        st.armed.insert((id, interest));
        st.arm_log.push((id, interest));
        drop(st);
        // Pending readiness may now be deliverable.
        self.core.cv.notify_all();
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> Result<usize, LeafError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.core.state.lock().unwrap();

        loop {
            let mut delivered = 0;
            let mut i = 0;
            while i < st.pending.len() {
                let ev = st.pending[i];
                let mut remaining = ev.readiness();
                for kind in ev.readiness().kinds() {
                    if st.armed.swap_remove(&(ev.id(), kind)) {
                        out.push(Event::new(ev.id(), kind, ev.flags()));
                        remaining.remove(kind);
                        delivered += 1;
                    }
                }
                if remaining.is_empty() {
                    st.pending.remove(i);
                } else {
                    st.pending[i] = Event::new(ev.id(), remaining, ev.flags());
                    i += 1;
                }
            }

            if delivered > 0 {
                return Ok(delivered);
            }
            if st.wake {
                st.wake = false;
                return Ok(0);
            }

            match deadline {
                None => {
                    st = self.core.cv.wait(st).unwrap();
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(0);
                    }
                    let (guard, _) = self.core.cv.wait_timeout(st, d - now).unwrap();
                    st = guard;
                }
            }
        }
    }

    fn wake_handle(&self) -> Result<Box<dyn WakeHandle>, LeafError> {
        Ok(Box::new(FakeWake {
            core: self.core.clone(),
        }))
    }
}

struct FakeWake {
    core: Arc<Core>,
}

impl WakeHandle for FakeWake {
    fn wake(&self) -> Result<(), LeafError> {
        let mut st = self.core.state.lock().unwrap();
        st.wake = true;
        drop(st);
        self.core.cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn readiness_waits_for_arm() {
        let (mut driver, handle) = pair();
        driver.register(1, 10, Interest::readable()).unwrap();
        handle.ready(1, Interest::readable(), EventFlags::empty());

        let mut out = Vec::new();
        let n = driver
            .poll(Some(Duration::from_millis(10)), &mut out)
            .unwrap();
        assert_eq!(n, 0);

        driver.arm(1, Interest::readable()).unwrap();
        let n = driver.poll(None, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].id(), 1);
        assert_eq!(out[0].readiness(), Interest::readable());
    }

    #[test]
    fn delivery_disarms() {
        let (mut driver, handle) = pair();
        driver.register(1, 10, Interest::readable()).unwrap();
        driver.arm(1, Interest::readable()).unwrap();
        handle.ready(1, Interest::readable(), EventFlags::empty());

        let mut out = Vec::new();
        driver.poll(None, &mut out).unwrap();
        assert!(!handle.is_armed(1, Interest::readable()));

        // A second edge without re-arming stays pending.
        handle.ready(1, Interest::readable(), EventFlags::empty());
        out.clear();
        let n = driver
            .poll(Some(Duration::from_millis(10)), &mut out)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn wake_interrupts_poll() {
        let (mut driver, _handle) = pair();
        let wake = driver.wake_handle().unwrap();
        wake.wake().unwrap();

        let mut out = Vec::new();
        let n = driver.poll(None, &mut out).unwrap();
        assert_eq!(n, 0);
    }
}
