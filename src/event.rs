//! Blocking signal primitives used where a caller is allowed to wait.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A manual-reset event.
///
/// Once signalled it stays signalled until [`Event::reset`] is called; every waiter wakes.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create an unsignalled event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking every waiter.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_all();
    }

    /// Return the event to the unsignalled state.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Returns `true` if the event is currently signalled.
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock()
    }

    /// Wait until the event is signalled or `timeout` elapses.
    ///
    /// Returns `true` if the event was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }
}

/// A value delivered exactly once from a completion path to a blocked caller.
///
/// The first [`OneShot::set`] wins; later calls are ignored and return `false`, so two racing
/// completion paths (e.g. reply and reject) can both try without double delivery.
#[derive(Debug)]
pub struct OneShot<T> {
    slot: Mutex<OneShotState<T>>,
    cond: Condvar,
}

#[derive(Debug)]
enum OneShotState<T> {
    Empty,
    Ready(T),
    Taken,
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        OneShot {
            slot: Mutex::new(OneShotState::Empty),
            cond: Condvar::new(),
        }
    }
}

impl<T> OneShot<T> {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `value`. Returns `false` if a value was already delivered.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            OneShotState::Empty => {
                *slot = OneShotState::Ready(value);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Returns `true` once a value has been delivered, taken or not.
    pub fn is_set(&self) -> bool {
        !matches!(*self.slot.lock(), OneShotState::Empty)
    }

    /// Wait for the value for up to `timeout` and take it.
    ///
    /// Returns `None` on timeout, or if another waiter already took the value.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, OneShotState::Taken) {
                OneShotState::Ready(value) => return Some(value),
                OneShotState::Taken => return None,
                OneShotState::Empty => {
                    *slot = OneShotState::Empty;
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        if let OneShotState::Ready(_) = &*slot {
                            continue;
                        }
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn event_wakes_waiter() {
        let ev = Arc::new(Event::new());
        let ev2 = ev.clone();
        let t = thread::spawn(move || ev2.wait_timeout(Duration::from_secs(5)));
        ev.signal();
        assert!(t.join().unwrap());
        assert!(ev.is_signalled());
        ev.reset();
        assert!(!ev.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn oneshot_first_set_wins() {
        let slot = OneShot::new();
        assert!(slot.set(1));
        assert!(!slot.set(2));
        assert_eq!(slot.wait_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(slot.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn oneshot_times_out() {
        let slot: OneShot<u32> = OneShot::new();
        assert_eq!(slot.wait_timeout(Duration::from_millis(5)), None);
        assert!(!slot.is_set());
    }
}
