//! Completion marker with a strictly-monotone timestamp.
//!
//! Grounded on `original_source/src/rt/stream/{include,src}/stream.{hpp,cpp}`:
//! an `Event` is a cheap, cloneable handle over a shared, mutex-protected
//! inner record (signaled flag + timestamp) with an associated condvar.
//! `elapsed_ns` locks the pair of events in pointer-address order to avoid
//! deadlock when two threads compute `elapsed_ns(a, b)` and `elapsed_ns(b, a)`
//! concurrently.

use std::sync::{Arc, Condvar, Mutex};

use super::telemetry::now_ns;

struct Inner {
    signaled: bool,
    timestamp_ns: u64,
}

/// A shared-handle completion marker. Cloning an `Event` yields another
/// handle over the same underlying state; signaling any clone signals all.
#[derive(Clone)]
pub struct Event {
    state: Arc<(Mutex<Inner>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(Inner {
                    signaled: false,
                    timestamp_ns: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Identity of the underlying shared state, used to establish a stable
    /// lock order between two events.
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.state) as usize
    }

    /// Mark this event (and every clone of it) as complete "now".
    pub fn signal(&self) {
        let (lock, cvar) = &*self.state;
        let mut inner = lock.lock().unwrap();
        inner.signaled = true;
        inner.timestamp_ns = now_ns();
        cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.state.0.lock().unwrap().signaled
    }

    /// Block the calling thread until this event is signaled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut inner = lock.lock().unwrap();
        while !inner.signaled {
            inner = cvar.wait(inner).unwrap();
        }
    }

    /// Nanoseconds between two completed events, or `0` if either is
    /// incomplete. Locks `self` and `other` in pointer-address order so two
    /// threads racing `elapsed_ns(a, b)` / `elapsed_ns(b, a)` never deadlock.
    pub fn elapsed_ns(&self, other: &Event) -> u64 {
        if Arc::ptr_eq(&self.state, &other.state) {
            return 0;
        }
        let self_first = self.addr() < other.addr();
        let (first, second) = if self_first { (self, other) } else { (other, self) };
        let first_guard = first.state.0.lock().unwrap();
        let second_guard = second.state.0.lock().unwrap();

        let (start, end) = if self_first {
            (&*first_guard, &*second_guard)
        } else {
            (&*second_guard, &*first_guard)
        };

        if !start.signaled || !end.signaled {
            return 0;
        }
        end.timestamp_ns.saturating_sub(start.timestamp_ns)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_signal_state() {
        let e = Event::new();
        let clone = e.clone();
        assert!(!clone.is_complete());
        e.signal();
        assert!(clone.is_complete());
    }

    #[test]
    fn elapsed_ns_nonnegative_after_both_signaled() {
        let a = Event::new();
        let b = Event::new();
        a.signal();
        std::thread::sleep(std::time::Duration::from_micros(10));
        b.signal();
        assert!(a.elapsed_ns(&b) > 0 || b.elapsed_ns(&a) > 0);
    }

    #[test]
    fn elapsed_ns_zero_when_incomplete() {
        let a = Event::new();
        let b = Event::new();
        a.signal();
        assert_eq!(a.elapsed_ns(&b), 0);
    }

    #[test]
    fn wait_unblocks_after_signal() {
        let e = Event::new();
        let waiter = e.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait();
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        e.signal();
        handle.join().unwrap();
    }
}
