//! Lightweight counters and timers used by the stream worker and dispatcher.
//!
//! Grounded on `original_source/src/rt/telemetry/{include,src}` — a
//! monotone-clock helper, an atomic `Counter`, and a scope-guard timer that
//! adds its elapsed nanoseconds into a `Counter` on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanoseconds since an arbitrary fixed epoch (process start), monotone.
///
/// The reference implementation uses `std::chrono::steady_clock`; Rust's
/// `Instant` is the equivalent monotone clock. Callers only ever compare
/// two `now_ns()` values, never interpret the value as wall-clock time.
pub fn now_ns() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// A monotone, thread-safe accumulator.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Adds its elapsed time (in nanoseconds) into a `Counter` when dropped.
pub struct ScopedTimer<'a> {
    start: Instant,
    sink: &'a Counter,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(sink: &'a Counter) -> Self {
        Self {
            start: Instant::now(),
            sink,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.sink.add(self.start.elapsed().as_nanos() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::new();
        c.increment();
        c.add(41);
        assert_eq!(c.get(), 42);
    }

    #[test]
    fn scoped_timer_adds_nonzero_duration() {
        let c = Counter::new();
        {
            let _t = ScopedTimer::new(&c);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(c.get() > 0);
    }

    #[test]
    fn now_ns_is_monotone() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
