//! Minimal dispatcher: submits work onto a [`Stream`] and instruments it.
//!
//! Grounded on `original_source/src/rt/dispatch/include/gcore/rt/dispatch.hpp`.

use std::sync::Arc;

use super::event::Event;
use super::stream::Stream;
use super::telemetry::{now_ns, Counter};

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatcherStats {
    pub submits: u64,
    pub completed: u64,
    pub total_work_ns: u64,
}

/// Submits closures onto a [`Stream`] while tracking submit/completion
/// counts and aggregated measured work time.
pub struct Dispatcher {
    submits: Counter,
    completed: Arc<Counter>,
    work_ns: Arc<Counter>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            submits: Counter::new(),
            completed: Arc::new(Counter::new()),
            work_ns: Arc::new(Counter::new()),
        }
    }

    /// Submit `work` onto `stream`, timing its execution and returning the
    /// completion [`Event`].
    pub fn submit<F>(&self, stream: &Stream, work: F, _label: &str) -> Event
    where
        F: FnOnce() + Send + 'static,
    {
        self.submits.increment();
        let completed = Arc::clone(&self.completed);
        let work_ns = Arc::clone(&self.work_ns);
        stream.enqueue(move || {
            let start = now_ns();
            work();
            work_ns.add(now_ns().saturating_sub(start));
            completed.increment();
        })
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submits: self.submits.get(),
            completed: self.completed.get(),
            total_work_ns: self.work_ns.get(),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_tracks_completion_and_work_time() {
        let dispatcher = Dispatcher::new();
        let stream = Stream::new();
        let event = dispatcher.submit(
            &stream,
            || {
                std::thread::sleep(std::time::Duration::from_millis(1));
            },
            "test",
        );
        event.wait();
        stream.flush();
        let stats = dispatcher.stats();
        assert_eq!(stats.submits, 1);
        assert_eq!(stats.completed, 1);
        assert!(stats.total_work_ns > 0);
    }
}
