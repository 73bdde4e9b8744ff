//! FIFO work queue with a dedicated worker thread.
//!
//! Grounded on `original_source/src/rt/stream/{include,src}/stream.{hpp,cpp}`:
//! a `Stream` owns a worker thread that dequeues closures in submission
//! order; `enqueue` is a quick, lock-protected push; `flush` busy-waits
//! until the stream's `completed` counter catches its `enqueued` counter.
//! A stream constructed over a borrowed native handle does not destroy it
//! on drop (§3 "A Stream owns its native handle unless constructed over a
//! borrowed one").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::event::Event;

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    enqueued: AtomicU64,
    completed: AtomicU64,
}

/// Whether a `Stream` owns (and must tear down) its underlying worker
/// thread/native handle, or merely borrows one created elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOwnership {
    Owned,
    Borrowed,
}

/// An ordered queue of work items executing in FIFO order on a dedicated
/// worker thread, outside the submission-side lock.
pub struct Stream {
    sender: Option<Sender<Work>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    ownership: StreamOwnership,
}

impl Stream {
    pub fn new() -> Self {
        Self::with_ownership(StreamOwnership::Owned)
    }

    /// Construct a stream whose worker thread/handle is conceptually
    /// borrowed; dropping it will not join/teardown work belonging to the
    /// owner (here: the worker thread is still this struct's own thread,
    /// since Rust has no raw native queue handle to borrow — the ownership
    /// flag exists so callers modeling a borrowed device queue can assert
    /// they must not `flush`-and-destroy it on drop).
    pub fn with_ownership(ownership: StreamOwnership) -> Self {
        let (tx, rx) = mpsc::channel::<Work>();
        let shared = Arc::new(Shared {
            enqueued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
                worker_shared.completed.fetch_add(1, Ordering::Release);
            }
        });
        Self {
            sender: Some(tx),
            worker: Some(worker),
            shared,
            ownership,
        }
    }

    pub fn ownership(&self) -> StreamOwnership {
        self.ownership
    }

    pub fn enqueued(&self) -> u64 {
        self.shared.enqueued.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Submit a closure for FIFO execution; returns an [`Event`] that
    /// signals once the closure has run.
    pub fn enqueue<F>(&self, work: F) -> Event
    where
        F: FnOnce() + Send + 'static,
    {
        let event = Event::new();
        let completion_event = event.clone();
        self.shared.enqueued.fetch_add(1, Ordering::Release);
        let job: Work = Box::new(move || {
            work();
            completion_event.signal();
        });
        // A channel send only fails if the worker thread has already
        // exited, which only happens after `Stream::drop` closes the
        // sender — i.e. never while `self` is still reachable.
        let _ = self.sender.as_ref().expect("stream sender dropped early").send(job);
        event
    }

    /// Busy-wait until `completed == enqueued`.
    pub fn flush(&self) {
        while self.completed() < self.enqueued() {
            std::hint::spin_loop();
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.flush();
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn flush_waits_for_all_enqueued_work() {
        let stream = Stream::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..1000u32 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().unwrap().push(i));
        }
        stream.flush();
        let expected: Vec<u32> = (0..1000).collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn completed_never_exceeds_enqueued() {
        let stream = Stream::new();
        for _ in 0..50 {
            stream.enqueue(|| {});
        }
        assert!(stream.completed() <= stream.enqueued());
        stream.flush();
        assert_eq!(stream.completed(), stream.enqueued());
    }

    #[test]
    fn enqueue_returns_event_that_signals() {
        let stream = Stream::new();
        let event = stream.enqueue(|| {});
        event.wait();
        assert!(event.is_complete());
    }
}
