//! `spec.md` §8 scenario 2: enqueuing work on a `Stream` and flushing it
//! must observe every closure run exactly once, in submission order.

use std::sync::{Arc, Mutex};

use exsa_core::rt::Stream;

#[test]
fn flush_runs_all_enqueued_work_in_order() {
    let stream = Stream::new();
    let log = Arc::new(Mutex::new(Vec::with_capacity(1000)));

    for i in 0..1000u32 {
        let log = Arc::clone(&log);
        stream.enqueue(move || {
            log.lock().unwrap().push(i);
        });
    }

    stream.flush();

    let observed = log.lock().unwrap().clone();
    let expected: Vec<u32> = (0..1000).collect();
    assert_eq!(observed, expected);
    assert_eq!(stream.completed(), stream.enqueued());
}
