//! `spec.md` §8 scenario 1: allocator churn. A fresh `HostAllocator` with
//! bins `[2^6, 2^20]` and large threshold `2^20`, driven through repeated
//! alloc/free pairs, must reuse bin slots rather than growing its live
//! block count, and must return to zero bytes in use once everything is
//! freed.

use exsa_core::rt::HostAllocator;

#[test]
fn churn_reuses_bins_and_drains_to_zero() {
    let allocator = HostAllocator::new(6, 20, 20);
    let iterations = 200_000usize;

    for _ in 0..iterations {
        let a = allocator.alloc(64, 8);
        let b = allocator.alloc(1024, 8);
        assert!(!a.is_null());
        assert!(!b.is_null());
        unsafe {
            allocator.free(a);
            allocator.free(b);
        }
    }

    let stats = allocator.stats();
    assert_eq!(stats.bytes_in_use, 0);
    // Both sizes (64 B, 1 KiB) hit the same two bins every round; only the
    // first round of each can miss, everything after is a reuse hit.
    let bin_count = 20 - 6 + 1;
    assert!(stats.reuse_hits >= stats.alloc_calls.saturating_sub(2 * bin_count));
}
