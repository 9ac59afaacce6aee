// Helpers shared by the integration tests

use std::sync::atomic::{AtomicUsize, Ordering};

use shmemq::ShmemQueue;

/// A queue name nobody else uses: unique per test process and per call.
///
/// Any leftover object from an earlier crashed run is removed first.
pub fn fresh_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/shmemq_test_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    cleanup(&name);
    name
}

/// Remove a queue name, ignoring whether it existed.
pub fn cleanup(name: &str) {
    let _ = ShmemQueue::unlink(name);
}

/// Distinct 8-byte payloads for index `i`.
#[allow(dead_code)]
pub fn value(i: u64) -> [u8; 8] {
    (0xA5A5_0000_0000_0000 | i).to_le_bytes()
}
