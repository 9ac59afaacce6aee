// Blocking-style helpers built from repeated non-blocking attempts.
// The lock is never held between attempts.

use std::convert::Infallible;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::handle::ShmemQueue;

/// Sleep between attempts once the backoff has stopped spinning.
const RETRY_SLEEP: Duration = Duration::from_micros(50);

/// Run `attempt` with backoff until it yields a value, fails, or `timeout` passes.
///
/// `Ok(None)` means the timeout ran out.
pub(crate) fn poll_until<T, E>(
    timeout: Duration,
    mut attempt: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    let start = Instant::now();
    let backoff = Backoff::new();
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        if backoff.is_completed() {
            thread::sleep(RETRY_SLEEP);
        } else {
            backoff.snooze();
        }
    }
}

fn retry_until(timeout: Duration, mut attempt: impl FnMut() -> bool) -> bool {
    let outcome = poll_until(timeout, || Ok::<_, Infallible>(attempt().then_some(())));
    matches!(outcome, Ok(Some(())))
}

impl ShmemQueue {
    /// Keep trying to enqueue until there is room or `timeout` passes.
    ///
    /// A wrong-length element fails immediately.
    pub fn enqueue_timeout(&self, element: &[u8], timeout: Duration) -> bool {
        if element.len() != self.element_size() {
            return false;
        }
        retry_until(timeout, || self.try_enqueue(element))
    }

    /// Keep trying to dequeue until an element arrives or `timeout` passes.
    ///
    /// A wrong-length buffer fails immediately.
    pub fn dequeue_timeout(&self, out: &mut [u8], timeout: Duration) -> bool {
        if out.len() != self.element_size() {
            return false;
        }
        retry_until(timeout, || self.try_dequeue(out))
    }
}
