//! Cooperative shutdown signalling.
//!
//! The acquisition loop and the watchdog only ever block on two operations:
//! the network call (bounded by its own timeout) and backoff/tick sleeps.
//! Sleeps go through [`Shutdown::sleep`] so an external shutdown request
//! interrupts them instead of waiting out the full backoff.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Inner {
    requested: Mutex<bool>,
    condvar: Condvar,
}

/// Shared shutdown flag with an interruptible sleep.
///
/// Clones share the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a new, un-requested shutdown handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown, waking any sleeper.
    pub fn request(&self) {
        let mut requested = self.inner.requested.lock().expect("lock poisoned");
        *requested = true;
        self.inner.condvar.notify_all();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        *self.inner.requested.lock().expect("lock poisoned")
    }

    /// Sleep for `duration`, returning early if shutdown is requested.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the sleep was
    /// interrupted by a shutdown request.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut requested = self.inner.requested.lock().expect("lock poisoned");
        loop {
            if *requested {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .inner
                .condvar
                .wait_timeout(requested, deadline - now)
                .expect("lock poisoned");
            requested = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_completes_when_not_requested() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn sleep_interrupted_by_request() {
        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                shutdown.request();
            })
        };
        let started = Instant::now();
        let completed = shutdown.sleep(Duration::from_secs(30));
        handle.join().unwrap();
        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_requested());
    }
}
