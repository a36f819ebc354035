//! Shared cancellation signal checked by every blocking wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Longest single wait slice; every blocking loop re-checks cancellation at
/// least this often.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable handle; cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // A poisoned lock still lets us notify.
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` or until cancelled. Returns `true` when cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.inner.lock.lock() else {
            std::thread::sleep(timeout.min(WAIT_SLICE));
            return self.is_cancelled();
        };
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.inner.wake.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => guard = next,
                Err(_) => return self.is_cancelled(),
            }
        }
    }
}
