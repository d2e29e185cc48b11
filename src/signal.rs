//! Cooperative stop flags and bounded joins for worker threads.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shared stop flag. Workers poll `is_stopped()` every iteration and sleep via `wait()`
/// so that a stop request cuts their idle time short.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`. Returns true when stop was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.inner.lock.lock() else {
            return self.is_stopped();
        };
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.inner.cvar.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => guard = next,
                Err(_) => break,
            }
        }
        self.is_stopped()
    }
}

/// Joins `handle` if it finishes within `timeout`. A thread that overruns is detached
/// and reported as an error; it never blocks the caller indefinitely.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, what: &str) -> Result<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(anyhow!("{} did not stop within {:?}", what, timeout));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    handle
        .join()
        .map_err(|_| anyhow!("{} thread panicked", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_early_on_stop() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || remote.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn wait_times_out_without_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
    }

    #[test]
    fn join_with_timeout_reports_stuck_thread() {
        let signal = StopSignal::new();
        let remote = signal.clone();
        let handle = std::thread::spawn(move || {
            remote.wait(Duration::from_secs(5));
        });
        let err = join_with_timeout(handle, Duration::from_millis(30), "sleeper").unwrap_err();
        assert!(err.to_string().contains("sleeper"));
        signal.stop();
    }
}
