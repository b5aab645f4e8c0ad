//! Periodic background tasks with cooperative shutdown.
//!
//! Each task is its own named thread that runs one cycle, then waits on a
//! shared [`StopSignal`] for its interval. A panicking cycle is logged and the
//! task keeps its schedule.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info};

/// Shared stop flag that sleeping tasks can be woken from.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout` unless stopped first. Returns `true` when stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

/// A set of running periodic tasks sharing one stop signal.
#[derive(Debug)]
pub struct TaskSet {
    signal: Arc<StopSignal>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self::with_signal(Arc::new(StopSignal::new()))
    }

    /// Task set driven by a signal the caller also hands to other workers.
    pub fn with_signal(signal: Arc<StopSignal>) -> Self {
        Self {
            signal,
            handles: Vec::new(),
        }
    }

    /// Start `cycle` on its own thread, first after `interval`, then every `interval`.
    pub fn spawn<F>(&mut self, name: &str, interval: Duration, mut cycle: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::clone(&self.signal);
        let task = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("task-{name}"))
            .spawn(move || {
                debug!(task = %task, interval_secs = interval.as_secs(), "task started");
                while !signal.wait(interval) {
                    if panic::catch_unwind(AssertUnwindSafe(&mut cycle)).is_err() {
                        error!(task = %task, "task cycle panicked");
                    }
                }
                debug!(task = %task, "task stopped");
            })
            .with_context(|| format!("spawn task {name}"))?;
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every task and wait for the threads to finish their current cycle.
    pub fn shutdown(&mut self) {
        self.signal.stop();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(task = %name, "task thread panicked");
            }
        }
        info!("background tasks stopped");
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_returns_early_when_stopped() {
        let signal = Arc::new(StopSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let stopped = waiter.wait(Duration::from_secs(30));
            (stopped, started.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        signal.stop();
        let (stopped, elapsed) = handle.join().expect("join");
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn wait_times_out_without_stop() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn tasks_run_repeatedly_until_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskSet::new();
        let seen = Arc::clone(&counter);
        tasks
            .spawn("count", Duration::from_millis(10), move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn");
        thread::sleep(Duration::from_millis(200));
        tasks.shutdown();
        let after = counter.load(Ordering::SeqCst);
        assert!(after >= 2, "ran {after} times");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), after);
        assert!(tasks.is_empty());
    }

    #[test]
    fn shutdown_raises_the_shared_signal() {
        let signal = Arc::new(StopSignal::new());
        let mut tasks = TaskSet::with_signal(Arc::clone(&signal));
        tasks
            .spawn("idle", Duration::from_secs(60), || {})
            .expect("spawn");
        assert!(!signal.is_stopped());
        tasks.shutdown();
        assert!(signal.is_stopped());
        assert!(signal.wait(Duration::from_secs(60)));
    }

    #[test]
    fn panicking_cycle_keeps_schedule() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = TaskSet::new();
        let seen = Arc::clone(&counter);
        tasks
            .spawn("flaky", Duration::from_millis(10), move || {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("first cycle fails");
                }
            })
            .expect("spawn");
        thread::sleep(Duration::from_millis(200));
        tasks.shutdown();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
