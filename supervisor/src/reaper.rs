//! Orphan reaper: tears down a record's whole process subtree.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::io::config::ReaperConfig;
use crate::io::os;
use crate::registry::SupervisionRecord;

/// What a teardown did. Teardown itself never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillReport {
    /// The root had already exited when teardown began.
    pub already_exited: bool,
    pub children_signalled: usize,
    pub children_forced: usize,
    pub root_forced: bool,
}

#[derive(Debug, Clone)]
pub struct Reaper {
    child_grace: Duration,
    root_grace: Duration,
    poll: Duration,
}

impl Reaper {
    pub fn new(cfg: &ReaperConfig) -> Self {
        Self {
            child_grace: Duration::from_millis(cfg.child_grace_ms),
            root_grace: Duration::from_millis(cfg.root_grace_ms),
            poll: Duration::from_millis(cfg.poll_interval_ms.max(1)),
        }
    }

    /// Terminate the record's process and every descendant.
    ///
    /// Idempotent: calling it on an already-stopped record only closes the log.
    /// The log handle is always closed before any process is signalled, and
    /// the process group is swept only by the call that stopped the root, since
    /// a reaped leader's pgid may already belong to another script.
    #[instrument(skip_all, fields(key = %record.key, pid = record.pid()))]
    pub fn kill_tree(&self, record: &SupervisionRecord) -> KillReport {
        record.close_log();
        let mut report = KillReport::default();

        if !record.process.is_alive() {
            report.already_exited = true;
            debug!("process already exited");
            return report;
        }

        let children = record.process.children();
        for &pid in &children {
            if os::terminate_pid(pid) {
                report.children_signalled += 1;
            }
        }
        if !children.is_empty() {
            let survivors = self.wait_for_exit(&children, self.child_grace);
            for pid in survivors {
                if os::kill_pid(pid) {
                    report.children_forced += 1;
                }
            }
        }

        record.process.terminate();
        if !record.process.wait(self.root_grace) {
            warn!("root ignored terminate; killing");
            record.process.kill();
            report.root_forced = true;
            if !record.process.wait(self.root_grace) {
                warn!("root still alive after kill");
            }
        }

        self.sweep_group(record);
        info!(
            children = children.len(),
            children_forced = report.children_forced,
            root_forced = report.root_forced,
            "process tree stopped"
        );
        report
    }

    /// Poll until every pid has exited or `grace` elapses; returns the survivors.
    fn wait_for_exit(&self, pids: &[u32], grace: Duration) -> Vec<u32> {
        let deadline = Instant::now() + grace;
        loop {
            let survivors: Vec<u32> = pids.iter().copied().filter(|&pid| os::pid_alive(pid)).collect();
            let now = Instant::now();
            if survivors.is_empty() || now >= deadline {
                return survivors;
            }
            thread::sleep(self.poll.min(deadline - now));
        }
    }

    #[cfg(unix)]
    fn sweep_group(&self, record: &SupervisionRecord) {
        let Some(pgid) = record.process.process_group() else {
            return;
        };
        if os::kill_group(pgid) {
            debug!(pgid, "process group swept");
        }
    }

    #[cfg(not(unix))]
    fn sweep_group(&self, _record: &SupervisionRecord) {}
}
