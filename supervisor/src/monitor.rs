//! Crash recovery monitor and the other registry sweeps (cleanup, expiry).
//!
//! Sweeps work on a registry snapshot. Liveness checks, ledger writes and
//! relaunch scheduling all happen with the registry lock released; the only
//! coordination with concurrent stops is [`Registry::remove_if_same`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::recovery::{RecoveryDecision, RecoveryInputs, decide};
use crate::core::types::{ScriptId, ScriptKey, ScriptStatus, TenantId};
use crate::io::ledger::ScriptUpdate;
use crate::launcher::{Collaborators, RecoveryTarget};
use crate::reaper::Reaper;
use crate::registry::Registry;

/// Result of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub relaunched: Vec<ScriptKey>,
    pub released: Vec<ScriptKey>,
}

pub struct Monitor {
    registry: Arc<Registry>,
    reaper: Reaper,
    deps: Collaborators,
    target: Arc<dyn RecoveryTarget>,
    stale_after: Duration,
}

impl Monitor {
    pub fn new(
        registry: Arc<Registry>,
        reaper: Reaper,
        deps: Collaborators,
        target: Arc<dyn RecoveryTarget>,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            reaper,
            deps,
            target,
            stale_after,
        }
    }

    /// One crash-recovery cycle over every settled record.
    #[instrument(skip_all)]
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for record in self.registry.snapshot() {
            // Records inside their startle window belong to the launcher.
            if !record.is_settled() || record.is_alive() {
                continue;
            }
            let tenant = record.key.tenant;
            warn!(key = %record.key, pid = record.pid(), attempt = %record.attempt, "script died");
            self.update(
                record.script_id,
                &ScriptUpdate {
                    status: Some(ScriptStatus::Crashed),
                    last_crash: Some(Utc::now()),
                    ..ScriptUpdate::default()
                },
            );

            let decision = decide(RecoveryInputs {
                entitlement_active: self.deps.entitlement.is_active(tenant),
                plan_auto_restart: self.deps.entitlement.plan_allows_auto_restart(tenant),
                attempt: record.attempt,
            });
            if !self.registry.remove_if_same(&record) {
                debug!(key = %record.key, "record already released");
                continue;
            }
            match decision {
                RecoveryDecision::Relaunch(next) => {
                    info!(key = %record.key, attempt = %next, "scheduling recovery");
                    self.update(
                        record.script_id,
                        &ScriptUpdate {
                            increment_restarts: true,
                            ..ScriptUpdate::default()
                        },
                    );
                    self.deps.notifier.send(
                        tenant,
                        &format!("{} crashed; restarting (attempt {next})", record.key.name),
                    );
                    self.target.relaunch(record.script_id, tenant, next);
                    report.relaunched.push(record.key.clone());
                }
                RecoveryDecision::Release(reason) => {
                    info!(key = %record.key, reason = reason.describe(), "not restarting");
                    self.update(record.script_id, &ScriptUpdate::status(ScriptStatus::Stopped));
                    self.deps.notifier.send(
                        tenant,
                        &format!("{} crashed and was stopped: {}", record.key.name, reason.describe()),
                    );
                    report.released.push(record.key.clone());
                }
            }
        }
        report
    }

    /// Release dead settled records older than the stale threshold. Returns how many.
    #[instrument(skip_all)]
    pub fn cleanup(&self) -> usize {
        let mut released = 0;
        for record in self.registry.snapshot() {
            if !record.is_settled() || record.started.elapsed() < self.stale_after || record.is_alive() {
                continue;
            }
            if self.registry.remove_if_same(&record) {
                debug!(key = %record.key, "stale record released");
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "cleanup released stale records");
        }
        released
    }

    /// Stop every record of tenants whose entitlement lapsed. Returns how many.
    #[instrument(skip_all)]
    pub fn expire(&self) -> usize {
        let records = self.registry.snapshot();
        let tenants: BTreeSet<TenantId> = records.iter().map(|r| r.key.tenant).collect();
        let mut stopped = 0;
        for tenant in tenants {
            if self.deps.entitlement.is_active(tenant) {
                continue;
            }
            let mut names = Vec::new();
            for record in records.iter().filter(|r| r.key.tenant == tenant) {
                if !self.registry.remove_if_same(record) {
                    continue;
                }
                self.reaper.kill_tree(record);
                self.update(
                    record.script_id,
                    &ScriptUpdate {
                        status: Some(ScriptStatus::Stopped),
                        last_stopped: Some(Utc::now()),
                        ..ScriptUpdate::default()
                    },
                );
                names.push(record.key.name.clone());
            }
            if names.is_empty() {
                continue;
            }
            info!(tenant = %tenant, scripts = names.len(), "subscription expired; scripts stopped");
            self.deps.notifier.send(
                tenant,
                &format!("Subscription expired. Stopped: {}", names.join(", ")),
            );
            stopped += names.len();
        }
        stopped
    }

    fn update(&self, id: ScriptId, update: &ScriptUpdate) {
        if let Err(err) = self.deps.ledger.update_script(id, update) {
            warn!(script = %id, err = %format!("{err:#}"), "ledger update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use crate::core::attempt::Attempt;
    use crate::core::types::RuntimeKind;
    use crate::io::config::ReaperConfig;
    use crate::io::ledger::ScriptEntry;
    use crate::registry::{LaunchTarget, SupervisionRecord};
    use crate::test_support::{
        FakeProcess, MemoryLedger, RecordingInstaller, RecordingNotifier, StaticEntitlement,
    };

    #[derive(Default)]
    struct RecordingTarget {
        calls: Mutex<Vec<(ScriptId, Attempt)>>,
    }

    impl RecoveryTarget for RecordingTarget {
        fn relaunch(&self, script_id: ScriptId, _notify: TenantId, attempt: Attempt) {
            self.calls.lock().expect("lock").push((script_id, attempt));
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        ledger: Arc<MemoryLedger>,
        entitlement: Arc<StaticEntitlement>,
        notifier: Arc<RecordingNotifier>,
        target: Arc<RecordingTarget>,
        monitor: Monitor,
    }

    fn fixture(active: bool, auto_restart: bool) -> Fixture {
        let registry = Arc::new(Registry::new());
        let ledger = Arc::new(MemoryLedger::default());
        let entitlement = Arc::new(StaticEntitlement::new(active, auto_restart, None));
        let notifier = Arc::new(RecordingNotifier::default());
        let target = Arc::new(RecordingTarget::default());
        let deps = Collaborators {
            ledger: ledger.clone(),
            entitlement: entitlement.clone(),
            notifier: notifier.clone(),
            installer: Arc::new(RecordingInstaller::default()),
        };
        let reaper = Reaper::new(&ReaperConfig {
            child_grace_ms: 20,
            root_grace_ms: 20,
            poll_interval_ms: 5,
        });
        let monitor = Monitor::new(
            registry.clone(),
            reaper,
            deps,
            target.clone(),
            Duration::ZERO,
        );
        Fixture {
            registry,
            ledger,
            entitlement,
            notifier,
            target,
            monitor,
        }
    }

    fn add_record(fx: &Fixture, id: u64, process: FakeProcess, attempt: u8, settled: bool) -> ScriptKey {
        let key = ScriptKey::new(TenantId(7), format!("bot{id}"));
        let mut entry = ScriptEntry::new(
            ScriptId(id),
            TenantId(7),
            key.name.clone(),
            "/work",
            "main.py",
            RuntimeKind::Python,
        );
        entry.status = ScriptStatus::Running;
        fx.ledger.insert(entry);
        let record = SupervisionRecord::new(
            key.clone(),
            ScriptId(id),
            Box::new(process),
            LaunchTarget {
                work_dir: PathBuf::from("/work"),
                entry_path: PathBuf::from("/work/main.py"),
                runtime: RuntimeKind::Python,
                log_path: PathBuf::from("/logs/x.log"),
            },
            Attempt::new(attempt).expect("attempt"),
            None,
        );
        if settled {
            record.mark_settled();
        }
        fx.registry.register(Arc::new(record));
        key
    }

    #[test]
    fn crashed_script_is_relaunched_at_next_attempt() {
        let fx = fixture(true, true);
        let key = add_record(&fx, 1, FakeProcess::exited(10, 1), 1, true);

        let report = fx.monitor.sweep();

        assert_eq!(report.relaunched, vec![key.clone()]);
        assert!(fx.registry.get(&key).is_none());
        let calls = fx.target.calls.lock().expect("lock").clone();
        assert_eq!(calls, vec![(ScriptId(1), Attempt::new(2).expect("attempt"))]);
        let entry = fx.ledger.entry(ScriptId(1)).expect("entry");
        assert_eq!(entry.total_restarts, 1);
        assert_eq!(entry.status, ScriptStatus::Crashed);
    }

    #[test]
    fn auto_restart_disabled_stops_without_relaunch() {
        let fx = fixture(true, true);
        fx.entitlement.set_auto_restart(false);
        let key = add_record(&fx, 1, FakeProcess::exited(10, 1), 1, true);

        let report = fx.monitor.sweep();

        assert_eq!(report.released, vec![key.clone()]);
        assert!(fx.registry.get(&key).is_none());
        assert!(fx.target.calls.lock().expect("lock").is_empty());
        assert_eq!(fx.ledger.entry(ScriptId(1)).expect("entry").status, ScriptStatus::Stopped);
        assert!(fx.notifier.contains("auto-restart"));
    }

    #[test]
    fn inactive_tenant_or_exhausted_attempts_are_released() {
        let fx = fixture(false, true);
        add_record(&fx, 1, FakeProcess::exited(10, 1), 1, true);
        assert_eq!(fx.monitor.sweep().released.len(), 1);

        let fx = fixture(true, true);
        add_record(&fx, 2, FakeProcess::exited(11, 1), 3, true);
        assert_eq!(fx.monitor.sweep().released.len(), 1);
        assert!(fx.target.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn live_and_unsettled_records_are_left_alone() {
        let fx = fixture(true, true);
        let alive = add_record(&fx, 1, FakeProcess::running(10), 1, true);
        let starting = add_record(&fx, 2, FakeProcess::exited(11, 1), 1, false);

        assert_eq!(fx.monitor.sweep(), SweepReport::default());
        assert!(fx.registry.get(&alive).is_some());
        assert!(fx.registry.get(&starting).is_some());
    }

    #[test]
    fn cleanup_releases_dead_settled_records() {
        let fx = fixture(true, true);
        let dead = add_record(&fx, 1, FakeProcess::exited(10, 0), 1, true);
        let alive = add_record(&fx, 2, FakeProcess::running(11), 1, true);

        assert_eq!(fx.monitor.cleanup(), 1);
        assert!(fx.registry.get(&dead).is_none());
        assert!(fx.registry.get(&alive).is_some());
    }

    #[test]
    fn expiry_stops_lapsed_tenants() {
        let fx = fixture(true, true);
        let process = FakeProcess::running(4_000_100);
        let key = add_record(&fx, 1, process.clone(), 1, true);
        assert_eq!(fx.monitor.expire(), 0);

        fx.entitlement.set_active(false);
        assert_eq!(fx.monitor.expire(), 1);
        assert!(fx.registry.get(&key).is_none());
        assert!(!process.is_alive_now());
        assert_eq!(fx.ledger.entry(ScriptId(1)).expect("entry").status, ScriptStatus::Stopped);
        assert!(fx.notifier.contains("Subscription expired"));
    }
}
