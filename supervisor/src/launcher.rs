//! Process launcher: detection, dependency install, spawn, startle check and
//! the bounded retry chain.
//!
//! A chain runs attempts 1..=3 in an explicit loop. Each attempt either ends
//! the chain with a [`LaunchOutcome`] or hands the next attempt number back to
//! the loop; [`Attempt::next`] returning `None` is what bounds it.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::attempt::Attempt;
use crate::core::classifier::{FailureClass, FailureClassifier};
use crate::core::error::SupervisorError;
use crate::core::text::diagnostic;
use crate::core::types::{RuntimeKind, ScriptId, ScriptKey, ScriptStatus, TenantId};
use crate::io::config::SupervisorConfig;
use crate::io::detector::Detector;
use crate::io::entitlement::Entitlement;
use crate::io::handle::{OsProcess, SpawnRequest, resolve_entry, script_env};
use crate::io::installer::DependencyInstaller;
use crate::io::ledger::{Ledger, ScriptEntry, ScriptUpdate};
use crate::io::logs;
use crate::io::notifier::Notifier;
use crate::reaper::Reaper;
use crate::registry::{LaunchTarget, Registry, SupervisionRecord};
use crate::tasks::StopSignal;

/// Candidate files listed in an entry-not-found report.
const MAX_LISTED_CANDIDATES: usize = 10;

/// Terminal result of one launch chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Alive after both startle windows.
    Running { pid: u32, attempt: Attempt },
    /// Crashed with no remediation left for this chain.
    Crashed {
        attempt: Attempt,
        exit_code: Option<i32>,
        /// Bounded diagnostic tail of the script's output.
        tail: String,
        exhausted: bool,
    },
    /// A concurrent stop removed the record during the startle check.
    Stopped,
}

/// External collaborators shared by the launcher, monitor and facade.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub entitlement: Arc<dyn Entitlement>,
    pub notifier: Arc<dyn Notifier>,
    pub installer: Arc<dyn DependencyInstaller>,
}

/// Relaunch hook used by the crash recovery monitor.
pub trait RecoveryTarget: Send + Sync {
    /// Schedule a relaunch at `attempt` without blocking the caller.
    fn relaunch(&self, script_id: ScriptId, notify: TenantId, attempt: Attempt);
}

enum Step {
    Done(LaunchOutcome),
    Retry(Attempt),
}

#[derive(Clone)]
pub struct Launcher {
    cfg: Arc<SupervisorConfig>,
    detector: Arc<Detector>,
    classifier: Arc<FailureClassifier>,
    registry: Arc<Registry>,
    reaper: Reaper,
    deps: Collaborators,
    shutdown: Arc<StopSignal>,
    relaunches: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Launcher {
    pub fn new(
        cfg: Arc<SupervisorConfig>,
        detector: Arc<Detector>,
        registry: Arc<Registry>,
        deps: Collaborators,
        shutdown: Arc<StopSignal>,
    ) -> anyhow::Result<Self> {
        let classifier = FailureClassifier::new(&cfg.classifier.rules)?;
        let reaper = Reaper::new(&cfg.reaper);
        Ok(Self {
            cfg,
            detector,
            classifier: Arc::new(classifier),
            registry,
            reaper,
            deps,
            shutdown,
            relaunches: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Wait for every scheduled recovery thread to finish.
    ///
    /// Call after the shutdown signal has been raised: pending recoveries then
    /// return without launching, and an attempt already in flight tears down
    /// what it spawned.
    pub fn join_relaunches(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .relaunches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("recovery thread panicked");
            }
        }
    }

    /// Fresh top-level launch: admission checks, then a chain starting at attempt 1.
    #[instrument(skip_all, fields(script = %script_id))]
    pub fn launch(&self, script_id: ScriptId, notify: TenantId) -> Result<LaunchOutcome, SupervisorError> {
        let entry = self.load_entry(script_id)?;
        self.admit(&entry)?;
        self.run_chain(entry, notify, Attempt::FIRST)
    }

    /// Continue a chain at `attempt` without admission checks.
    ///
    /// Attempt numbers beyond the bound are refused with `AttemptsExhausted`.
    #[instrument(skip_all, fields(script = %script_id, attempt = attempt))]
    pub fn launch_attempt(
        &self,
        script_id: ScriptId,
        notify: TenantId,
        attempt: u8,
    ) -> Result<LaunchOutcome, SupervisorError> {
        let attempt = match Attempt::new(attempt) {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(err = %err, "launch refused");
                self.deps.notifier.send(notify, &format!("Launch refused: {err}"));
                return Err(err);
            }
        };
        let entry = self.load_entry(script_id)?;
        self.run_chain(entry, notify, attempt)
    }

    fn load_entry(&self, script_id: ScriptId) -> Result<ScriptEntry, SupervisorError> {
        self.deps
            .ledger
            .get_script(script_id)
            .map_err(SupervisorError::Ledger)?
            .ok_or(SupervisorError::ScriptNotFound(script_id))
    }

    fn admit(&self, entry: &ScriptEntry) -> Result<(), SupervisorError> {
        if !self.deps.entitlement.is_active(entry.tenant) {
            return Err(SupervisorError::NotEntitled);
        }
        if self.registry.is_running(&entry.key()) {
            return Err(SupervisorError::AlreadyRunning(entry.id));
        }
        if let Some(limit) = self.deps.entitlement.max_concurrent_scripts(entry.tenant) {
            let running = self.registry.running_for_tenant(entry.tenant);
            if running >= limit as usize {
                return Err(SupervisorError::ConcurrencyLimit { limit });
            }
        }
        Ok(())
    }

    fn run_chain(
        &self,
        mut entry: ScriptEntry,
        notify: TenantId,
        start: Attempt,
    ) -> Result<LaunchOutcome, SupervisorError> {
        let mut attempt = start;
        loop {
            match self.run_attempt(&mut entry, notify, attempt)? {
                Step::Done(outcome) => return Ok(outcome),
                Step::Retry(next) => {
                    debug!(script = %entry.id, attempt = %next, "retrying");
                    attempt = next;
                }
            }
        }
    }

    #[instrument(skip_all, fields(script = %entry.id, attempt = %attempt))]
    fn run_attempt(
        &self,
        entry: &mut ScriptEntry,
        notify: TenantId,
        attempt: Attempt,
    ) -> Result<Step, SupervisorError> {
        if self.shutdown.is_stopped() {
            info!("supervisor shutting down; launch abandoned");
            return Ok(Step::Done(LaunchOutcome::Stopped));
        }
        if attempt.is_first() {
            self.redetect(entry);
        }

        let entry_path = self.resolve(entry, notify)?;
        let runtime = RuntimeKind::from_path(&entry_path).unwrap_or(entry.runtime);

        if attempt.is_first() {
            self.deps.installer.install_manifest(&entry.work_dir, runtime);
        }

        self.update(entry.id, &ScriptUpdate::status(ScriptStatus::Starting));
        self.deps.notifier.send(
            notify,
            &format!(
                "Starting {} ({}, {}) attempt {attempt}",
                entry.name,
                entry.entry_file,
                runtime.label()
            ),
        );

        let key = entry.key();
        let target = LaunchTarget {
            work_dir: entry.work_dir.clone(),
            entry_path,
            runtime,
            log_path: logs::log_path(&self.cfg.paths.logs_dir, &key),
        };
        let record = self.spawn(entry, &key, target, attempt, notify)?;
        if self.shutdown.is_stopped() {
            return Ok(Step::Done(self.abandon(&record)));
        }

        let exited = record.process.wait(self.cfg.launch.startle_primary())
            || record.process.wait(self.cfg.launch.startle_secondary());
        if !exited {
            if self.shutdown.is_stopped() {
                return Ok(Step::Done(self.abandon(&record)));
            }
            return Ok(Step::Done(self.settle(entry, &record, notify)));
        }

        let exit_code = record.process.exit_code();
        if !self.registry.remove_if_same(&record) {
            info!("record released by a concurrent stop");
            return Ok(Step::Done(LaunchOutcome::Stopped));
        }
        warn!(exit_code = ?exit_code, "script exited during startle check");

        let tail = match logs::read_tail(&record.target.log_path, self.cfg.launch.log_tail_chars) {
            Ok(tail) => tail,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not read crash log");
                String::new()
            }
        };

        if let Some(next) = attempt.next() {
            if let Some(step) = self.remediate(entry, notify, attempt, next, &tail) {
                return Ok(step);
            }
        }
        Ok(Step::Done(self.record_crash(entry, notify, attempt, exit_code, &tail)))
    }

    /// Tear down a record spawned while the supervisor was shutting down.
    fn abandon(&self, record: &Arc<SupervisionRecord>) -> LaunchOutcome {
        if self.registry.remove_if_same(record) {
            self.reaper.kill_tree(record);
        }
        info!("supervisor shutting down; spawned script torn down");
        LaunchOutcome::Stopped
    }

    /// Re-run detection and persist the result when it differs from the ledger.
    fn redetect(&self, entry: &mut ScriptEntry) {
        let Some(found) = self.detector.detect(&entry.work_dir) else {
            debug!("detection found nothing; keeping stored entry");
            return;
        };
        if found.entry != entry.entry_file || found.runtime != entry.runtime {
            info!(from = %entry.entry_file, to = %found.entry, "entry file re-detected");
        }
        entry.entry_file.clone_from(&found.entry);
        entry.runtime = found.runtime;
        self.update(
            entry.id,
            &ScriptUpdate {
                entry_file: Some(found.entry),
                runtime: Some(found.runtime),
                detection_confidence: Some(found.confidence),
                ..ScriptUpdate::default()
            },
        );
    }

    /// Absolute entry path, falling back to a recursive search by file name.
    fn resolve(&self, entry: &mut ScriptEntry, notify: TenantId) -> Result<std::path::PathBuf, SupervisorError> {
        match resolve_entry(&entry.work_dir, &entry.entry_file) {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "could not resolve entry"),
        }

        let file_name = Path::new(&entry.entry_file)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(entry.entry_file.as_str())
            .to_string();
        if let Some(found) = self.detector.find_by_name(&entry.work_dir, &file_name) {
            let relative = found
                .strip_prefix(&entry.work_dir)
                .unwrap_or(found.as_path())
                .to_string_lossy()
                .replace('\\', "/");
            if let Ok(Some(path)) = resolve_entry(&entry.work_dir, &relative) {
                info!(entry = %relative, "entry found by name search");
                entry.entry_file.clone_from(&relative);
                self.update(
                    entry.id,
                    &ScriptUpdate {
                        entry_file: Some(relative),
                        ..ScriptUpdate::default()
                    },
                );
                return Ok(path);
            }
        }

        let available: Vec<String> = self
            .detector
            .candidates(&entry.work_dir)
            .into_iter()
            .take(MAX_LISTED_CANDIDATES)
            .collect();
        error!(entry = %entry.entry_file, "entry file not found");
        let listing = if available.is_empty() {
            "none".to_string()
        } else {
            available.join(", ")
        };
        self.deps.notifier.send(
            entry.tenant,
            &format!("Entry file {} not found. Available: {listing}", entry.entry_file),
        );
        if notify != entry.tenant {
            self.deps
                .notifier
                .send(notify, &format!("Entry file {} not found", entry.entry_file));
        }
        self.update(
            entry.id,
            &ScriptUpdate {
                status: Some(ScriptStatus::Crashed),
                last_crash: Some(Utc::now()),
                error_log: Some(format!("entry file {} not found", entry.entry_file)),
                ..ScriptUpdate::default()
            },
        );
        Err(SupervisorError::EntryNotFound {
            entry: entry.entry_file.clone(),
            available,
        })
    }

    fn spawn(
        &self,
        entry: &ScriptEntry,
        key: &ScriptKey,
        target: LaunchTarget,
        attempt: Attempt,
        notify: TenantId,
    ) -> Result<Arc<SupervisionRecord>, SupervisorError> {
        let program = match target.runtime {
            RuntimeKind::Python => self.cfg.runtimes.python.clone(),
            RuntimeKind::Node => self.cfg.runtimes.node.clone(),
        };
        let request = SpawnRequest {
            program,
            entry_path: target.entry_path.clone(),
            work_dir: target.work_dir.clone(),
            env: script_env(&self.cfg.launch.secret_env, entry.secret.as_deref()),
        };

        let spawned = logs::open_truncated(&target.log_path)
            .map_err(|err| io::Error::other(format!("{err:#}")))
            .and_then(|log| {
                let process = OsProcess::spawn(&request, &log)?;
                Ok((process, log))
            });
        let (process, log) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                error!(err = %err, "spawn failed");
                self.update(
                    entry.id,
                    &ScriptUpdate {
                        status: Some(ScriptStatus::Crashed),
                        last_crash: Some(Utc::now()),
                        error_log: Some(format!("spawn failed: {err}")),
                        ..ScriptUpdate::default()
                    },
                );
                self.deps
                    .notifier
                    .send(notify, &format!("Failed to start {}: {err}", entry.name));
                return Err(SupervisorError::Spawn(err));
            }
        };

        let record = Arc::new(SupervisionRecord::new(
            key.clone(),
            entry.id,
            Box::new(process),
            target,
            attempt,
            Some(log),
        ));
        if let Some(displaced) = self.registry.register(Arc::clone(&record)) {
            warn!(pid = displaced.pid(), "replacing an existing record");
            self.reaper.kill_tree(&displaced);
        }
        Ok(record)
    }

    fn settle(&self, entry: &ScriptEntry, record: &Arc<SupervisionRecord>, notify: TenantId) -> LaunchOutcome {
        let still_ours = self
            .registry
            .get(&record.key)
            .is_some_and(|current| Arc::ptr_eq(&current, record));
        if !still_ours {
            info!("record released by a concurrent stop");
            return LaunchOutcome::Stopped;
        }
        record.mark_settled();
        let pid = record.pid();
        self.update(
            entry.id,
            &ScriptUpdate {
                status: Some(ScriptStatus::Running),
                pid: Some(pid),
                last_started: Some(record.started_at),
                ..ScriptUpdate::default()
            },
        );
        info!(pid, "script running");
        self.deps
            .notifier
            .send(notify, &format!("{} is running (pid {pid})", entry.name));
        LaunchOutcome::Running {
            pid,
            attempt: record.attempt,
        }
    }

    /// Pick a remediation for a crash that still has attempts left.
    ///
    /// Remediations are tried in order: a reactive module install, then (on
    /// attempt 1 only) an alternate entry file. A failed install falls through
    /// to the alternate entry.
    fn remediate(
        &self,
        entry: &mut ScriptEntry,
        notify: TenantId,
        attempt: Attempt,
        next: Attempt,
        tail: &str,
    ) -> Option<Step> {
        if let FailureClass::MissingDependency { runtime, name } = self.classifier.classify(tail) {
            self.deps
                .notifier
                .send(notify, &format!("Installing missing package {name}"));
            let outcome = self
                .deps
                .installer
                .install_module(&entry.work_dir, runtime, &name);
            // Runtime B retries even when the ad hoc install failed.
            if outcome.succeeded() || runtime == RuntimeKind::Node {
                thread::sleep(self.cfg.launch.retry_delay());
                return Some(Step::Retry(next));
            }
            self.deps
                .notifier
                .send(notify, &format!("Could not resolve dependency {name}"));
        }

        if !attempt.is_first() {
            return None;
        }
        let alternate = self.alternate_entry(&entry.work_dir, &entry.entry_file)?;
        info!(from = %entry.entry_file, to = %alternate, "trying alternate entry");
        let runtime = RuntimeKind::from_path(Path::new(&alternate)).unwrap_or(entry.runtime);
        entry.entry_file.clone_from(&alternate);
        entry.runtime = runtime;
        self.update(
            entry.id,
            &ScriptUpdate {
                entry_file: Some(alternate),
                runtime: Some(runtime),
                ..ScriptUpdate::default()
            },
        );
        Some(Step::Retry(next))
    }

    fn alternate_entry(&self, work_dir: &Path, current: &str) -> Option<String> {
        self.cfg
            .launch
            .alternate_entries
            .iter()
            .find(|alt| alt.as_str() != current && work_dir.join(alt.as_str()).is_file())
            .cloned()
    }

    fn record_crash(
        &self,
        entry: &ScriptEntry,
        notify: TenantId,
        attempt: Attempt,
        exit_code: Option<i32>,
        tail: &str,
    ) -> LaunchOutcome {
        let exhausted = attempt.is_last();
        let tail = diagnostic(tail, self.cfg.launch.diagnostic_tail_chars);
        self.update(
            entry.id,
            &ScriptUpdate {
                status: Some(ScriptStatus::Crashed),
                last_crash: Some(Utc::now()),
                error_log: Some(tail.clone()),
                ..ScriptUpdate::default()
            },
        );
        let code = exit_code.map_or_else(|| "signal".to_string(), |code| code.to_string());
        let mut message = format!(
            "{} crashed (exit code {code}) on attempt {attempt}:\n{tail}",
            entry.name
        );
        if exhausted {
            message.push_str(&format!("\n{} attempts exhausted", Attempt::MAX));
        }
        self.deps.notifier.send(notify, &message);
        LaunchOutcome::Crashed {
            attempt,
            exit_code,
            tail,
            exhausted,
        }
    }

    fn update(&self, id: ScriptId, update: &ScriptUpdate) {
        if let Err(err) = self.deps.ledger.update_script(id, update) {
            warn!(script = %id, err = %format!("{err:#}"), "ledger update failed");
        }
    }
}

impl RecoveryTarget for Launcher {
    fn relaunch(&self, script_id: ScriptId, notify: TenantId, attempt: Attempt) {
        if self.shutdown.is_stopped() {
            info!(script = %script_id, "shutting down; recovery not scheduled");
            return;
        }
        let launcher = self.clone();
        let backoff = Duration::from_secs(self.cfg.monitor.recovery_backoff_secs);
        let spawned = thread::Builder::new()
            .name(format!("relaunch-{}", script_id.0))
            .spawn(move || {
                if launcher.shutdown.wait(backoff) {
                    info!(script = %script_id, "shutting down; recovery dropped");
                    return;
                }
                match launcher.launch_attempt(script_id, notify, attempt.get()) {
                    Ok(outcome) => info!(script = %script_id, outcome = ?outcome, "recovery finished"),
                    Err(err) => warn!(script = %script_id, err = %err, "recovery failed"),
                }
            });
        match spawned {
            Ok(handle) => {
                let mut relaunches = self.relaunches.lock().unwrap_or_else(PoisonError::into_inner);
                relaunches.retain(|pending| !pending.is_finished());
                relaunches.push(handle);
            }
            Err(err) => error!(script = %script_id, err = %err, "could not schedule recovery"),
        }
    }
}
