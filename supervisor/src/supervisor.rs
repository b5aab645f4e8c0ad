//! Supervisor facade: the operations exposed to the UI layer plus background
//! task wiring.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::error::SupervisorError;
use crate::core::types::{DetectionResult, ResourceUsage, ScriptId, ScriptStatus, TenantId};
use crate::io::backup::backup_file;
use crate::io::config::SupervisorConfig;
use crate::io::detector::Detector;
use crate::io::ledger::{ScriptEntry, ScriptUpdate};
use crate::io::sampler::Sampler;
use crate::launcher::{Collaborators, LaunchOutcome, Launcher};
use crate::monitor::Monitor;
use crate::reaper::Reaper;
use crate::registry::Registry;
use crate::tasks::{StopSignal, TaskSet};

pub struct Supervisor {
    cfg: Arc<SupervisorConfig>,
    registry: Arc<Registry>,
    detector: Arc<Detector>,
    launcher: Launcher,
    monitor: Arc<Monitor>,
    reaper: Reaper,
    sampler: Sampler,
    deps: Collaborators,
    tasks: TaskSet,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig, deps: Collaborators) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let registry = Arc::new(Registry::new());
        let shutdown = Arc::new(StopSignal::new());
        let detector = Arc::new(Detector::new(cfg.detector.clone())?);
        let launcher = Launcher::new(
            Arc::clone(&cfg),
            Arc::clone(&detector),
            Arc::clone(&registry),
            deps.clone(),
            Arc::clone(&shutdown),
        )?;
        let reaper = Reaper::new(&cfg.reaper);
        let monitor = Monitor::new(
            Arc::clone(&registry),
            reaper.clone(),
            deps.clone(),
            Arc::new(launcher.clone()),
            Duration::from_secs(cfg.monitor.stale_after_secs),
        );
        Ok(Self {
            sampler: Sampler::new(&cfg.sampler),
            cfg,
            registry,
            detector,
            launcher,
            monitor: Arc::new(monitor),
            reaper,
            deps,
            tasks: TaskSet::with_signal(shutdown),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Fresh launch of `script_id`, notifying `notify` along the way.
    pub fn launch(&self, script_id: ScriptId, notify: TenantId) -> Result<LaunchOutcome, SupervisorError> {
        self.launcher.launch(script_id, notify)
    }

    /// Continue a retry chain at an explicit attempt number (4 and above are refused).
    pub fn launch_attempt(
        &self,
        script_id: ScriptId,
        notify: TenantId,
        attempt: u8,
    ) -> Result<LaunchOutcome, SupervisorError> {
        self.launcher.launch_attempt(script_id, notify, attempt)
    }

    /// Stop a script: release its record, tear down the subtree, mark it Stopped.
    ///
    /// Stopping a script that is not running only updates the ledger.
    #[instrument(skip_all, fields(script = %script_id))]
    pub fn stop(&self, script_id: ScriptId) -> Result<(), SupervisorError> {
        let entry = self.entry(script_id)?;
        match self.registry.remove(&entry.key()) {
            Some(record) => {
                self.reaper.kill_tree(&record);
            }
            None => info!("no live record; marking stopped"),
        }
        self.deps
            .ledger
            .update_script(
                script_id,
                &ScriptUpdate {
                    status: Some(ScriptStatus::Stopped),
                    last_stopped: Some(Utc::now()),
                    ..ScriptUpdate::default()
                },
            )
            .map_err(SupervisorError::Ledger)?;
        info!("script stopped");
        Ok(())
    }

    /// Stop, pause, then start a fresh chain at attempt 1.
    #[instrument(skip_all, fields(script = %script_id))]
    pub fn restart(&self, script_id: ScriptId) -> Result<LaunchOutcome, SupervisorError> {
        let entry = self.entry(script_id)?;
        self.stop(script_id)?;
        thread::sleep(self.cfg.launch.restart_delay());
        self.launcher.launch(script_id, entry.tenant)
    }

    pub fn detect(&self, path: &Path) -> Option<DetectionResult> {
        self.detector.detect(path)
    }

    /// Every supported source file under `path`, for detection failure reports.
    pub fn candidates(&self, path: &Path) -> Vec<String> {
        self.detector.candidates(path)
    }

    /// Memory and CPU of a running script; zero when not running or unknown.
    pub fn usage(&self, script_id: ScriptId) -> ResourceUsage {
        let entry = match self.deps.ledger.get_script(script_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return ResourceUsage::default(),
            Err(err) => {
                warn!(script = %script_id, err = %format!("{err:#}"), "usage lookup failed");
                return ResourceUsage::default();
            }
        };
        match self.registry.get(&entry.key()) {
            Some(record) if record.is_alive() => self.sampler.sample(record.pid()),
            _ => ResourceUsage::default(),
        }
    }

    pub fn is_running(&self, script_id: ScriptId) -> bool {
        match self.deps.ledger.get_script(script_id) {
            Ok(Some(entry)) => self.registry.is_running(&entry.key()),
            Ok(None) => false,
            Err(err) => {
                warn!(script = %script_id, err = %format!("{err:#}"), "status lookup failed");
                false
            }
        }
    }

    /// Relaunch scripts the ledger still lists as running, e.g. after a host restart.
    pub fn resume(&self) -> Result<Vec<(ScriptId, Result<LaunchOutcome, SupervisorError>)>> {
        let entries: Vec<ScriptEntry> = self.deps.ledger.list_scripts(None)?;
        let resumed = entries
            .into_iter()
            .filter(|entry| entry.status == ScriptStatus::Running)
            .map(|entry| {
                info!(script = %entry.id, "resuming script");
                (entry.id, self.launcher.launch(entry.id, entry.tenant))
            })
            .collect();
        Ok(resumed)
    }

    /// Start the monitor, cleanup, expiry and backup tasks.
    pub fn start_background(&mut self) -> Result<()> {
        let monitor_cfg = &self.cfg.monitor;

        let monitor = Arc::clone(&self.monitor);
        self.tasks
            .spawn("monitor", Duration::from_secs(monitor_cfg.interval_secs), move || {
                monitor.sweep();
            })?;

        let monitor = Arc::clone(&self.monitor);
        self.tasks.spawn(
            "cleanup",
            Duration::from_secs(monitor_cfg.cleanup_interval_secs),
            move || {
                monitor.cleanup();
            },
        )?;

        let monitor = Arc::clone(&self.monitor);
        self.tasks.spawn(
            "expiry",
            Duration::from_secs(monitor_cfg.expiry_interval_secs),
            move || {
                monitor.expire();
            },
        )?;

        let source = self.cfg.paths.ledger_path.clone();
        let backup_dir = self.cfg.paths.backup_dir.clone();
        let keep = monitor_cfg.backup_keep;
        self.tasks.spawn(
            "backup",
            Duration::from_secs(monitor_cfg.backup_interval_secs),
            move || {
                if let Err(err) = backup_file(&source, &backup_dir, keep) {
                    warn!(err = %format!("{err:#}"), "ledger backup failed");
                }
            },
        )?;

        info!(tasks = self.tasks.len(), "background tasks started");
        Ok(())
    }

    /// Stop background tasks and pending recoveries, then tear down every
    /// live subtree.
    pub fn shutdown(&mut self) {
        self.tasks.shutdown();
        self.launcher.join_relaunches();
        let records = self.registry.drain();
        for record in &records {
            self.reaper.kill_tree(record);
        }
        info!(stopped = records.len(), "supervisor shut down");
    }

    /// Ledger entry for `script_id`.
    pub fn entry(&self, script_id: ScriptId) -> Result<ScriptEntry, SupervisorError> {
        self.deps
            .ledger
            .get_script(script_id)
            .map_err(SupervisorError::Ledger)?
            .ok_or(SupervisorError::ScriptNotFound(script_id))
    }
}
