//! Test-only collaborators, fake process handles and work-directory fixtures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::types::{RuntimeKind, ScriptId, ScriptStatus, TenantId};
use crate::io::config::SupervisorConfig;
use crate::io::entitlement::Entitlement;
use crate::io::handle::ProcessHandle;
use crate::io::installer::{DependencyInstaller, InstallOutcome};
use crate::io::ledger::{Ledger, ScriptEntry, ScriptUpdate};
use crate::io::notifier::Notifier;
use crate::launcher::Collaborators;

#[derive(Debug)]
struct FakeState {
    alive: bool,
    exit_code: Option<i32>,
    ignores_terminate: bool,
    terminate_calls: usize,
    kill_calls: usize,
}

/// Scripted process handle. Clones share state, so a test can keep one clone
/// and hand the other to a record.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pid: u32,
    group: Option<u32>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcess {
    pub fn running(pid: u32) -> Self {
        Self {
            pid,
            group: None,
            state: Arc::new(Mutex::new(FakeState {
                alive: true,
                exit_code: None,
                ignores_terminate: false,
                terminate_calls: 0,
                kill_calls: 0,
            })),
        }
    }

    pub fn exited(pid: u32, code: i32) -> Self {
        let process = Self::running(pid);
        process.exit(code);
        process
    }

    /// Terminate requests are counted but do not stop the process.
    pub fn ignoring_terminate(self) -> Self {
        self.state.lock().expect("fake state").ignores_terminate = true;
        self
    }

    /// Report `pgid` as the process group, so teardown signals a real group.
    pub fn in_group(mut self, pgid: u32) -> Self {
        self.group = Some(pgid);
        self
    }

    pub fn exit(&self, code: i32) {
        let mut state = self.state.lock().expect("fake state");
        state.alive = false;
        state.exit_code = Some(code);
    }

    pub fn is_alive_now(&self) -> bool {
        self.state.lock().expect("fake state").alive
    }

    pub fn terminate_calls(&self) -> usize {
        self.state.lock().expect("fake state").terminate_calls
    }

    pub fn kill_calls(&self) -> usize {
        self.state.lock().expect("fake state").kill_calls
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.is_alive_now()
    }

    fn exit_code(&self) -> Option<i32> {
        self.state.lock().expect("fake state").exit_code
    }

    fn terminate(&self) {
        let mut state = self.state.lock().expect("fake state");
        if !state.alive {
            return;
        }
        state.terminate_calls += 1;
        if !state.ignores_terminate {
            state.alive = false;
        }
    }

    fn kill(&self) {
        let mut state = self.state.lock().expect("fake state");
        if !state.alive {
            return;
        }
        state.kill_calls += 1;
        state.alive = false;
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive_now() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn children(&self) -> Vec<u32> {
        Vec::new()
    }

    fn process_group(&self) -> Option<u32> {
        self.group
    }
}

/// In-memory ledger that also keeps the status history of every script.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    scripts: Mutex<BTreeMap<ScriptId, ScriptEntry>>,
    history: Mutex<Vec<(ScriptId, ScriptStatus)>>,
}

impl MemoryLedger {
    pub fn insert(&self, entry: ScriptEntry) {
        self.scripts.lock().expect("ledger").insert(entry.id, entry);
    }

    pub fn entry(&self, id: ScriptId) -> Option<ScriptEntry> {
        self.scripts.lock().expect("ledger").get(&id).cloned()
    }

    /// Statuses written for `id`, oldest first.
    pub fn statuses(&self, id: ScriptId) -> Vec<ScriptStatus> {
        self.history
            .lock()
            .expect("history")
            .iter()
            .filter(|(script, _)| *script == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl Ledger for MemoryLedger {
    fn get_script(&self, id: ScriptId) -> Result<Option<ScriptEntry>> {
        Ok(self.entry(id))
    }

    fn update_script(&self, id: ScriptId, update: &ScriptUpdate) -> Result<()> {
        let mut scripts = self.scripts.lock().expect("ledger");
        let entry = scripts
            .get_mut(&id)
            .ok_or_else(|| anyhow!("script {id} not in ledger"))?;
        entry.apply(update);
        if let Some(status) = update.status {
            self.history.lock().expect("history").push((id, status));
        }
        Ok(())
    }

    fn list_scripts(&self, tenant: Option<TenantId>) -> Result<Vec<ScriptEntry>> {
        Ok(self
            .scripts
            .lock()
            .expect("ledger")
            .values()
            .filter(|entry| tenant.is_none_or(|t| entry.tenant == t))
            .cloned()
            .collect())
    }
}

/// Entitlement with the same answer for every tenant.
#[derive(Debug)]
pub struct StaticEntitlement {
    active: AtomicBool,
    auto_restart: AtomicBool,
    max_scripts: Option<u32>,
}

impl StaticEntitlement {
    pub fn new(active: bool, auto_restart: bool, max_scripts: Option<u32>) -> Self {
        Self {
            active: AtomicBool::new(active),
            auto_restart: AtomicBool::new(auto_restart),
            max_scripts,
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn set_auto_restart(&self, auto_restart: bool) {
        self.auto_restart.store(auto_restart, Ordering::SeqCst);
    }
}

impl Entitlement for StaticEntitlement {
    fn is_active(&self, _tenant: TenantId) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn plan_allows_auto_restart(&self, _tenant: TenantId) -> bool {
        self.auto_restart.load(Ordering::SeqCst)
    }

    fn max_concurrent_scripts(&self, _tenant: TenantId) -> Option<u32> {
        self.max_scripts
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(TenantId, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(TenantId, String)> {
        self.messages.lock().expect("messages").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages
            .lock()
            .expect("messages")
            .iter()
            .any(|(_, text)| text.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, tenant: TenantId, text: &str) {
        self.messages
            .lock()
            .expect("messages")
            .push((tenant, text.to_string()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallCall {
    Manifest(RuntimeKind),
    Module(RuntimeKind, String),
}

/// Installer that records calls. A module install can drop a marker file into
/// the work directory so scripted entry files can change behaviour afterwards.
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    calls: Mutex<Vec<InstallCall>>,
    marker: Option<String>,
    fail_modules: bool,
}

impl RecordingInstaller {
    pub fn with_marker(marker: &str) -> Self {
        Self {
            marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_modules: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<InstallCall> {
        self.calls.lock().expect("calls").clone()
    }
}

impl DependencyInstaller for RecordingInstaller {
    fn install_manifest(&self, _work_dir: &Path, runtime: RuntimeKind) -> InstallOutcome {
        self.calls
            .lock()
            .expect("calls")
            .push(InstallCall::Manifest(runtime));
        InstallOutcome::Skipped
    }

    fn install_module(&self, work_dir: &Path, runtime: RuntimeKind, module: &str) -> InstallOutcome {
        self.calls
            .lock()
            .expect("calls")
            .push(InstallCall::Module(runtime, module.to_string()));
        if self.fail_modules {
            return InstallOutcome::Failed("scripted failure".to_string());
        }
        if let Some(marker) = &self.marker {
            fs::write(work_dir.join(marker), module).expect("write install marker");
        }
        InstallOutcome::Installed
    }
}

/// Scratch root holding tenant work directories plus the supervisor's own
/// data and log directories.
pub struct Workspace {
    pub temp: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Create (or reuse) a work directory under the root.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        let dir = self.root().join("work").join(name);
        fs::create_dir_all(&dir).expect("create work dir");
        dir
    }

    /// Write `contents` to `rel` inside `dir`, creating parents.
    pub fn write(&self, dir: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write file");
        path
    }

    /// Config rooted in this workspace with `sh` as runtime A and short windows.
    pub fn fast_config(&self) -> SupervisorConfig {
        let mut cfg = SupervisorConfig::default();
        cfg.paths.data_dir = self.root().join("data");
        cfg.paths.logs_dir = self.root().join("logs");
        cfg.paths.ledger_path = self.root().join("data/scripts.json");
        cfg.paths.backup_dir = self.root().join("backups");
        cfg.runtimes.python = vec!["sh".to_string()];
        cfg.runtimes.node = vec!["sh".to_string()];
        cfg.launch.startle_primary_ms = 300;
        cfg.launch.startle_secondary_ms = 200;
        cfg.launch.retry_delay_ms = 10;
        cfg.launch.restart_delay_ms = 10;
        cfg.monitor.recovery_backoff_secs = 0;
        cfg.reaper.child_grace_ms = 500;
        cfg.reaper.root_grace_ms = 500;
        cfg.reaper.poll_interval_ms = 20;
        cfg.sampler.cpu_window_ms = 50;
        cfg
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Collaborator bundle built from the given test doubles.
pub fn collaborators(
    ledger: Arc<MemoryLedger>,
    entitlement: Arc<StaticEntitlement>,
    notifier: Arc<RecordingNotifier>,
    installer: Arc<RecordingInstaller>,
) -> Collaborators {
    Collaborators {
        ledger,
        entitlement,
        notifier,
        installer,
    }
}
