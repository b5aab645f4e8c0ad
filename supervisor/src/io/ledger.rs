//! Script metadata ledger: the collaborator that persists entry files,
//! statuses and restart counters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::lifecycle::can_transition;
use crate::core::types::{Confidence, RuntimeKind, ScriptId, ScriptKey, ScriptStatus, TenantId};

/// One hosted script as recorded by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptEntry {
    pub id: ScriptId,
    pub tenant: TenantId,
    pub name: String,
    pub work_dir: PathBuf,
    /// Entry file relative to `work_dir`.
    pub entry_file: String,
    pub runtime: RuntimeKind,
    /// Exposed to the script through the configured secret variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub status: ScriptStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub detection_confidence: Option<Confidence>,
    #[serde(default)]
    pub total_restarts: u32,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_stopped: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_crash: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_log: Option<String>,
}

impl ScriptEntry {
    pub fn new(
        id: ScriptId,
        tenant: TenantId,
        name: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        entry_file: impl Into<String>,
        runtime: RuntimeKind,
    ) -> Self {
        Self {
            id,
            tenant,
            name: name.into(),
            work_dir: work_dir.into(),
            entry_file: entry_file.into(),
            runtime,
            secret: None,
            status: ScriptStatus::Stopped,
            pid: None,
            detection_confidence: None,
            total_restarts: 0,
            last_started: None,
            last_stopped: None,
            last_crash: None,
            error_log: None,
        }
    }

    pub fn key(&self) -> ScriptKey {
        ScriptKey::new(self.tenant, self.name.clone())
    }

    /// Apply a partial update. Leaving Running or Starting for a resting status clears the pid.
    pub fn apply(&mut self, update: &ScriptUpdate) {
        if let Some(entry_file) = &update.entry_file {
            self.entry_file.clone_from(entry_file);
        }
        if let Some(runtime) = update.runtime {
            self.runtime = runtime;
        }
        if let Some(confidence) = update.detection_confidence {
            self.detection_confidence = Some(confidence);
        }
        if let Some(status) = update.status {
            if !can_transition(self.status, status) {
                warn!(script = %self.id, from = %self.status, to = %status, "unexpected status transition");
            }
            self.status = status;
            if matches!(status, ScriptStatus::Stopped | ScriptStatus::Crashed) {
                self.pid = None;
            }
        }
        if let Some(pid) = update.pid {
            self.pid = Some(pid);
        }
        if let Some(at) = update.last_started {
            self.last_started = Some(at);
        }
        if let Some(at) = update.last_stopped {
            self.last_stopped = Some(at);
        }
        if let Some(at) = update.last_crash {
            self.last_crash = Some(at);
        }
        if let Some(error_log) = &update.error_log {
            self.error_log = Some(error_log.clone());
        }
        if update.increment_restarts {
            self.total_restarts = self.total_restarts.saturating_add(1);
        }
    }
}

/// Partial update of a [`ScriptEntry`]; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptUpdate {
    pub entry_file: Option<String>,
    pub runtime: Option<RuntimeKind>,
    pub detection_confidence: Option<Confidence>,
    pub status: Option<ScriptStatus>,
    pub pid: Option<u32>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
    pub last_crash: Option<DateTime<Utc>>,
    pub error_log: Option<String>,
    pub increment_restarts: bool,
}

impl ScriptUpdate {
    pub fn status(status: ScriptStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Storage-agnostic access to script metadata.
pub trait Ledger: Send + Sync {
    fn get_script(&self, id: ScriptId) -> Result<Option<ScriptEntry>>;
    fn update_script(&self, id: ScriptId, update: &ScriptUpdate) -> Result<()>;
    fn list_scripts(&self, tenant: Option<TenantId>) -> Result<Vec<ScriptEntry>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    scripts: Vec<ScriptEntry>,
}

/// Ledger persisted as one JSON document, rewritten atomically on every update.
#[derive(Debug)]
pub struct JsonLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace an entry by id.
    pub fn upsert(&self, entry: ScriptEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        match file.scripts.iter_mut().find(|s| s.id == entry.id) {
            Some(existing) => *existing = entry,
            None => file.scripts.push(entry),
        }
        self.store(&file)
    }

    fn load(&self) -> Result<LedgerFile> {
        if !self.path.exists() {
            return Ok(LedgerFile::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse ledger {}", self.path.display()))
    }

    fn store(&self, file: &LedgerFile) -> Result<()> {
        debug!(path = %self.path.display(), scripts = file.scripts.len(), "writing ledger");
        let mut buf = serde_json::to_string_pretty(file).context("serialize ledger")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

impl Ledger for JsonLedger {
    fn get_script(&self, id: ScriptId) -> Result<Option<ScriptEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.scripts.into_iter().find(|s| s.id == id))
    }

    fn update_script(&self, id: ScriptId, update: &ScriptUpdate) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        let entry = file
            .scripts
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("script {id} not in ledger"))?;
        entry.apply(update);
        self.store(&file)
    }

    fn list_scripts(&self, tenant: Option<TenantId>) -> Result<Vec<ScriptEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scripts: Vec<ScriptEntry> = self
            .load()?
            .scripts
            .into_iter()
            .filter(|s| tenant.is_none_or(|t| s.tenant == t))
            .collect();
        scripts.sort_by_key(|s| s.id);
        Ok(scripts)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("ledger path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp ledger {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace ledger {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, tenant: u64) -> ScriptEntry {
        ScriptEntry::new(
            ScriptId(id),
            TenantId(tenant),
            format!("bot{id}"),
            "/srv/work",
            "main.py",
            RuntimeKind::Python,
        )
    }

    #[test]
    fn missing_file_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = JsonLedger::new(temp.path().join("scripts.json"));
        assert!(ledger.list_scripts(None).expect("list").is_empty());
        assert!(ledger.get_script(ScriptId(1)).expect("get").is_none());
    }

    #[test]
    fn updates_persist_across_instances() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data/scripts.json");
        let ledger = JsonLedger::new(&path);
        ledger.upsert(entry(1, 10)).expect("upsert");

        let started = Utc::now();
        ledger
            .update_script(
                ScriptId(1),
                &ScriptUpdate {
                    status: Some(ScriptStatus::Starting),
                    ..ScriptUpdate::default()
                },
            )
            .expect("starting");
        ledger
            .update_script(
                ScriptId(1),
                &ScriptUpdate {
                    status: Some(ScriptStatus::Running),
                    pid: Some(4242),
                    last_started: Some(started),
                    increment_restarts: true,
                    ..ScriptUpdate::default()
                },
            )
            .expect("running");

        let reopened = JsonLedger::new(&path);
        let loaded = reopened.get_script(ScriptId(1)).expect("get").expect("present");
        assert_eq!(loaded.status, ScriptStatus::Running);
        assert_eq!(loaded.pid, Some(4242));
        assert_eq!(loaded.last_started, Some(started));
        assert_eq!(loaded.total_restarts, 1);
        assert_eq!(loaded.entry_file, "main.py");
    }

    #[test]
    fn resting_status_clears_pid() {
        let mut script = entry(1, 1);
        script.apply(&ScriptUpdate {
            status: Some(ScriptStatus::Starting),
            ..ScriptUpdate::default()
        });
        script.apply(&ScriptUpdate {
            status: Some(ScriptStatus::Running),
            pid: Some(7),
            ..ScriptUpdate::default()
        });
        script.apply(&ScriptUpdate::status(ScriptStatus::Crashed));
        assert_eq!(script.pid, None);
    }

    #[test]
    fn list_filters_by_tenant() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = JsonLedger::new(temp.path().join("scripts.json"));
        ledger.upsert(entry(2, 10)).expect("upsert");
        ledger.upsert(entry(1, 10)).expect("upsert");
        ledger.upsert(entry(3, 11)).expect("upsert");

        let ids: Vec<u64> = ledger
            .list_scripts(Some(TenantId(10)))
            .expect("list")
            .iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(ledger.list_scripts(None).expect("list").len(), 3);
    }

    #[test]
    fn updating_unknown_script_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = JsonLedger::new(temp.path().join("scripts.json"));
        let err = ledger
            .update_script(ScriptId(9), &ScriptUpdate::status(ScriptStatus::Stopped))
            .unwrap_err();
        assert!(err.to_string().contains("not in ledger"));
    }
}
