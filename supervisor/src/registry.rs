//! Process registry: the live supervision records, one per script key.
//!
//! The map lock is held only for insert, remove and lookup. Liveness checks
//! and every other blocking call run on a cloned `Arc` after the lock is
//! released. Callers only ever receive snapshots.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::attempt::Attempt;
use crate::core::types::{RuntimeKind, ScriptId, ScriptKey, TenantId};
use crate::io::handle::ProcessHandle;

/// Where and how a record's process was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub work_dir: PathBuf,
    /// Absolute path of the resolved entry file.
    pub entry_path: PathBuf,
    pub runtime: RuntimeKind,
    pub log_path: PathBuf,
}

/// One launched script instance.
#[derive(Debug)]
pub struct SupervisionRecord {
    pub key: ScriptKey,
    pub script_id: ScriptId,
    pub process: Box<dyn ProcessHandle>,
    pub target: LaunchTarget,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub attempt: Attempt,
    log: Mutex<Option<File>>,
    settled: AtomicBool,
}

impl SupervisionRecord {
    pub fn new(
        key: ScriptKey,
        script_id: ScriptId,
        process: Box<dyn ProcessHandle>,
        target: LaunchTarget,
        attempt: Attempt,
        log: Option<File>,
    ) -> Self {
        Self {
            key,
            script_id,
            process,
            target,
            started_at: Utc::now(),
            started: Instant::now(),
            attempt,
            log: Mutex::new(log),
            settled: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// Release the supervisor's log handle. Idempotent.
    pub fn close_log(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.take().is_some() {
            debug!(key = %self.key, "log handle closed");
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn log_open(&self) -> bool {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Mark the startle check as finished; from here on the monitor owns crash handling.
    pub fn mark_settled(&self) {
        self.settled.store(true, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Concurrency-safe store of live supervision records.
#[derive(Debug, Default)]
pub struct Registry {
    records: Mutex<HashMap<ScriptKey, Arc<SupervisionRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ScriptKey, Arc<SupervisionRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record, returning whichever record it displaced.
    pub fn register(&self, record: Arc<SupervisionRecord>) -> Option<Arc<SupervisionRecord>> {
        let key = record.key.clone();
        let displaced = self.map().insert(key.clone(), record);
        debug!(key = %key, displaced = displaced.is_some(), "record registered");
        displaced
    }

    pub fn get(&self, key: &ScriptKey) -> Option<Arc<SupervisionRecord>> {
        self.map().get(key).cloned()
    }

    /// Remove the record for `key` and close its log. Does not kill the process.
    pub fn remove(&self, key: &ScriptKey) -> Option<Arc<SupervisionRecord>> {
        let removed = self.map().remove(key);
        if let Some(record) = &removed {
            record.close_log();
            debug!(key = %key, "record removed");
        }
        removed
    }

    /// Remove `record` only if it is still the live record for its key.
    ///
    /// Returns `false` when another caller already removed or replaced it.
    pub fn remove_if_same(&self, record: &Arc<SupervisionRecord>) -> bool {
        let removed = {
            let mut map = self.map();
            match map.get(&record.key) {
                Some(current) if Arc::ptr_eq(current, record) => map.remove(&record.key),
                _ => None,
            }
        };
        match removed {
            Some(record) => {
                record.close_log();
                debug!(key = %record.key, "record removed");
                true
            }
            None => false,
        }
    }

    /// Whether the key has a record whose process is alive. Zombies count as not running.
    pub fn is_running(&self, key: &ScriptKey) -> bool {
        let record = self.get(key);
        record.is_some_and(|record| record.is_alive())
    }

    /// Point-in-time copy of the live records.
    pub fn snapshot(&self) -> Vec<Arc<SupervisionRecord>> {
        let mut records: Vec<_> = self.map().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Live records of `tenant`. Dead records awaiting a sweep are not counted.
    pub fn running_for_tenant(&self, tenant: TenantId) -> usize {
        let held: Vec<Arc<SupervisionRecord>> = self
            .map()
            .values()
            .filter(|record| record.key.tenant == tenant)
            .cloned()
            .collect();
        held.iter().filter(|record| record.is_alive()).count()
    }

    /// Remove every record, returning them for teardown.
    pub fn drain(&self) -> Vec<Arc<SupervisionRecord>> {
        let drained: Vec<_> = self.map().drain().map(|(_, record)| record).collect();
        for record in &drained {
            record.close_log();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}
