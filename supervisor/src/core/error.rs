//! Errors surfaced to callers of the supervisor.
//!
//! Recoverable crash classes (missing dependencies, launch crashes) are not
//! errors: they are [`crate::core::classifier::FailureClass`] values and
//! [`crate::launcher::LaunchOutcome`] variants. Resource query and subtree kill
//! failures are never surfaced at all.

use std::io;

use thiserror::Error;

use crate::core::types::ScriptId;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("script {0} not found")]
    ScriptNotFound(ScriptId),

    #[error("no runnable entry point found ({} candidate files)", candidates.len())]
    DetectionFailure { candidates: Vec<String> },

    #[error("entry file {entry} not found in work directory")]
    EntryNotFound {
        entry: String,
        available: Vec<String>,
    },

    #[error("{max} attempts exhausted")]
    AttemptsExhausted { max: u8 },

    #[error("script {0} is already running")]
    AlreadyRunning(ScriptId),

    #[error("tenant subscription is not active")]
    NotEntitled,

    #[error("concurrent script limit reached ({limit})")]
    ConcurrencyLimit { limit: u32 },

    #[error("spawn hosted script: {0}")]
    Spawn(#[source] io::Error),

    #[error("ledger: {0:#}")]
    Ledger(anyhow::Error),
}
