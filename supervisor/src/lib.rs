//! Process supervisor for hosted tenant scripts.
//!
//! Tenants upload Python (`.py`) or Node (`.js`) scripts into isolated work
//! directories; the supervisor runs each one as an independent child process
//! and keeps it alive. The crate is split the usual way:
//!
//! - **[`core`]**: Pure, deterministic logic (attempt bound, lifecycle,
//!   crash-log classification, recovery eligibility). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, entry-point detection,
//!   package installs, OS processes, log files, collaborator stores).
//!
//! Orchestration modules ([`registry`], [`reaper`], [`launcher`], [`monitor`],
//! [`tasks`]) combine the two, and [`supervisor::Supervisor`] is the facade
//! the UI layer and the CLI call into.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod launcher;
pub mod logging;
pub mod monitor;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
