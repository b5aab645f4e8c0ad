//! Per-script lifecycle state machine.
//!
//! ```text
//! Stopped -> Starting -> Running | Crashed
//! Running -> Stopped            (explicit stop, ban, subscription expiry)
//! Crashed -> Starting           (automatic or manual retry)
//! Crashed -> Stopped            (attempts exhausted or retry ineligible)
//! ```
//!
//! `Starting -> Starting` covers the next attempt of one chain and
//! `Starting -> Stopped` a stop request racing a launch.

use crate::core::types::ScriptStatus;

/// Whether the ledger may move a script from `from` to `to`.
pub fn can_transition(from: ScriptStatus, to: ScriptStatus) -> bool {
    use ScriptStatus::{Crashed, Running, Starting, Stopped};
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Starting)
            | (Starting, Running)
            | (Starting, Crashed)
            | (Starting, Stopped)
            | (Running, Stopped)
            | (Running, Crashed)
            | (Running, Starting)
            | (Crashed, Starting)
            | (Crashed, Stopped)
    ) || from == to
}
