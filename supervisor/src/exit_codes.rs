//! Stable exit codes for the `supervisor` CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unknown script, ledger failure or any other error.
pub const INVALID: i32 = 1;
/// `supervisor detect` found no runnable entry point.
pub const NO_ENTRY: i32 = 2;
