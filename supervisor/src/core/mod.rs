//! Deterministic, pure logic shared by the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod attempt;
pub mod classifier;
pub mod error;
pub mod lifecycle;
pub mod recovery;
pub mod text;
pub mod types;
