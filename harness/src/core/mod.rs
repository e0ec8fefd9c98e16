//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod output;
pub mod path_rules;
pub mod state;
pub mod types;
pub mod units;
