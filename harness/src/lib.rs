//! Task execution harness.
//!
//! Runs one externally supplied executable under a fixed filesystem contract:
//! inputs are staged into a read-only directory, results go to a writable
//! outputs directory, console output is captured under a byte budget, and a
//! wall-clock timeout is enforced. Every run ends in a structured
//! [`core::types::TaskResult`]. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, path rules,
//!   capture accounting, result types). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (workspaces, process launch, pipe
//!   draining, result collection, config and task files).
//!
//! [`controller`] coordinates the two to implement a run.
//!
//! ```no_run
//! use harness::controller::Harness;
//! use harness::core::types::TaskSpec;
//! use harness::io::config::HarnessConfig;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let harness = Harness::new(HarnessConfig::default())?;
//! let spec = TaskSpec::new("hello", "/bin/sh").arg("-c").arg("echo hi");
//! let result = harness.run(&spec).await?;
//! println!("{}", result.status.as_str());
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
