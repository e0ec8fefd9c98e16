//! Test-only helpers for running shell tasks in throwaway directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::controller::{Harness, HarnessError, RunOptions};
use crate::core::types::{TaskResult, TaskSpec};
use crate::io::config::HarnessConfig;

/// A harness rooted in a temporary directory.
///
/// Layout: `<temp>/workspaces` for run workspaces, `<temp>/base` for inputs.
pub struct TestHarness {
    temp: TempDir,
    harness: Harness,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    /// Build with short kill and drain timeouts, then let the caller adjust.
    pub fn with_config(adjust: impl FnOnce(&mut HarnessConfig)) -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let base = temp.path().join("base");
        fs::create_dir_all(&base).with_context(|| format!("create {}", base.display()))?;
        let mut config = HarnessConfig {
            workspace_root: temp.path().join("workspaces"),
            input_base: base,
            kill_grace_ms: 200,
            drain_timeout_ms: 1_000,
            ..HarnessConfig::default()
        };
        adjust(&mut config);
        let harness = Harness::new(config)?;
        Ok(Self { temp, harness })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    pub fn workspace_root(&self) -> &Path {
        &self.harness.config().workspace_root
    }

    pub fn input_base(&self) -> &Path {
        &self.harness.config().input_base
    }

    /// Write a file under the input base, creating parent directories.
    pub fn write_input(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.input_base().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Number of entries left under the workspace root.
    pub fn workspace_count(&self) -> Result<usize> {
        let root = self.workspace_root();
        if !root.exists() {
            return Ok(0);
        }
        Ok(fs::read_dir(root)
            .with_context(|| format!("read {}", root.display()))?
            .count())
    }

    pub async fn run(&self, spec: &TaskSpec) -> Result<TaskResult, HarnessError> {
        self.harness.run(spec).await
    }

    pub async fn run_with(
        &self,
        spec: &TaskSpec,
        options: RunOptions,
    ) -> Result<TaskResult, HarnessError> {
        self.harness.run_with(spec, options).await
    }
}

/// A task that runs `script` with `/bin/sh -c` and a 30 second timeout.
pub fn shell_task(name: &str, script: &str) -> TaskSpec {
    TaskSpec::new(name, "/bin/sh")
        .arg("-c")
        .arg(script)
        .timeout(Duration::from_secs(30))
}
