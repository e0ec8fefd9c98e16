//! Harness configuration, usually stored as `harness.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path_rules::is_safe_config_path;
use crate::core::types::{DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_TIMEOUT};

pub const DEFAULT_CONFIG_PATH: &str = "harness.toml";

/// Harness configuration (TOML).
///
/// Every path the harness touches is derived from this value; nothing is
/// read from the environment. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory under which per-run workspaces are created.
    pub workspace_root: PathBuf,

    /// Directory that task input rules are resolved against.
    pub input_base: PathBuf,

    /// Well-known structured result file name inside `outputs`.
    pub result_file: String,

    /// Timeout for task files that do not declare one.
    pub default_timeout_secs: u64,

    /// Console budget for task files that do not declare one.
    pub max_output_bytes: usize,

    /// Time between SIGTERM and SIGKILL when stopping a task.
    pub kill_grace_ms: u64,

    /// How long to keep draining pipes after the task has stopped.
    pub drain_timeout_ms: u64,

    /// Pass the harness environment through to tasks.
    pub inherit_env: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".harness/workspaces"),
            input_base: PathBuf::from("."),
            result_file: "result.json".to_string(),
            default_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_output_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            kill_grace_ms: 2_000,
            drain_timeout_ms: 5_000,
            inherit_env: true,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(anyhow!("workspace_root must be non-empty"));
        }
        if self.input_base.as_os_str().is_empty() {
            return Err(anyhow!("input_base must be non-empty"));
        }
        if !is_safe_config_path(&self.result_file)
            || self.result_file.contains(['/', '\\'])
        {
            return Err(anyhow!(
                "result_file must be a plain file name, got {:?}",
                self.result_file
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(anyhow!("default_timeout_secs must be > 0"));
        }
        if self.max_output_bytes == 0 {
            return Err(anyhow!("max_output_bytes must be > 0"));
        }
        if self.drain_timeout_ms == 0 {
            return Err(anyhow!("drain_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        let cfg = HarnessConfig {
            workspace_root: temp.path().join("ws"),
            kill_grace_ms: 50,
            inherit_env: false,
            ..HarnessConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "max_output_bytes = 42\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_output_bytes, 42);
        assert_eq!(cfg.result_file, "result.json");
    }

    #[test]
    fn rejects_nested_result_file() {
        let cfg = HarnessConfig {
            result_file: "nested/result.json".to_string(),
            ..HarnessConfig::default()
        };
        let err = cfg.validate().expect_err("nested result file");
        assert!(err.to_string().contains("result_file"));
    }

    #[test]
    fn rejects_zero_budget() {
        let cfg = HarnessConfig {
            max_output_bytes: 0,
            ..HarnessConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
