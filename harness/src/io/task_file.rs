//! Task file parsing and validation.
//!
//! Task files are TOML documents describing one executable artifact, its
//! inputs, its output rules, and its limits.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::core::path_rules::{ALL_OUTPUTS, is_safe_config_path, normalize_output_rule};
use crate::core::types::{ResourceLimits, TaskSpec};
use crate::core::units::{parse_memory, parse_timeout};
use crate::io::config::HarnessConfig;

/// A parsed task file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub task: TaskMeta,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TaskMeta {
    /// Identifier (slug format: `[a-z0-9_-]+`), used in workspace names.
    pub name: String,
    /// Program to execute. Relative paths resolve against the task file's directory.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Wall-clock timeout such as `30s` or `10m`.
    pub timeout: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output rules; everything under `outputs` is allowed when omitted.
    pub outputs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    pub max_output_bytes: Option<usize>,
    /// Address-space cap such as `512M` or `2G`.
    pub memory: Option<String>,
    pub cpu_secs: Option<u64>,
    pub processes: Option<u64>,
}

impl TaskFile {
    /// Load and validate a task file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
        let task: TaskFile =
            toml::from_str(&contents).with_context(|| format!("parse task {}", path.display()))?;
        task.validate()
            .with_context(|| format!("validate task {}", path.display()))?;
        Ok(task)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let task: TaskFile = toml::from_str(contents).context("parse task")?;
        task.validate()?;
        Ok(task)
    }

    fn validate(&self) -> Result<()> {
        validate_task_name(&self.task.name)?;
        if self.task.program.trim().is_empty() {
            bail!("task.program must be non-empty");
        }
        if let Some(timeout) = &self.task.timeout {
            parse_timeout(timeout).context("task.timeout invalid")?;
        }
        for (index, rule) in self.task.inputs.iter().enumerate() {
            if !is_safe_config_path(rule) {
                bail!("task.inputs[{index}] {rule:?} must be a relative path without '..'");
            }
        }
        if let Some(outputs) = &self.task.outputs {
            if outputs.is_empty() {
                bail!("task.outputs must be non-empty when set");
            }
            for (index, rule) in outputs.iter().enumerate() {
                if normalize_output_rule(rule) != ALL_OUTPUTS && !is_safe_config_path(rule) {
                    bail!("task.outputs[{index}] {rule:?} must be a relative path without '..'");
                }
            }
        }
        for key in self.env.keys() {
            if key.trim().is_empty() || key.contains('=') {
                bail!("env key {key:?} is invalid");
            }
        }
        if self.limits.max_output_bytes == Some(0) {
            bail!("limits.max_output_bytes must be > 0");
        }
        if let Some(memory) = &self.limits.memory {
            parse_memory(memory).context("limits.memory invalid")?;
        }
        if self.limits.cpu_secs == Some(0) {
            bail!("limits.cpu_secs must be > 0");
        }
        if self.limits.processes == Some(0) {
            bail!("limits.processes must be > 0");
        }
        Ok(())
    }

    /// Resolve the file into a runnable spec, filling gaps from `config`.
    pub fn into_spec(self, config: &HarnessConfig, base_dir: &Path) -> Result<TaskSpec> {
        let timeout = match &self.task.timeout {
            Some(timeout) => parse_timeout(timeout)?,
            None => config.default_timeout(),
        };
        let limits = ResourceLimits {
            max_output_bytes: self
                .limits
                .max_output_bytes
                .unwrap_or(config.max_output_bytes),
            max_memory_bytes: self.limits.memory.as_deref().map(parse_memory).transpose()?,
            max_cpu_secs: self.limits.cpu_secs,
            max_processes: self.limits.processes,
        };
        let program = resolve_program(&self.task.program, base_dir);
        let mut spec = TaskSpec::new(self.task.name, program)
            .timeout(timeout)
            .limits(limits);
        spec.args = self.task.args;
        spec.env = self.env;
        spec.inputs = self.task.inputs;
        if let Some(outputs) = self.task.outputs {
            spec = spec.outputs(outputs);
        }
        Ok(spec)
    }
}

/// Load a task file and resolve it against its own directory.
pub fn load_spec(path: &Path, config: &HarnessConfig) -> Result<TaskSpec> {
    let task = TaskFile::load(path)?;
    let base_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    task.into_spec(config, base_dir)
        .with_context(|| format!("resolve task {}", path.display()))
}

/// Bare names are looked up on `PATH`; anything with a separator is a path.
fn resolve_program(program: &str, base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(program.trim());
    if path.is_absolute() || !program.contains('/') {
        path
    } else {
        base_dir.join(path)
    }
}

fn validate_task_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("task.name must be non-empty");
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("task.name must use [a-z0-9_-] only");
    }
    Ok(())
}
