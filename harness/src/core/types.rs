//! Shared deterministic types for the harness.
//!
//! These types are the contract between the controller, the I/O adapters,
//! and callers. They hold data only; nothing here touches the filesystem or
//! spawns processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::output::{CapturedOutput, StreamId};
use crate::core::path_rules::ALL_OUTPUTS;
use crate::core::state::RunState;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Limits applied to the task process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Total console bytes kept across stdout and stderr.
    pub max_output_bytes: usize,
    /// Address-space cap (`RLIMIT_AS`).
    pub max_memory_bytes: Option<u64>,
    /// CPU-time cap in seconds (`RLIMIT_CPU`).
    pub max_cpu_secs: Option<u64>,
    /// Process count cap (`RLIMIT_NPROC`, counted per user by the kernel).
    pub max_processes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            max_memory_bytes: None,
            max_cpu_secs: None,
            max_processes: None,
        }
    }
}

impl ResourceLimits {
    /// True when any kernel-enforced limit must be set before exec.
    pub fn has_rlimits(&self) -> bool {
        self.max_memory_bytes.is_some() || self.max_cpu_secs.is_some() || self.max_processes.is_some()
    }
}

/// What to run and under which limits. Borrowed immutably for a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    /// Executable artifact: an absolute path, a relative path, or a bare name
    /// looked up on `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Input rules resolved against the configured input base.
    pub inputs: Vec<String>,
    /// Output rules; files under `outputs` that match none are policy violations.
    pub outputs: Vec<String>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: vec![ALL_OUTPUTS.to_string()],
            timeout: DEFAULT_TIMEOUT,
            limits: ResourceLimits::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn input(mut self, rule: impl Into<String>) -> Self {
        self.inputs.push(rule.into());
        self
    }

    pub fn outputs(mut self, rules: Vec<String>) -> Self {
        self.outputs = rules;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Per-run directory layout. Owned by exactly one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub root: PathBuf,
    /// Sealed read-only with mode bits. The task runs as the same user and
    /// could `chmod` them back; nothing here is a sandbox.
    pub inputs: PathBuf,
    /// Writable; empty at launch and inspected after exit.
    pub outputs: PathBuf,
    /// Task working directory, discarded at teardown.
    pub scratch: PathBuf,
}

impl Workspace {
    pub fn at(root: PathBuf) -> Self {
        Self {
            inputs: root.join("inputs"),
            outputs: root.join("outputs"),
            scratch: root.join("scratch"),
            root,
        }
    }
}

/// How the task process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskExit {
    Exited { code: i32 },
    TimedOut,
    Crashed { signal: Option<i32> },
    Cancelled,
}

impl TaskExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

/// Caller-facing classification of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
    Cancelled,
}

impl TaskStatus {
    /// Exit 0 is success unless the task wrote files its output rules do not allow.
    pub fn classify(exit: TaskExit, has_policy_violations: bool) -> Self {
        match exit {
            TaskExit::Exited { code: 0 } if !has_policy_violations => Self::Succeeded,
            TaskExit::Exited { .. } => Self::Failed,
            TaskExit::TimedOut => Self::TimedOut,
            TaskExit::Crashed { .. } => Self::Crashed,
            TaskExit::Cancelled => Self::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A file found under `outputs` after exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to `outputs`, `/`-separated.
    pub path: String,
    pub size: u64,
}

/// The well-known result file, if the task wrote one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StructuredResult {
    #[default]
    Absent,
    Valid { payload: Map<String, Value> },
    Invalid { diagnostic: String },
}

impl StructuredResult {
    pub fn payload(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Valid { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn parse_error(&self) -> Option<&str> {
        match self {
            Self::Invalid { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }

    /// The recognized `status` field, when present and valid.
    pub fn status(&self) -> Option<&str> {
        self.payload()?.get("status")?.as_str()
    }

    pub fn message(&self) -> Option<&str> {
        self.payload()?.get("message")?.as_str()
    }
}

/// Final report for one run. Built once by the collector.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task: String,
    pub status: TaskStatus,
    pub exit: TaskExit,
    pub final_state: RunState,
    pub output: CapturedOutput,
    pub files: Vec<OutputFile>,
    pub result: StructuredResult,
    /// Output files that match none of the task's output rules.
    pub policy_violations: Vec<String>,
    /// Layout used by the run. Already removed when the caller sees this.
    pub workspace: Workspace,
    pub program_sha256: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Non-fatal problems hit while collecting (unreadable files, export errors).
    pub collection_errors: Vec<String>,
}

impl TaskResult {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.code()
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.output.stream_bytes(StreamId::Stdout)
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.output.stream_bytes(StreamId::Stderr)
    }

    pub fn stdout_text(&self) -> String {
        self.output.render_stream(StreamId::Stdout)
    }

    pub fn stderr_text(&self) -> String {
        self.output.render_stream(StreamId::Stderr)
    }

    pub fn result_parse_error(&self) -> Option<&str> {
        self.result.parse_error()
    }

    pub fn file(&self, path: &str) -> Option<&OutputFile> {
        self.files.iter().find(|file| file.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_exit_to_status() {
        assert_eq!(
            TaskStatus::classify(TaskExit::Exited { code: 0 }, false),
            TaskStatus::Succeeded
        );
        assert_eq!(
            TaskStatus::classify(TaskExit::Exited { code: 2 }, false),
            TaskStatus::Failed
        );
        assert_eq!(
            TaskStatus::classify(TaskExit::Exited { code: 0 }, true),
            TaskStatus::Failed
        );
        assert_eq!(
            TaskStatus::classify(TaskExit::TimedOut, false),
            TaskStatus::TimedOut
        );
        assert_eq!(
            TaskStatus::classify(TaskExit::Crashed { signal: Some(9) }, false),
            TaskStatus::Crashed
        );
        assert_eq!(
            TaskStatus::classify(TaskExit::Cancelled, false),
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn workspace_layout_is_rooted() {
        let workspace = Workspace::at(PathBuf::from("/tmp/ws"));
        assert_eq!(workspace.inputs, PathBuf::from("/tmp/ws/inputs"));
        assert_eq!(workspace.outputs, PathBuf::from("/tmp/ws/outputs"));
        assert_eq!(workspace.scratch, PathBuf::from("/tmp/ws/scratch"));
    }

    #[test]
    fn exit_serializes_with_kind_tag() {
        let json = serde_json::to_value(TaskExit::Exited { code: 3 }).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "exited", "code": 3}));
        let json = serde_json::to_value(TaskExit::TimedOut).expect("serialize");
        assert_eq!(json, serde_json::json!({"kind": "timed_out"}));
    }

    #[test]
    fn structured_result_accessors() {
        let mut payload = Map::new();
        payload.insert("status".into(), Value::from("success"));
        payload.insert("message".into(), Value::from("ok"));
        let result = StructuredResult::Valid { payload };
        assert_eq!(result.status(), Some("success"));
        assert_eq!(result.message(), Some("ok"));
        assert!(result.parse_error().is_none());

        let invalid = StructuredResult::Invalid {
            diagnostic: "bad".into(),
        };
        assert_eq!(invalid.parse_error(), Some("bad"));
        assert!(invalid.payload().is_none());
    }
}
