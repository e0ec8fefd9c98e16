//! Post-exit inspection of the outputs directory.
//!
//! The collector only reads. Raw file enumeration is authoritative; the
//! structured result file is optional and a broken one never fails the run.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::output::CapturedOutput;
use crate::core::path_rules::{is_path_allowed, to_posix};
use crate::core::state::RunState;
use crate::core::types::{
    OutputFile, StructuredResult, TaskExit, TaskResult, TaskSpec, TaskStatus, Workspace,
};

const RESULT_SCHEMA: &str = include_str!("../../../schemas/result.schema.json");

/// Larger result files are rejected unread.
pub const MAX_RESULT_BYTES: u64 = 1024 * 1024;

static RESULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(RESULT_SCHEMA).expect("result schema is valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("result schema compiles")
});

/// Everything the collector needs from one finished run.
#[derive(Debug)]
pub struct CollectInput<'a> {
    pub spec: &'a TaskSpec,
    pub workspace: &'a Workspace,
    /// File name of the structured result inside `outputs`.
    pub result_file: &'a str,
    /// Resolved program path, hashed when it names a file.
    pub program: Option<&'a Path>,
    pub exit: TaskExit,
    pub state: RunState,
    pub output: CapturedOutput,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Build the run's result from the exit, the captured output, and `outputs`.
#[instrument(skip_all, fields(task = %input.spec.name, exit = ?input.exit))]
pub fn collect(input: CollectInput<'_>) -> TaskResult {
    let mut errors = Vec::new();

    let files = match list_output_files(&input.workspace.outputs) {
        Ok(files) => files,
        Err(err) => {
            errors.push(format!("outputs: {err:#}"));
            Vec::new()
        }
    };

    let result = read_structured_result(&input.workspace.outputs, input.result_file);
    if let Some(diagnostic) = result.parse_error() {
        warn!(file = input.result_file, %diagnostic, "structured result rejected");
    }

    let policy_violations = find_policy_violations(&files, &input.spec.outputs, input.result_file);
    if !policy_violations.is_empty() {
        warn!(violations = ?policy_violations, "task wrote outputs outside its rules");
    }

    let program_sha256 = match input.program.filter(|path| is_regular_file(path)) {
        Some(path) => match file_sha256(path) {
            Ok(hash) => Some(hash),
            Err(err) => {
                errors.push(format!("program hash: {err:#}"));
                None
            }
        },
        None => None,
    };

    if !errors.is_empty() {
        warn!(errors = ?errors, "collection had errors");
    }

    let status = TaskStatus::classify(input.exit, !policy_violations.is_empty());
    let duration_ms = (input.finished_at - input.started_at)
        .num_milliseconds()
        .max(0) as u64;
    debug!(status = status.as_str(), files = files.len(), duration_ms, "collected");

    TaskResult {
        task: input.spec.name.clone(),
        status,
        exit: input.exit,
        final_state: input.state,
        output: input.output,
        files,
        result,
        policy_violations,
        workspace: input.workspace.clone(),
        program_sha256,
        started_at: input.started_at,
        finished_at: input.finished_at,
        duration_ms,
        collection_errors: errors,
    }
}

/// Every non-directory entry under `outputs`, sorted by relative path.
pub fn list_output_files(outputs: &Path) -> Result<Vec<OutputFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(outputs).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", outputs.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(outputs)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        files.push(OutputFile {
            path: to_posix(relative),
            size: metadata.len(),
        });
    }
    files.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(files)
}

/// Parse and validate the structured result file, if the task wrote one.
pub fn read_structured_result(outputs: &Path, result_file: &str) -> StructuredResult {
    let path = outputs.join(result_file);
    // The task controls this path: a FIFO or device would block the read forever.
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return StructuredResult::Absent,
        Err(err) => {
            return StructuredResult::Invalid {
                diagnostic: format!("stat {result_file}: {err}"),
            };
        }
    };
    if !metadata.file_type().is_file() {
        return StructuredResult::Invalid {
            diagnostic: format!("{result_file} is not a regular file"),
        };
    }
    if metadata.len() > MAX_RESULT_BYTES {
        return StructuredResult::Invalid {
            diagnostic: format!(
                "{result_file} is {} bytes, over the {MAX_RESULT_BYTES} byte limit",
                metadata.len()
            ),
        };
    }
    let contents = match read_capped(&path, MAX_RESULT_BYTES) {
        Ok(contents) => contents,
        Err(err) => {
            return StructuredResult::Invalid {
                diagnostic: format!("read {result_file}: {err}"),
            };
        }
    };
    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            return StructuredResult::Invalid {
                diagnostic: format!("parse {result_file}: {err}"),
            };
        }
    };

    let mut messages: Vec<String> = RESULT_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if let Some(timestamp) = value.get("timestamp").and_then(Value::as_str)
        && !is_iso8601(timestamp)
    {
        messages.push(format!("timestamp {timestamp:?} is not ISO 8601"));
    }
    if !messages.is_empty() {
        return StructuredResult::Invalid {
            diagnostic: format!("{result_file} schema validation failed: {}", messages.join("; ")),
        };
    }

    match value {
        Value::Object(payload) => StructuredResult::Valid { payload },
        _ => StructuredResult::Invalid {
            diagnostic: format!("{result_file} must hold a JSON object"),
        },
    }
}

fn read_capped(path: &Path, limit: u64) -> io::Result<String> {
    let mut contents = String::new();
    File::open(path)?.take(limit).read_to_string(&mut contents)?;
    Ok(contents)
}

/// RFC 3339, or ISO 8601 local time with or without fractional seconds, or a bare date.
fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok()
        || ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(value, format).is_ok())
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Output files no rule admits. The structured result file is always allowed.
pub fn find_policy_violations(
    files: &[OutputFile],
    rules: &[String],
    result_file: &str,
) -> Vec<String> {
    files
        .iter()
        .filter(|file| file.path != result_file && !is_path_allowed(&file.path, rules))
        .map(|file| file.path.clone())
        .collect()
}

/// Copy the run's outputs to `dest`, keeping relative paths. Returns the file count.
pub fn export_outputs(workspace: &Workspace, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut copied = 0;
    for entry in WalkDir::new(&workspace.outputs).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", workspace.outputs.display()))?;
        let relative = entry
            .path()
            .strip_prefix(&workspace.outputs)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    debug!(dest = %dest.display(), copied, "outputs exported");
    Ok(copied)
}

/// Hash a regular file, streaming it. Anything else is refused before it is opened.
pub fn file_sha256(path: &Path) -> Result<String> {
    if !is_regular_file(path) {
        bail!("{} is not a regular file", path.display());
    }
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("read {}", path.display()))?;
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

/// Follows symlinks, so an interpreter reached through a link still counts.
fn is_regular_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.file_type().is_file())
}
