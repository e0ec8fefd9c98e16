//! Human-readable run report.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{OutputFile, StructuredResult, TaskExit, TaskResult};

const REPORT_TEMPLATE: &str = include_str!("templates/report.txt");

#[derive(Debug, Serialize)]
struct FileContext<'a> {
    path: &'a str,
    size: u64,
}

impl<'a> From<&'a OutputFile> for FileContext<'a> {
    fn from(file: &'a OutputFile) -> Self {
        Self {
            path: &file.path,
            size: file.size,
        }
    }
}

/// Render a finished run as plain text.
pub fn render_report(result: &TaskResult) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("report", REPORT_TEMPLATE)
        .context("load report template")?;
    let template = env.get_template("report")?;

    let files: Vec<FileContext<'_>> = result.files.iter().map(FileContext::from).collect();
    let stdout = result.stdout_text();
    let stderr = result.stderr_text();
    let rendered = template
        .render(context! {
            task => &result.task,
            status => result.status.as_str(),
            exit => describe_exit(result.exit),
            final_state => result.final_state.to_string(),
            duration_ms => result.duration_ms,
            started_at => result.started_at.to_rfc3339(),
            program_sha256 => &result.program_sha256,
            result => describe_result(&result.result),
            files => files,
            violations => &result.policy_violations,
            drain_incomplete => result.output.drain_incomplete,
            errors => &result.collection_errors,
            stdout => stdout.trim_end(),
            stderr => stderr.trim_end(),
        })
        .context("render report")?;
    Ok(rendered)
}

fn describe_exit(exit: TaskExit) -> String {
    match exit {
        TaskExit::Exited { code } => format!("exited with code {code}"),
        TaskExit::TimedOut => "killed after timeout".to_string(),
        TaskExit::Crashed { signal: Some(signal) } => format!("killed by signal {signal}"),
        TaskExit::Crashed { signal: None } => "terminated abnormally".to_string(),
        TaskExit::Cancelled => "cancelled".to_string(),
    }
}

fn describe_result(result: &StructuredResult) -> String {
    match result {
        StructuredResult::Absent => "absent".to_string(),
        StructuredResult::Valid { .. } => {
            let status = result.status().unwrap_or("-");
            match result.message() {
                Some(message) => format!("{status}: {message}"),
                None => status.to_string(),
            }
        }
        StructuredResult::Invalid { diagnostic } => format!("invalid ({diagnostic})"),
    }
}
