//! Task execution harness CLI.
//!
//! Runs a task file in a fresh workspace, prints a report or the JSON result,
//! and exits with a code derived from the task status.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use harness::controller::{Harness, RunOptions};
use harness::core::units::parse_duration;
use harness::exit_codes;
use harness::io::config::{DEFAULT_CONFIG_PATH, load_config};
use harness::io::report::render_report;
use harness::io::task_file::load_spec;

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Run one executable task under a fixed inputs/outputs contract"
)]
struct Cli {
    /// Harness config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task file and report the result.
    Run {
        /// Path to the task TOML file.
        task: PathBuf,
        /// Print the full result as JSON instead of a report.
        #[arg(long)]
        json: bool,
        /// Copy the task's outputs here before the workspace is removed.
        #[arg(long, value_name = "DIR")]
        export_outputs: Option<PathBuf>,
    },
    /// Parse and check a task file without running it.
    Validate {
        /// Path to the task TOML file.
        task: PathBuf,
    },
    /// Remove workspaces left behind by interrupted runs.
    Clean {
        /// Minimum age of workspaces to remove, e.g. `30m` or `1h`.
        #[arg(long, default_value = "1h", value_parser = parse_age)]
        older_than: Duration,
    },
}

fn main() {
    harness::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            json,
            export_outputs,
        } => run_task(&cli.config, &task, json, export_outputs),
        Command::Validate { task } => {
            let config = load_config(&cli.config)?;
            let spec = load_spec(&task, &config)?;
            println!(
                "{} ok: program {}, timeout {}s, {} input rule(s), {} output rule(s)",
                spec.name,
                spec.program.display(),
                spec.timeout.as_secs(),
                spec.inputs.len(),
                spec.outputs.len()
            );
            Ok(exit_codes::OK)
        }
        Command::Clean { older_than } => {
            let harness = Harness::new(load_config(&cli.config)?)?;
            let removed = harness.sweep_stale(older_than)?;
            println!(
                "removed {removed} stale workspace(s) from {}",
                harness.config().workspace_root.display()
            );
            Ok(exit_codes::OK)
        }
    }
}

fn run_task(
    config_path: &Path,
    task: &Path,
    json: bool,
    export_outputs: Option<PathBuf>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let spec = load_spec(task, &config)?;
    let harness = Harness::new(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let result = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });
        let result = harness
            .run_with(
                &spec,
                RunOptions {
                    cancel,
                    export_outputs,
                },
            )
            .await;
        watcher.abort();
        result
    });
    let result = result.with_context(|| format!("run task {}", spec.name))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize result")?
        );
    } else {
        println!("{}", render_report(&result)?);
    }
    Ok(exit_codes::for_status(result.status))
}

fn parse_age(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "harness",
            "run",
            "task.toml",
            "--json",
            "--export-outputs",
            "out",
        ]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        match cli.command {
            Command::Run {
                task,
                json,
                export_outputs,
            } => {
                assert_eq!(task, PathBuf::from("task.toml"));
                assert!(json);
                assert_eq!(export_outputs, Some(PathBuf::from("out")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_clean_default_age() {
        let cli = Cli::parse_from(["harness", "clean"]);
        assert!(matches!(
            cli.command,
            Command::Clean { older_than } if older_than == Duration::from_secs(3600)
        ));
    }

    #[test]
    fn parse_global_config() {
        let cli = Cli::parse_from(["harness", "validate", "t.toml", "--config", "h.toml"]);
        assert_eq!(cli.config, PathBuf::from("h.toml"));
        assert!(matches!(cli.command, Command::Validate { .. }));
    }

    #[test]
    fn rejects_bad_age() {
        assert!(Cli::try_parse_from(["harness", "clean", "--older-than", "soon"]).is_err());
    }
}
