//! Run orchestration: one workspace, one process, one result.
//!
//! [`Harness::run`] drives a task through the lifecycle in
//! [`crate::core::state`]: build the workspace, launch, race the exit against
//! the timeout and cancellation, drain output, collect, and tear down. The
//! workspace is removed on every path out of `run`, including errors and a
//! dropped future.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::state::{InvalidTransition, RunEvent, RunState};
use crate::core::types::{TaskExit, TaskResult, TaskSpec, Workspace};
use crate::io::capture::OutputCapturer;
use crate::io::collector::{CollectInput, collect, export_outputs};
use crate::io::config::HarnessConfig;
use crate::io::launcher::{self, LaunchError, ProcessHandle};
use crate::io::workspace::{WorkspaceError, create_workspace, destroy_workspace, sweep_stale};

/// Infrastructure failures. Task misbehaviour is always a [`TaskResult`].
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("wait for task process: {0}")]
    Wait(#[source] io::Error),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("{operation} did not complete: {source}")]
    Background {
        operation: &'static str,
        #[source]
        source: JoinError,
    },
}

/// Per-run knobs that are not part of the task itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancelling stops the task like a timeout does, with its own status.
    pub cancel: CancellationToken,
    /// Copy `outputs` here before the workspace is removed.
    pub export_outputs: Option<PathBuf>,
}

/// Runs tasks under one configuration. Cheap to clone; clones share nothing mutable.
#[derive(Debug, Clone)]
pub struct Harness {
    config: Arc<HarnessConfig>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub async fn run(&self, spec: &TaskSpec) -> Result<TaskResult, HarnessError> {
        self.run_with(spec, RunOptions::default()).await
    }

    pub async fn run_with_cancel(
        &self,
        spec: &TaskSpec,
        cancel: CancellationToken,
    ) -> Result<TaskResult, HarnessError> {
        self.run_with(
            spec,
            RunOptions {
                cancel,
                ..RunOptions::default()
            },
        )
        .await
    }

    #[instrument(skip_all, fields(task = %spec.name))]
    pub async fn run_with(
        &self,
        spec: &TaskSpec,
        options: RunOptions,
    ) -> Result<TaskResult, HarnessError> {
        let mut tracker = StateTracker::default();
        tracker.apply(RunEvent::Start)?;
        let started_at = Utc::now();

        let guard = match self.prepare(spec).await {
            Ok(guard) => guard,
            Err(err) => {
                tracker.apply(RunEvent::SetupFailed)?;
                warn!(error = %err, "workspace setup failed");
                return Err(err);
            }
        };

        let outcome = self
            .execute(spec, &guard.workspace, &options, &mut tracker, started_at)
            .await;
        guard.teardown().await;

        match &outcome {
            Ok(result) => info!(
                status = result.status.as_str(),
                state = %result.final_state,
                duration_ms = result.duration_ms,
                "run finished"
            ),
            Err(err) => warn!(state = %tracker.state, error = %err, "run failed"),
        }
        outcome
    }

    /// Remove workspaces left behind by crashed harness processes.
    pub fn sweep_stale(&self, older_than: Duration) -> anyhow::Result<usize> {
        sweep_stale(&self.config.workspace_root, older_than)
    }

    /// The guard is built on the blocking thread, so a run dropped while
    /// staging still removes the workspace once staging ends.
    async fn prepare(&self, spec: &TaskSpec) -> Result<WorkspaceGuard, HarnessError> {
        let config = Arc::clone(&self.config);
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || {
            create_workspace(&config.workspace_root, &config.input_base, &spec)
                .map(WorkspaceGuard::new)
        })
        .await
        .map_err(|source| HarnessError::Background {
            operation: "workspace setup",
            source,
        })?
        .map_err(HarnessError::from)
    }

    async fn execute(
        &self,
        spec: &TaskSpec,
        workspace: &Workspace,
        options: &RunOptions,
        tracker: &mut StateTracker,
        started_at: DateTime<Utc>,
    ) -> Result<TaskResult, HarnessError> {
        let mut handle = match launcher::launch(spec, workspace, self.config.inherit_env) {
            Ok(handle) => handle,
            Err(err) => {
                tracker.apply(RunEvent::SetupFailed)?;
                return Err(err.into());
            }
        };
        tracker.apply(RunEvent::Launched)?;

        let capturer = OutputCapturer::start(
            handle.take_stdout()?,
            handle.take_stderr()?,
            spec.limits.max_output_bytes,
        );

        let exit = self.supervise(&mut handle, spec.timeout, &options.cancel).await?;
        let finished_at = Utc::now();
        tracker.apply(match exit {
            TaskExit::Exited { .. } => RunEvent::Exited,
            TaskExit::Crashed { .. } => RunEvent::Signalled,
            TaskExit::TimedOut => RunEvent::DeadlineElapsed,
            TaskExit::Cancelled => RunEvent::CancelRequested,
        })?;

        // Descendants may still hold the pipes or write to outputs.
        handle.reap_group();
        let output = capturer.finalize(self.config.drain_timeout()).await;

        let config = Arc::clone(&self.config);
        let spec = spec.clone();
        let workspace = workspace.clone();
        let program = handle.program().to_path_buf();
        let export = options.export_outputs.clone();
        let state = tracker.state;
        let result = tokio::task::spawn_blocking(move || {
            let mut result = collect(CollectInput {
                spec: &spec,
                workspace: &workspace,
                result_file: &config.result_file,
                program: Some(&program),
                exit,
                state,
                output,
                started_at,
                finished_at,
            });
            if let Some(dest) = export
                && let Err(err) = export_outputs(&workspace, &dest)
            {
                warn!(dest = %dest.display(), error = %err, "output export failed");
                result.collection_errors.push(format!("export: {err:#}"));
            }
            result
        })
        .await
        .map_err(|source| HarnessError::Background {
            operation: "result collection",
            source,
        })?;

        if tracker.state == RunState::Collecting {
            tracker.apply(RunEvent::Collected)?;
        }
        Ok(TaskResult {
            final_state: tracker.state,
            ..result
        })
    }

    /// Wait for the task while watching the deadline and the cancel token.
    async fn supervise(
        &self,
        handle: &mut ProcessHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskExit, HarnessError> {
        let grace = self.config.kill_grace();
        tokio::select! {
            biased;
            status = handle.wait() => {
                let status = status.map_err(HarnessError::Wait)?;
                debug!(?status, "task exited");
                Ok(launcher::task_exit(status))
            }
            () = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "task timed out, stopping");
                handle.terminate(grace).await.map_err(HarnessError::Wait)?;
                Ok(TaskExit::TimedOut)
            }
            () = cancel.cancelled() => {
                info!("cancellation requested, stopping task");
                handle.terminate(grace).await.map_err(HarnessError::Wait)?;
                Ok(TaskExit::Cancelled)
            }
        }
    }
}

#[derive(Debug, Default)]
struct StateTracker {
    state: RunState,
}

impl StateTracker {
    fn apply(&mut self, event: RunEvent) -> Result<RunState, InvalidTransition> {
        let next = self.state.next(event)?;
        debug!(from = %self.state, to = %next, ?event, "state transition");
        self.state = next;
        Ok(next)
    }
}

/// Removes the workspace even if the run future is dropped mid-flight.
struct WorkspaceGuard {
    workspace: Workspace,
    armed: bool,
}

impl WorkspaceGuard {
    fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            armed: true,
        }
    }

    async fn teardown(mut self) {
        self.armed = false;
        let workspace = self.workspace.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || destroy_workspace(&workspace)).await {
            warn!(error = %err, "workspace teardown did not complete");
        }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if self.armed {
            destroy_workspace(&self.workspace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_invalid_config() {
        let config = HarnessConfig {
            max_output_bytes: 0,
            ..HarnessConfig::default()
        };
        assert!(Harness::new(config).is_err());
    }

    #[test]
    fn tracker_follows_the_lifecycle() {
        let mut tracker = StateTracker::default();
        tracker.apply(RunEvent::Start).expect("start");
        tracker.apply(RunEvent::Launched).expect("launch");
        assert_eq!(tracker.state, RunState::Running);
        assert!(tracker.apply(RunEvent::Collected).is_err());
        assert_eq!(tracker.state, RunState::Running);
    }

    #[test]
    fn dropped_guard_removes_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = TaskSpec::new("guarded", "/bin/true");
        let workspace =
            create_workspace(&temp.path().join("ws"), temp.path(), &spec).expect("workspace");
        let root = workspace.root.clone();
        assert!(root.exists());

        drop(WorkspaceGuard::new(workspace));

        assert!(!root.exists());
    }

    #[tokio::test]
    async fn launch_failure_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        let harness = Harness::new(HarnessConfig {
            workspace_root: root.clone(),
            input_base: temp.path().to_path_buf(),
            ..HarnessConfig::default()
        })
        .expect("harness");
        let spec = TaskSpec::new("ghost", temp.path().join("missing-program"));

        let err = harness.run(&spec).await.expect_err("launch should fail");
        assert!(matches!(err, HarnessError::Launch(LaunchError::NotFound { .. })));
        assert_eq!(std::fs::read_dir(&root).expect("root").count(), 0);
    }
}
