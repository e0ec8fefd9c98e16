//! Spawning the task process inside its workspace.
//!
//! The child runs with `scratch` as its working directory, stdin from
//! `/dev/null`, and piped stdout/stderr. It leads its own process group so
//! signals reach every descendant, and kernel resource limits are applied
//! between fork and exec.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ResourceLimits, TaskExit, TaskSpec, Workspace};

/// Absolute path of the read-only inputs directory.
pub const INPUTS_ENV: &str = "HARNESS_INPUTS";
/// Absolute path of the writable outputs directory.
pub const OUTPUTS_ENV: &str = "HARNESS_OUTPUTS";
/// Absolute path of the scratch directory, also the working directory.
pub const SCRATCH_ENV: &str = "HARNESS_SCRATCH";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program not found: {}", program.display())]
    NotFound { program: PathBuf },
    #[error("permission denied executing {}: {source}", program.display())]
    PermissionDenied {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{stream} of the task process was not captured")]
    MissingPipe { stream: &'static str },
}

/// A running task process and its process group.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pgid: Option<Pid>,
    program: PathBuf,
    exited: bool,
}

/// Start the task described by `spec` inside `workspace`.
#[instrument(skip_all, fields(task = %spec.name, program = %spec.program.display()))]
pub fn launch(
    spec: &TaskSpec,
    workspace: &Workspace,
    inherit_env: bool,
) -> Result<ProcessHandle, LaunchError> {
    let program = resolve_program(&spec.program)?;

    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .current_dir(&workspace.scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if !inherit_env {
        cmd.env_clear();
    }
    cmd.envs(&spec.env)
        .env(INPUTS_ENV, &workspace.inputs)
        .env(OUTPUTS_ENV, &workspace.outputs)
        .env(SCRATCH_ENV, &workspace.scratch);

    if spec.limits.has_rlimits() {
        let limits = spec.limits;
        // SAFETY: the closure runs between fork and exec and only issues
        // setrlimit syscalls; it allocates nothing and touches no locks.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || apply_rlimits(&limits));
        }
    }

    let child = cmd.spawn().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => LaunchError::NotFound {
            program: program.clone(),
        },
        io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
            program: program.clone(),
            source,
        },
        _ => LaunchError::Spawn {
            program: program.clone(),
            source,
        },
    })?;

    let pgid = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw);
    info!(pid = ?pgid.map(Pid::as_raw), "task launched");
    Ok(ProcessHandle {
        child,
        pgid,
        program,
        exited: false,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pgid.and_then(|pid| u32::try_from(pid.as_raw()).ok())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, LaunchError> {
        self.child
            .stdout
            .take()
            .ok_or(LaunchError::MissingPipe { stream: "stdout" })
    }

    pub fn take_stderr(&mut self) -> Result<ChildStderr, LaunchError> {
        self.child
            .stderr
            .take()
            .ok_or(LaunchError::MissingPipe { stream: "stderr" })
    }

    /// Wait for the task to exit. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(status)
    }

    /// Stop the whole process group: SIGTERM, then SIGKILL once `grace` runs out.
    #[instrument(skip_all, fields(pid = ?self.pid()))]
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        self.signal_group(Signal::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                self.exited = true;
                self.signal_group(Signal::SIGKILL);
                debug!(?status, "task stopped after SIGTERM");
                Ok(status)
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "task ignored SIGTERM, sending SIGKILL");
                self.signal_group(Signal::SIGKILL);
                self.wait().await
            }
        }
    }

    /// Kill descendants still running after the task itself exited.
    pub fn reap_group(&self) {
        self.signal_group(Signal::SIGKILL);
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, signal) {
            Ok(()) => debug!(pgid = pgid.as_raw(), %signal, "signalled process group"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = pgid.as_raw(), %signal, error = %err, "failed to signal process group"),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.exited {
            self.signal_group(Signal::SIGKILL);
        }
    }
}

/// Map a raw wait status onto the task exit taxonomy.
pub fn task_exit(status: ExitStatus) -> TaskExit {
    match status.code() {
        Some(code) => TaskExit::Exited { code },
        None => TaskExit::Crashed {
            signal: status.signal(),
        },
    }
}

/// Relative paths with a directory part are resolved against the harness
/// working directory, since the child starts in `scratch`.
fn resolve_program(program: &Path) -> Result<PathBuf, LaunchError> {
    if program.as_os_str().is_empty() {
        return Err(LaunchError::NotFound {
            program: program.to_path_buf(),
        });
    }
    if program.components().count() == 1 && !program.is_absolute() {
        return Ok(program.to_path_buf());
    }
    let resolved = std::path::absolute(program).map_err(|source| LaunchError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;
    if !resolved.exists() {
        return Err(LaunchError::NotFound { program: resolved });
    }
    Ok(resolved)
}

fn apply_rlimits(limits: &ResourceLimits) -> io::Result<()> {
    if let Some(bytes) = limits.max_memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(secs) = limits.max_cpu_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs)?;
    }
    if let Some(count) = limits.max_processes {
        setrlimit(Resource::RLIMIT_NPROC, count, count)?;
    }
    Ok(())
}
