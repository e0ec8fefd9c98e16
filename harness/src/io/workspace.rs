//! Per-run workspace creation, input staging, and teardown.
//!
//! Each run gets a fresh directory under the configured workspace root:
//!
//! ```text
//! <root>/<task>_<YYYYmmdd_HHMMSS>_<short id>/
//!   inputs/    staged copies, sealed read-only before launch
//!   outputs/   empty, writable by the task
//!   scratch/   task working directory
//! ```
//!
//! Teardown never fails the run; problems are logged and swallowed.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::core::path_rules::{
    glob_search_base, glob_to_regex, is_glob, is_safe_config_path, normalize_config_path,
    to_posix,
};
use crate::core::types::{TaskSpec, Workspace};

/// Names are random, so a collision means something else is writing here.
pub const CREATE_ATTEMPTS: usize = 5;

// Advisory only: the task shares our uid and may chmod these back.
const SEALED_FILE_MODE: u32 = 0o444;
const SEALED_DIR_MODE: u32 = 0o555;

static WORKSPACE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+_\d{8}_\d{6}_[a-z0-9]{6}$").expect("workspace name pattern compiles")
});

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("prepare workspace root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no free workspace name under {root} after {attempts} attempts")]
    Collision { root: PathBuf, attempts: usize },
    #[error("create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("input rule {rule:?} must be a relative path inside the input base")]
    UnsafePath { rule: String },
    #[error("input {rule:?} not found under {base}")]
    InputNotFound { rule: String, base: PathBuf },
    #[error("stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("input glob {rule:?}: {source}")]
    Glob {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Create a workspace for `spec` under `root`, staging inputs from `input_base`.
///
/// Either a fully built workspace is returned or nothing is left on disk.
#[instrument(skip_all, fields(task = %spec.name))]
pub fn create_workspace(
    root: &Path,
    input_base: &Path,
    spec: &TaskSpec,
) -> Result<Workspace, WorkspaceError> {
    let root = std::path::absolute(root).map_err(|source| WorkspaceError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    fs::create_dir_all(&root).map_err(|source| WorkspaceError::Root {
        path: root.clone(),
        source,
    })?;

    let workspace = allocate(&root, &spec.name)?;
    if let Err(err) = populate(&workspace, input_base, &spec.inputs) {
        destroy_workspace(&workspace);
        return Err(err);
    }
    debug!(root = %workspace.root.display(), "workspace ready");
    Ok(workspace)
}

/// Remove a workspace tree. Idempotent; never fails.
#[instrument(skip_all, fields(root = %workspace.root.display()))]
pub fn destroy_workspace(workspace: &Workspace) {
    remove_tree(&workspace.root);
}

/// Remove leftover workspaces under `root` last modified at least `older_than` ago.
///
/// Only directories named like workspaces are touched. Returns how many were removed.
pub fn sweep_stale(root: &Path, older_than: Duration) -> anyhow::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.context("read workspace entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !WORKSPACE_NAME_RE.is_match(&name) {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age >= older_than {
            remove_tree(&entry.path());
            removed += 1;
        }
    }
    debug!(root = %root.display(), removed, "swept stale workspaces");
    Ok(removed)
}

pub fn build_workspace_name(task: &str, timestamp: &str, short_id: &str) -> String {
    format!("{}_{timestamp}_{short_id}", sanitize_task_name(task))
}

/// Keep names filesystem-friendly whatever the task is called.
fn sanitize_task_name(task: &str) -> String {
    let cleaned: String = task
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn allocate(root: &Path, task: &str) -> Result<Workspace, WorkspaceError> {
    for attempt in 1..=CREATE_ATTEMPTS {
        let name = build_workspace_name(task, &generate_timestamp(), &generate_short_id());
        let path = root.join(&name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(Workspace::at(path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(attempt, name = %name, "workspace name taken");
            }
            Err(source) => return Err(WorkspaceError::Create { path, source }),
        }
    }
    Err(WorkspaceError::Collision {
        root: root.to_path_buf(),
        attempts: CREATE_ATTEMPTS,
    })
}

fn populate(workspace: &Workspace, input_base: &Path, rules: &[String]) -> Result<(), WorkspaceError> {
    for dir in [&workspace.inputs, &workspace.outputs, &workspace.scratch] {
        fs::create_dir(dir).map_err(|source| WorkspaceError::Create {
            path: dir.clone(),
            source,
        })?;
    }
    for rule in rules {
        stage_rule(input_base, &workspace.inputs, rule)?;
    }
    seal_read_only(&workspace.inputs)
}

fn stage_rule(base: &Path, inputs: &Path, rule: &str) -> Result<(), WorkspaceError> {
    if !is_safe_config_path(rule) {
        return Err(WorkspaceError::UnsafePath {
            rule: rule.to_string(),
        });
    }
    let normalized = normalize_config_path(rule);
    let normalized = normalized.trim_end_matches('/');

    if is_glob(normalized) {
        let pattern = glob_to_regex(normalized).map_err(|source| WorkspaceError::Glob {
            rule: rule.to_string(),
            source,
        })?;
        let search = base.join(glob_search_base(normalized));
        let mut staged = 0usize;
        if search.is_dir() {
            for entry in WalkDir::new(&search).sort_by_file_name() {
                let entry = entry.map_err(|err| walk_error(&search, err))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(base) else {
                    continue;
                };
                let relative = to_posix(relative);
                if pattern.is_match(&relative) {
                    copy_file(entry.path(), &inputs.join(&relative))?;
                    staged += 1;
                }
            }
        }
        if staged == 0 {
            warn!(rule = %rule, base = %base.display(), "input glob matched no files");
        } else {
            debug!(rule = %rule, staged, "staged input glob");
        }
        return Ok(());
    }

    let source = base.join(normalized);
    let metadata = match fs::metadata(&source) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(WorkspaceError::InputNotFound {
                rule: rule.to_string(),
                base: base.to_path_buf(),
            });
        }
        Err(err) => return Err(WorkspaceError::Stage { path: source, source: err }),
    };
    let target = inputs.join(normalized);
    if metadata.is_dir() {
        copy_dir(&source, &target)
    } else {
        copy_file(&source, &target)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|err| walk_error(src, err))?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|source| WorkspaceError::Stage {
                path: target.clone(),
                source,
            })?;
        } else if entry.file_type().is_file() {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|source| WorkspaceError::Stage {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::copy(src, dst).map_err(|source| WorkspaceError::Stage {
        path: src.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn walk_error(root: &Path, err: walkdir::Error) -> WorkspaceError {
    let path = err.path().unwrap_or(root).to_path_buf();
    WorkspaceError::Stage {
        path,
        source: err.into(),
    }
}

/// Children are sealed before their parent so the walk never loses access.
fn seal_read_only(inputs: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(inputs).contents_first(true) {
        let entry = entry.map_err(|err| walk_error(inputs, err))?;
        let mode = if entry.file_type().is_dir() {
            SEALED_DIR_MODE
        } else if entry.file_type().is_file() {
            SEALED_FILE_MODE
        } else {
            continue;
        };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode)).map_err(|source| {
            WorkspaceError::Stage {
                path: entry.path().to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}

fn remove_tree(root: &Path) {
    if fs::symlink_metadata(root).is_err() {
        return;
    }
    restore_owner_access(root);
    match fs::remove_dir_all(root) {
        Ok(()) => debug!(root = %root.display(), "workspace removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(root = %root.display(), error = %err, "failed to remove workspace"),
    }
}

/// Sealed inputs and task-made read-only directories would block removal.
fn restore_owner_access(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mode = metadata.permissions().mode();
        if mode & 0o700 == 0o700 {
            continue;
        }
        if let Err(err) =
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))
        {
            warn!(path = %entry.path().display(), error = %err, "failed to restore permissions");
        }
    }
}
