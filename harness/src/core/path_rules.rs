//! Relative path rules for staged inputs and declared outputs.
//!
//! Rules are POSIX-style relative paths. A rule is one of:
//!
//! - an exact path (`data/a.csv`),
//! - a directory prefix with a trailing slash (`reports/`),
//! - a glob using `*`, `**`, or `?` (`data/**/*.csv`).
//!
//! Absolute paths, drive letters, and `.`/`..` segments are rejected so a rule
//! can never address anything outside the directory it is resolved against.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;

static DRIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]:/").expect("drive pattern compiles"));

/// Output rule that accepts every file under `outputs`.
pub const ALL_OUTPUTS: &str = "**";

/// Normalize a user-written path: trim, `\` to `/`, collapse `//`, strip leading `./`.
pub fn normalize_config_path(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut posix = trimmed.replace('\\', "/");
    while posix.contains("//") {
        posix = posix.replace("//", "/");
    }
    let mut rest = posix.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}

/// True when the path is relative and stays within the directory it is joined to.
pub fn is_safe_config_path(value: &str) -> bool {
    let normalized = normalize_config_path(value);
    if normalized.is_empty() || normalized == "." {
        return false;
    }
    if normalized.starts_with('/') || DRIVE_RE.is_match(&normalized) {
        return false;
    }
    let segments: Vec<&str> = normalized.split('/').collect();
    let last = segments.len() - 1;
    segments.iter().enumerate().all(|(index, segment)| {
        // A trailing slash declares a directory.
        if segment.is_empty() && index == last {
            return true;
        }
        !matches!(*segment, "" | "." | "..")
    })
}

/// True when the rule contains glob metacharacters.
pub fn is_glob(value: &str) -> bool {
    value.contains(['*', '?', '[', ']', '{', '}'])
}

/// Directory to start walking from for a glob, so the whole base is not scanned.
///
/// Returns `.` when the first wildcard sits in the first path segment.
pub fn glob_search_base(pattern: &str) -> String {
    let normalized = normalize_config_path(pattern);
    let Some(first_wildcard) = normalized.find(['*', '?', '[', '{']) else {
        return normalized;
    };
    let prefix = &normalized[..first_wildcard];
    match prefix.rfind('/') {
        Some(0) | None => ".".to_string(),
        Some(slash) => prefix[..slash].to_string(),
    }
}

/// Compile a glob into an anchored regex over `/`-separated relative paths.
///
/// `*` and `?` never cross a `/`; `**/` matches zero or more directories.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let normalized = normalize_config_path(pattern);
    let chars: Vec<char> = normalized.chars().collect();
    let mut expr = String::from("^");
    let mut index = 0;
    while index < chars.len() {
        match chars[index] {
            '*' if chars.get(index + 1) == Some(&'*') => {
                if chars.get(index + 2) == Some(&'/') {
                    expr.push_str("(?:.*/)?");
                    index += 3;
                } else {
                    expr.push_str(".*");
                    index += 2;
                }
            }
            '*' => {
                expr.push_str("[^/]*");
                index += 1;
            }
            '?' => {
                expr.push_str("[^/]");
                index += 1;
            }
            other => {
                expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4])));
                index += 1;
            }
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

/// Express an output rule relative to the outputs directory.
///
/// `outputs` and `outputs/` mean "everything"; a leading `outputs/` is dropped.
pub fn normalize_output_rule(rule: &str) -> String {
    let normalized = normalize_config_path(rule);
    if normalized == "outputs" || normalized == "outputs/" {
        return ALL_OUTPUTS.to_string();
    }
    match normalized.strip_prefix("outputs/") {
        Some(rest) => rest.to_string(),
        None => normalized,
    }
}

/// Check one relative output path against one rule.
pub fn matches_path_rule(relative_path: &str, rule: &str) -> bool {
    let path = normalize_config_path(relative_path);
    let path = path.trim_end_matches('/');
    let rule = normalize_output_rule(rule);
    if path.is_empty() || rule.is_empty() {
        return false;
    }
    if rule == ALL_OUTPUTS {
        return true;
    }
    if let Some(directory) = rule.strip_suffix('/') {
        return path == directory || path.starts_with(&format!("{directory}/"));
    }
    if is_glob(&rule) {
        return glob_to_regex(&rule).is_ok_and(|re| re.is_match(path));
    }
    path == rule
}

/// True when at least one rule admits the path.
pub fn is_path_allowed(relative_path: &str, rules: &[String]) -> bool {
    rules
        .iter()
        .any(|rule| matches_path_rule(relative_path, rule))
}

/// Render a relative filesystem path with `/` separators.
pub fn to_posix(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
