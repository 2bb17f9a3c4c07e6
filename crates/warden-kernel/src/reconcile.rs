//! Scope reconciliation: every changed path must match a declared scope pattern (D ⊆ R).
//!
//! Patterns are globs where `*` stays within one path segment and `**` crosses segments. A
//! pattern ending in `/` covers everything below that directory. `.` and `..` segments are
//! resolved before matching; a changed path that is absolute or climbs above the repository root
//! is never covered by a pattern other than `**`. The check is pure.

use std::collections::BTreeSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope that matches every path.
pub const WILDCARD_SCOPE: &str = "**";

pub const UNTRACKED_DELTA: &str = "RECON.UNTRACKED_DELTA";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconError {
    #[error("invalid scope pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconReport {
    pub passed: bool,
    /// Changed paths no pattern covers, sorted and de-duplicated.
    pub untracked_delta_paths: Vec<String>,
    /// The scope contained the `**` wildcard.
    pub wildcard: bool,
}

impl ReconReport {
    pub fn reason(&self) -> Option<&'static str> {
        (!self.passed).then_some(UNTRACKED_DELTA)
    }
}

/// Compiled scope patterns.
#[derive(Debug, Clone)]
pub struct ScopeMatcher {
    set: GlobSet,
    wildcard: bool,
}

impl ScopeMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ReconError> {
        let mut builder = GlobSetBuilder::new();
        let mut wildcard = false;
        for raw in patterns {
            let pattern = normalize_pattern(raw.as_ref())?;
            if pattern == WILDCARD_SCOPE {
                wildcard = true;
            }
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| ReconError::InvalidPattern {
                    pattern: raw.as_ref().to_string(),
                    message: err.to_string(),
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|err| ReconError::InvalidPattern {
            pattern: String::new(),
            message: err.to_string(),
        })?;
        Ok(Self { set, wildcard })
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn matches(&self, path: &str) -> bool {
        self.wildcard || normalize_path(path).is_some_and(|path| self.set.is_match(path))
    }
}

/// Check a set of changed paths against a declared scope.
pub fn reconcile<S: AsRef<str>, P: AsRef<str>>(
    scope: &[S],
    delta: &[P],
) -> Result<ReconReport, ReconError> {
    let matcher = ScopeMatcher::new(scope)?;
    Ok(reconcile_with(&matcher, delta))
}

pub fn reconcile_with<P: AsRef<str>>(matcher: &ScopeMatcher, delta: &[P]) -> ReconReport {
    let untracked: BTreeSet<String> = delta
        .iter()
        .filter_map(|path| {
            let raw = path.as_ref().trim();
            if raw.is_empty() || matcher.matches(raw) {
                return None;
            }
            match normalize_path(raw) {
                Some(path) if path.is_empty() => None,
                Some(path) => Some(path),
                None => Some(raw.replace('\\', "/")),
            }
        })
        .collect();
    ReconReport {
        passed: untracked.is_empty(),
        untracked_delta_paths: untracked.into_iter().collect(),
        wildcard: matcher.is_wildcard(),
    }
}

/// Repository-relative, forward-slash form of a path with `.` and `..` resolved. `None` when
/// the path is absolute or climbs above the repository root.
pub fn normalize_path(path: &str) -> Option<String> {
    let unified = path.trim().replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return None;
    }
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn normalize_pattern(pattern: &str) -> Result<String, ReconError> {
    let invalid = |message: &str| ReconError::InvalidPattern {
        pattern: pattern.to_string(),
        message: message.to_string(),
    };
    let trimmed = pattern.trim();
    let directory = trimmed.ends_with('/') || trimmed.ends_with('\\');
    let normalized =
        normalize_path(trimmed).ok_or_else(|| invalid("pattern leaves the repository root"))?;
    if normalized.is_empty() {
        return Err(invalid("pattern is empty"));
    }
    if directory && normalized != WILDCARD_SCOPE {
        Ok(format!("{normalized}/**"))
    } else {
        Ok(normalized)
    }
}
