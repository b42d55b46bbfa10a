//! Pre-flight check that no two tasks share or nest their working
//! directories.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task_graph::TaskSpec;

#[derive(Debug, Error)]
pub enum WorkspaceValidatorError {
    #[error("workspace conflicts detected: {0:?}")]
    Conflicts(Vec<WorkspaceConflict>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceValidatorConfig {
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    #[serde(default)]
    pub allow_nested_dirs: bool,
    #[serde(default = "default_true")]
    pub support_wildcards: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorkspaceValidatorConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            allow_nested_dirs: false,
            support_wildcards: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConflict {
    pub task_a: String,
    pub task_b: String,
    pub reason: String,
    pub severity: ConflictSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub conflicts: Vec<WorkspaceConflict>,
    pub assignments: Vec<(String, String)>,
}

pub struct WorkspaceValidator {
    config: WorkspaceValidatorConfig,
    case_insensitive: bool,
}

impl WorkspaceValidator {
    pub fn new(config: WorkspaceValidatorConfig) -> Self {
        Self {
            config,
            case_insensitive: cfg!(target_os = "windows") || cfg!(target_os = "macos"),
        }
    }

    /// Convert `\` to `/`, collapse repeated slashes, strip trailing slash
    /// (unless the path is exactly `/`), add a leading slash if missing,
    /// treat the empty string as `/`. Lower-cased on case-insensitive
    /// platforms only.
    pub fn normalize(&self, path: &str) -> String {
        if path.is_empty() {
            return "/".to_string();
        }

        let replaced = path.replace('\\', "/");
        let mut collapsed = String::with_capacity(replaced.len());
        let mut prev_slash = false;
        for c in replaced.chars() {
            if c == '/' {
                if !prev_slash {
                    collapsed.push(c);
                }
                prev_slash = true;
            } else {
                collapsed.push(c);
                prev_slash = false;
            }
        }

        if !collapsed.starts_with('/') {
            collapsed.insert(0, '/');
        }
        if collapsed.len() > 1 && collapsed.ends_with('/') {
            collapsed.pop();
        }

        if self.case_insensitive {
            collapsed.to_lowercase()
        } else {
            collapsed
        }
    }

    fn is_wildcard(path: &str) -> bool {
        path.contains('*')
    }

    fn wildcard_to_regex(pattern: &str) -> Regex {
        let mut out = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            } else {
                out.push_str(&regex::escape(&c.to_string()));
            }
        }
        out.push('$');
        Regex::new(&out).unwrap_or_else(|_| Regex::new("^$").unwrap())
    }

    fn base_prefix(pattern: &str) -> &str {
        match pattern.find('*') {
            Some(idx) => &pattern[..idx],
            None => pattern,
        }
    }

    fn conflict(&self, a_raw: &str, b_raw: &str) -> Option<String> {
        let a = self.normalize(a_raw);
        let b = self.normalize(b_raw);

        if a == b {
            return Some(format!("identical workspace paths: {a}"));
        }

        let nested = |x: &str, y: &str| x == "/" || y.starts_with(&format!("{x}/"));
        if !self.config.allow_nested_dirs {
            if a == "/" || b == "/" {
                return Some("root path conflicts with every non-root path".to_string());
            }
            if nested(&a, &b) {
                return Some(format!("'{b}' is nested under '{a}'"));
            }
            if nested(&b, &a) {
                return Some(format!("'{a}' is nested under '{b}'"));
            }
        }

        if self.config.support_wildcards && (Self::is_wildcard(&a) || Self::is_wildcard(&b)) {
            let a_re = Self::wildcard_to_regex(&a);
            let b_re = Self::wildcard_to_regex(&b);
            if a_re.is_match(&b) || b_re.is_match(&a) {
                return Some(format!("wildcard pattern overlap between '{a}' and '{b}'"));
            }
            let a_prefix = Self::base_prefix(&a);
            let b_prefix = Self::base_prefix(&b);
            if !a_prefix.is_empty() && !b_prefix.is_empty() && (a_prefix.starts_with(b_prefix) || b_prefix.starts_with(a_prefix)) {
                return Some(format!("wildcard base prefix overlap between '{a}' and '{b}'"));
            }
        }

        None
    }

    pub fn validate(&self, tasks: &[TaskSpec]) -> ValidationResult {
        let mut conflicts = Vec::new();

        for i in 0..tasks.len() {
            for j in (i + 1)..tasks.len() {
                if let Some(reason) = self.conflict(&tasks[i].workspace_path, &tasks[j].workspace_path) {
                    conflicts.push(WorkspaceConflict {
                        task_a: tasks[i].id.clone(),
                        task_b: tasks[j].id.clone(),
                        reason,
                        severity: ConflictSeverity::Error,
                    });
                }
            }
        }

        let is_valid = if self.config.strict_mode {
            conflicts.is_empty()
        } else {
            !conflicts.iter().any(|c| c.severity == ConflictSeverity::Error)
        };

        let assignments = tasks
            .iter()
            .map(|t| (t.id.clone(), t.workspace_path.clone()))
            .collect();

        ValidationResult {
            is_valid,
            conflicts,
            assignments,
        }
    }

    /// Conflict-free fallback assignment used when callers provide none.
    pub fn suggest_assignments(&self, tasks: &[TaskSpec]) -> Vec<(String, String)> {
        tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), format!("/worker-{}", i + 1)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, path: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            dependencies: vec![],
            instructions: String::new(),
            workspace_path: path.to_string(),
            worker_type: None,
            estimated_rpm: None,
        }
    }

    fn validator(config: WorkspaceValidatorConfig) -> WorkspaceValidator {
        WorkspaceValidator { config, case_insensitive: false }
    }

    #[test]
    fn test_normalize_collapses_slashes_and_backslashes() {
        let v = validator(WorkspaceValidatorConfig::default());
        assert_eq!(v.normalize("a\\\\b//c/"), "/a/b/c");
        assert_eq!(v.normalize(""), "/");
        assert_eq!(v.normalize("/"), "/");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let v = validator(WorkspaceValidatorConfig::default());
        let once = v.normalize("/src/auth/");
        let twice = v.normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_identical_paths_conflict() {
        let v = validator(WorkspaceValidatorConfig::default());
        let result = v.validate(&[spec("A", "/src"), spec("B", "/src")]);
        assert!(!result.is_valid);
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn test_nested_paths_conflict_by_default() {
        let v = validator(WorkspaceValidatorConfig::default());
        let result = v.validate(&[spec("A", "/src"), spec("B", "/src/auth")]);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_nested_paths_allowed_when_configured() {
        let v = validator(WorkspaceValidatorConfig {
            allow_nested_dirs: true,
            ..Default::default()
        });
        let result = v.validate(&[spec("A", "/src"), spec("B", "/src/auth")]);
        assert!(result.is_valid);
    }

    #[test]
    fn test_root_conflicts_with_everything() {
        let v = validator(WorkspaceValidatorConfig::default());
        let result = v.validate(&[spec("A", "/"), spec("B", "/anything")]);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_wildcard_overlap_detected() {
        let v = validator(WorkspaceValidatorConfig::default());
        let result = v.validate(&[spec("A", "/src/*"), spec("B", "/src/auth")]);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_disjoint_paths_are_valid() {
        let v = validator(WorkspaceValidatorConfig::default());
        let result = v.validate(&[spec("A", "/src"), spec("B", "/docs")]);
        assert!(result.is_valid);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_non_strict_mode_still_fails_on_error_severity() {
        let v = validator(WorkspaceValidatorConfig {
            strict_mode: false,
            ..Default::default()
        });
        let result = v.validate(&[spec("A", "/src"), spec("B", "/src")]);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_suggest_assignments_are_conflict_free() {
        let v = validator(WorkspaceValidatorConfig::default());
        let tasks = vec![spec("A", "/src"), spec("B", "/src")];
        let suggestions = v.suggest_assignments(&tasks);
        let specs: Vec<TaskSpec> = suggestions
            .iter()
            .map(|(id, path)| spec(id, path))
            .collect();
        assert!(v.validate(&specs).is_valid);
    }
}
