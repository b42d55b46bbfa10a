//! Validates and normalizes the outer agent's spawn tool call before it
//! reaches the `WorkerPool` (`spec.md` §6 Spawn tool surface).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROMPT_DISPLAY_TRUNCATE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnToolArgs {
    pub task_id: String,
    pub workspace_path: String,
    pub system_prompt: String,
    #[serde(default)]
    pub mcp_servers: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnToolResult {
    pub worker_id: String,
    pub status: &'static str,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpawnToolResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            worker_id: String::new(),
            status: "error",
            workspace: String::new(),
            error: Some(message.into()),
        }
    }
}

/// Validate a spawn request, resolving `workspacePath` against `cwd` and
/// normalizing `mcpServers` into a trimmed, non-empty string list.
///
/// Pure: performs no I/O and does not itself spawn a worker.
pub fn validate(args: &SpawnToolArgs, cwd: &Path) -> Result<(String, Vec<String>), SpawnToolResult> {
    if args.task_id.trim().is_empty() {
        return Err(SpawnToolResult::error("taskId is required"));
    }
    if args.workspace_path.trim().is_empty() {
        return Err(SpawnToolResult::error("workspacePath is required"));
    }
    if args.system_prompt.trim().is_empty() {
        return Err(SpawnToolResult::error("systemPrompt is required"));
    }

    let workspace = resolve_workspace(&args.workspace_path, cwd);
    let mcp_servers = match &args.mcp_servers {
        None => Vec::new(),
        Some(value) => parse_mcp_servers(value)?,
    };

    Ok((workspace, mcp_servers))
}

fn resolve_workspace(workspace_path: &str, cwd: &Path) -> String {
    let path = Path::new(workspace_path);
    if path.is_absolute() {
        path.to_string_lossy().into_owned()
    } else {
        cwd.join(path).to_string_lossy().into_owned()
    }
}

fn parse_mcp_servers(value: &Value) -> Result<Vec<String>, SpawnToolResult> {
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        _ => Err(SpawnToolResult::error("mcpServers must be a JSON array of strings or a comma-separated string")),
    }
}

/// Truncate a system prompt for display in user-facing prompts/logs.
pub fn truncate_for_display(system_prompt: &str) -> String {
    if system_prompt.chars().count() <= PROMPT_DISPLAY_TRUNCATE {
        return system_prompt.to_string();
    }
    let truncated: String = system_prompt.chars().take(PROMPT_DISPLAY_TRUNCATE).collect();
    format!("{truncated}...")
}

pub fn spawned(worker_id: impl Into<String>, workspace: impl Into<String>) -> SpawnToolResult {
    SpawnToolResult {
        worker_id: worker_id.into(),
        status: "spawned",
        workspace: workspace.into(),
        error: None,
    }
}

pub fn failed(message: impl Into<String>) -> SpawnToolResult {
    SpawnToolResult::error(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(task_id: &str, workspace: &str, prompt: &str) -> SpawnToolArgs {
        SpawnToolArgs {
            task_id: task_id.to_string(),
            workspace_path: workspace.to_string(),
            system_prompt: prompt.to_string(),
            mcp_servers: None,
        }
    }

    #[test]
    fn test_missing_task_id_rejected() {
        let cwd = Path::new("/home/user/project");
        let result = validate(&args("", "/ws", "prompt"), cwd);
        assert!(result.is_err());
    }

    #[test]
    fn test_relative_workspace_resolves_against_cwd() {
        let cwd = Path::new("/home/user/project");
        let (workspace, _) = validate(&args("t1", "sub/dir", "prompt"), cwd).unwrap();
        assert_eq!(workspace, "/home/user/project/sub/dir");
    }

    #[test]
    fn test_absolute_workspace_untouched() {
        let cwd = Path::new("/home/user/project");
        let (workspace, _) = validate(&args("t1", "/abs/path", "prompt"), cwd).unwrap();
        assert_eq!(workspace, "/abs/path");
    }

    #[test]
    fn test_mcp_servers_from_json_array() {
        let mut a = args("t1", "/ws", "prompt");
        a.mcp_servers = Some(serde_json::json!([" fs ", "", "git"]));
        let cwd = Path::new("/");
        let (_, servers) = validate(&a, cwd).unwrap();
        assert_eq!(servers, vec!["fs".to_string(), "git".to_string()]);
    }

    #[test]
    fn test_mcp_servers_from_comma_separated_string() {
        let mut a = args("t1", "/ws", "prompt");
        a.mcp_servers = Some(serde_json::json!("fs, , git "));
        let cwd = Path::new("/");
        let (_, servers) = validate(&a, cwd).unwrap();
        assert_eq!(servers, vec!["fs".to_string(), "git".to_string()]);
    }

    #[test]
    fn test_truncate_short_prompt_unchanged() {
        assert_eq!(truncate_for_display("short prompt"), "short prompt");
    }

    #[test]
    fn test_truncate_long_prompt_appends_ellipsis() {
        let long = "a".repeat(150);
        let truncated = truncate_for_display(&long);
        assert_eq!(truncated.len(), 103);
        assert!(truncated.ends_with("..."));
    }
}
