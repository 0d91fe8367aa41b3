use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Duration;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are immutable except for delete/purge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Paused
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// External CLI backend that executes the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Copilot,
    Claude,
    Gemini,
    Opencode,
}

impl Engine {
    pub const ALL: [Engine; 4] = [
        Engine::Copilot,
        Engine::Claude,
        Engine::Gemini,
        Engine::Opencode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Copilot => "copilot",
            Engine::Claude => "claude",
            Engine::Gemini => "gemini",
            Engine::Opencode => "opencode",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = InvalidEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copilot" => Ok(Engine::Copilot),
            "claude" => Ok(Engine::Claude),
            "gemini" => Ok(Engine::Gemini),
            "opencode" => Ok(Engine::Opencode),
            other => Err(InvalidEngine(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid engine: {0} (valid: copilot, claude, gemini, opencode)")]
pub struct InvalidEngine(pub String);

/// Progress reported by the running agent itself via `set_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percentage: i64,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// A single agent invocation and its lifecycle record.
///
/// Field names match the persisted JSON wire format; a task file written by
/// any earlier release loads unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub work_dir: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Duration::is_zero")]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mcp_config: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }

    pub fn to_summary(&self) -> TaskSummary {
        let duration = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                let elapsed = (end - start).to_std().unwrap_or_default();
                Duration::new(elapsed).to_string()
            }
            _ => String::new(),
        };
        TaskSummary {
            id: self.id.clone(),
            prompt: truncate(&self.prompt, 100),
            work_dir: self.work_dir.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            duration,
        }
    }
}

/// Condensed view of a task for `list_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub prompt: String,
    pub work_dir: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub duration: String,
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(3);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Request to create a new agent task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnRequest {
    pub prompt: String,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub engine: Option<Engine>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub mcp_config: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub include_dependency_logs: bool,
    #[serde(default)]
    pub dependency_log_lines: usize,
}

/// Filter for listing tasks; criteria compose conjunctively.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub status: Vec<TaskStatus>,
    pub tags: Vec<String>,
    pub limit: usize,
    pub offset: usize,
}

/// Controls how a paused task is resumed.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub prompt: String,
    pub model: String,
    pub background: bool,
    pub timeout: String,
    pub tags: Option<Vec<String>>,
}

/// Aggregate progress entry surfaced by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressInfo {
    pub task_id: String,
    pub percentage: i64,
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Orchestrator statistics: counts by status plus live progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub running_progress: HashMap<String, TaskProgressInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: "task-abc12345".into(),
            prompt: "do the thing".into(),
            work_dir: "/tmp".into(),
            status: TaskStatus::Completed,
            engine: Engine::Claude,
            pid: Some(4242),
            output: "line one\nline two\n".into(),
            output_tail: "line two\n".into(),
            error: String::new(),
            exit_code: Some(0),
            model: "claude-sonnet-4.5".into(),
            log_file: "/tmp/logs/task-abc12345.log".into(),
            progress: Some(TaskProgress {
                percentage: 80,
                description: "almost".into(),
                updated_at: Utc::now(),
            }),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            dependencies: vec!["task-00000000".into()],
            tags: vec!["build".into()],
            priority: 3,
            timeout: "5m".parse().unwrap(),
            mcp_config: "@.github/mcp-config.json".into(),
            extra_args: vec!["--verbose".into()],
        }
    }

    #[test]
    fn task_json_round_trip_preserves_every_field() {
        let task = sample_task();
        let json = serde_json::to_string_pretty(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.prompt, task.prompt);
        assert_eq!(back.work_dir, task.work_dir);
        assert_eq!(back.status, task.status);
        assert_eq!(back.engine, task.engine);
        assert_eq!(back.pid, task.pid);
        assert_eq!(back.output, task.output);
        assert_eq!(back.output_tail, task.output_tail);
        assert_eq!(back.exit_code, task.exit_code);
        assert_eq!(back.model, task.model);
        assert_eq!(back.log_file, task.log_file);
        assert_eq!(back.progress, task.progress);
        assert_eq!(back.dependencies, task.dependencies);
        assert_eq!(back.tags, task.tags);
        assert_eq!(back.priority, task.priority);
        assert_eq!(back.timeout, task.timeout);
        assert_eq!(back.mcp_config, task.mcp_config);
        assert_eq!(back.extra_args, task.extra_args);
        assert_eq!(back.created_at, task.created_at);
        assert_eq!(back.started_at, task.started_at);
        assert_eq!(back.completed_at, task.completed_at);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let status: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, TaskStatus::Running);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn engine_parse_rejects_unknown() {
        assert_eq!("claude".parse::<Engine>().unwrap(), Engine::Claude);
        let err = "chatgpt".parse::<Engine>().unwrap_err();
        assert!(err.to_string().contains("valid: copilot, claude"));
    }

    #[test]
    fn summary_truncates_long_prompts() {
        let mut task = sample_task();
        task.prompt = "x".repeat(300);
        let summary = task.to_summary();
        assert_eq!(summary.prompt.len(), 100);
        assert!(summary.prompt.ends_with("..."));
    }
}
