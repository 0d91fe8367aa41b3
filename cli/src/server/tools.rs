//! Tool catalog: schema publication, argument coercion and handlers.
//!
//! Handlers return `Result<Value, String>`; the dispatcher wraps either
//! side into the uniform text-content envelope.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use mesnada_core::error::OrchestratorError;
use mesnada_core::models::{Engine, ListRequest, ResumeOptions, SpawnRequest, TaskStatus};

use super::McpServer;

impl McpServer {
    /// Runs the named tool. `None` means the tool does not exist.
    pub(crate) async fn call_tool(
        &self,
        name: &str,
        args: Value,
    ) -> Option<Result<Value, String>> {
        let args = if args.is_null() { json!({}) } else { args };
        let result = match name {
            "spawn_agent" => self.tool_spawn_agent(args).await,
            "get_task" => self.tool_get_task(args),
            "list_tasks" => self.tool_list_tasks(args),
            "wait_task" => self.tool_wait_task(args).await,
            "wait_multiple" => self.tool_wait_multiple(args).await,
            "cancel_task" => self.tool_cancel_task(args).await,
            "pause_task" => self.tool_pause_task(args).await,
            "resume_task" => self.tool_resume_task(args).await,
            "delete_task" => self.tool_delete_task(args).await,
            "purge_task" => self.tool_purge_task(args).await,
            "get_stats" => self.tool_get_stats(),
            "get_task_output" => self.tool_get_task_output(args),
            "set_progress" => self.tool_set_progress(args),
            _ => return None,
        };
        Some(result)
    }

    async fn tool_spawn_agent(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            prompt: String,
            #[serde(default)]
            work_dir: String,
            #[serde(default)]
            engine: String,
            #[serde(default)]
            model: String,
            background: Option<bool>,
            #[serde(default)]
            timeout: String,
            #[serde(default)]
            dependencies: Vec<String>,
            #[serde(default)]
            tags: Vec<String>,
            #[serde(default)]
            mcp_config: String,
            #[serde(default)]
            extra_args: Vec<String>,
            include_dependency_logs: Option<bool>,
            dependency_log_lines: Option<usize>,
        }
        let req: Args = parse_args(args)?;

        if req.prompt.is_empty() {
            return Err("prompt is required".to_string());
        }

        let engine = if req.engine.is_empty() {
            self.config().default_engine()
        } else {
            req.engine.parse::<Engine>().map_err(|e| e.to_string())?
        };

        if !req.model.is_empty() && !self.config().validate_model_for_engine(engine, &req.model) {
            let available = self.config().model_ids_for_engine(engine);
            return Err(format!(
                "invalid model '{}' for engine '{}'. Available models: {:?}",
                req.model, engine, available
            ));
        }

        let background = req.background.unwrap_or(true);

        let task = self
            .orchestrator()
            .spawn(SpawnRequest {
                prompt: req.prompt,
                work_dir: req.work_dir,
                model: req.model,
                engine: Some(engine),
                dependencies: req.dependencies,
                tags: req.tags,
                priority: 0,
                timeout: req.timeout,
                mcp_config: req.mcp_config,
                extra_args: req.extra_args,
                background,
                include_dependency_logs: req.include_dependency_logs.unwrap_or(false),
                dependency_log_lines: req.dependency_log_lines.unwrap_or(100),
            })
            .await
            .map_err(|e| e.to_string())?;

        let mut result = json!({
            "task_id": task.id.clone(),
            "status": task.status,
            "engine": task.engine,
            "work_dir": task.work_dir.clone(),
            "created_at": task.created_at,
        });
        if !background && task.is_terminal() {
            result["output_tail"] = json!(task.output_tail);
            result["exit_code"] = json!(task.exit_code);
            if !task.error.is_empty() {
                result["error"] = json!(task.error);
            }
        }
        Ok(result)
    }

    fn tool_get_task(&self, args: Value) -> Result<Value, String> {
        let req: TaskIdArgs = parse_args(args)?;
        let task = self
            .orchestrator()
            .get_task(&req.task_id)
            .map_err(|e| e.to_string())?;
        serde_json::to_value(&task).map_err(|e| e.to_string())
    }

    fn tool_list_tasks(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            status: Vec<TaskStatus>,
            #[serde(default)]
            tags: Vec<String>,
            #[serde(default)]
            limit: usize,
            #[serde(default)]
            offset: usize,
        }
        let req: Args = parse_args(args)?;
        let limit = if req.limit == 0 { 20 } else { req.limit };

        let tasks = self.orchestrator().list_tasks(&ListRequest {
            status: req.status,
            tags: req.tags,
            limit,
            offset: req.offset,
        });
        let summaries: Vec<_> = tasks.iter().map(|t| t.to_summary()).collect();
        Ok(json!({
            "tasks": summaries,
            "total": summaries.len(),
        }))
    }

    async fn tool_wait_task(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            #[serde(default)]
            timeout: String,
        }
        let req: Args = parse_args(args)?;
        let timeout = parse_timeout(&req.timeout)?;

        match self.orchestrator().wait(&req.task_id, timeout).await {
            Ok(task) => {
                let output_tail = task.output_tail.clone();
                Ok(json!({
                    "task": task,
                    "output_tail": output_tail,
                }))
            }
            Err(e) => {
                let message = e.to_string();
                match e {
                    // The snapshot travels with the timeout so callers get
                    // both the error and the current state.
                    OrchestratorError::WaitTimeout { task, .. } => Ok(json!({
                        "task": task,
                        "error": message,
                        "timeout": true,
                    })),
                    _ => Err(message),
                }
            }
        }
    }

    async fn tool_wait_multiple(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            task_ids: Vec<String>,
            #[serde(default = "default_true")]
            wait_all: bool,
            #[serde(default)]
            timeout: String,
        }
        let req: Args = parse_args(args)?;
        let timeout = parse_timeout(&req.timeout)?;

        let outcome = self
            .orchestrator()
            .wait_multiple(&req.task_ids, req.wait_all, timeout)
            .await;

        let mut tasks = Map::new();
        for (id, task) in &outcome.tasks {
            tasks.insert(
                id.clone(),
                json!({
                    "status": task.status,
                    "output_tail": task.output_tail.clone(),
                    "exit_code": task.exit_code,
                    "error": task.error.clone(),
                }),
            );
        }

        let mut response = json!({
            "tasks": tasks,
            "completed": outcome.tasks.len(),
            "requested": req.task_ids.len(),
        });
        if outcome.timed_out {
            response["error"] = json!("timeout waiting for tasks");
        }
        Ok(response)
    }

    async fn tool_cancel_task(&self, args: Value) -> Result<Value, String> {
        let req: TaskIdArgs = parse_args(args)?;
        self.orchestrator()
            .cancel(&req.task_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({"task_id": req.task_id, "cancelled": true}))
    }

    async fn tool_pause_task(&self, args: Value) -> Result<Value, String> {
        let req: TaskIdArgs = parse_args(args)?;
        let task = self
            .orchestrator()
            .pause(&req.task_id)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_value(&task).map_err(|e| e.to_string())
    }

    async fn tool_resume_task(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            #[serde(default)]
            prompt: String,
            #[serde(default)]
            model: String,
            background: Option<bool>,
            #[serde(default)]
            timeout: String,
            tags: Option<Vec<String>>,
        }
        let req: Args = parse_args(args)?;

        if !req.model.is_empty() {
            // Resume runs on the default engine, like any fresh spawn.
            let engine = self.config().default_engine();
            if !self.config().validate_model_for_engine(engine, &req.model) {
                let available = self.config().model_ids_for_engine(engine);
                return Err(format!(
                    "invalid model '{}' for engine '{}'. Available models: {:?}",
                    req.model, engine, available
                ));
            }
        }

        let task = self
            .orchestrator()
            .resume(
                &req.task_id,
                ResumeOptions {
                    prompt: req.prompt,
                    model: req.model,
                    background: req.background.unwrap_or(true),
                    timeout: req.timeout,
                    tags: req.tags,
                },
            )
            .await
            .map_err(|e| e.to_string())?;

        Ok(json!({"task_id": task.id, "task": task}))
    }

    async fn tool_delete_task(&self, args: Value) -> Result<Value, String> {
        let req: TaskIdArgs = parse_args(args)?;
        self.orchestrator()
            .delete(&req.task_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({"task_id": req.task_id, "deleted": true}))
    }

    async fn tool_purge_task(&self, args: Value) -> Result<Value, String> {
        let req: TaskIdArgs = parse_args(args)?;
        self.orchestrator()
            .purge(&req.task_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({"task_id": req.task_id, "purged": true}))
    }

    fn tool_get_stats(&self) -> Result<Value, String> {
        serde_json::to_value(self.orchestrator().stats()).map_err(|e| e.to_string())
    }

    fn tool_get_task_output(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            tail: Option<bool>,
        }
        let req: Args = parse_args(args)?;
        let task = self
            .orchestrator()
            .get_task(&req.task_id)
            .map_err(|e| e.to_string())?;

        // Running tasks default to the tail; terminal tasks to the full
        // capture.
        let use_tail = req.tail.unwrap_or_else(|| task.is_running());
        let output = if use_tail {
            &task.output_tail
        } else {
            &task.output
        };

        Ok(json!({
            "task_id": task.id,
            "status": task.status,
            "output": output,
            "log_file": task.log_file,
            "is_tail": use_tail,
        }))
    }

    fn tool_set_progress(&self, args: Value) -> Result<Value, String> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            #[serde(default)]
            percentage: Value,
            #[serde(default)]
            description: String,
        }
        let req: Args = parse_args(args)?;
        let percentage = coerce_percentage(&req.percentage)?;

        self.orchestrator()
            .set_progress(&req.task_id, percentage, &req.description)
            .map_err(|e| e.to_string())?;

        Ok(json!({
            "task_id": req.task_id,
            "percentage": percentage,
            "description": req.description,
            "updated": true,
        }))
    }

    /// The published tool catalog, with status/engine/model enums baked
    /// into the schemas.
    pub(crate) fn tool_definitions(&self) -> Vec<Value> {
        let model_enum = self.config().all_model_ids();
        let engine_enum: Vec<&str> = Engine::ALL.iter().map(Engine::as_str).collect();
        let status_enum = [
            "pending",
            "running",
            "paused",
            "completed",
            "failed",
            "cancelled",
        ];

        vec![
            json!({
                "name": "spawn_agent",
                "description": "Spawn a new CLI agent to execute a task. Supports multiple engines: 'copilot' (GitHub Copilot CLI), 'claude' (Anthropic Claude CLI), 'gemini' (Google Gemini CLI), or 'opencode' (OpenCode.ai CLI). The agent runs in the specified working directory with full tool access. Use background=true for long-running tasks.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "prompt": {
                            "type": "string",
                            "description": "The prompt/instruction for the agent to execute"
                        },
                        "work_dir": {
                            "type": "string",
                            "description": "Working directory for the agent (absolute path)"
                        },
                        "engine": {
                            "type": "string",
                            "description": "CLI engine to use: 'copilot' (GitHub Copilot CLI, default), 'claude' (Anthropic Claude CLI), 'gemini' (Google Gemini CLI), or 'opencode' (OpenCode.ai CLI)",
                            "enum": engine_enum,
                            "default": "copilot"
                        },
                        "model": {
                            "type": "string",
                            "description": "AI model to use (e.g., claude-sonnet-4, gpt-5.1-codex). Note: Model availability depends on the selected engine.",
                            "enum": model_enum.clone()
                        },
                        "background": {
                            "type": "boolean",
                            "description": "Run in background (true) or wait for completion (false). Default: true",
                            "default": true
                        },
                        "timeout": {
                            "type": "string",
                            "description": "Timeout duration (e.g., '30m', '1h'). Empty for no timeout"
                        },
                        "dependencies": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "List of task IDs that must complete before this task starts"
                        },
                        "tags": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Tags for organizing and filtering tasks"
                        },
                        "mcp_config": {
                            "type": "string",
                            "description": "Additional MCP configuration JSON or file path (prefix with @). For Claude engine, this will be automatically converted to Claude CLI format."
                        },
                        "extra_args": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Additional command-line arguments for the CLI engine"
                        },
                        "include_dependency_logs": {
                            "type": "boolean",
                            "description": "Include logs from dependency tasks in the prompt. When true, the last N lines of logs from all dependency tasks will be added to the prompt with the header '===LAST TASK RESULTS==='",
                            "default": false
                        },
                        "dependency_log_lines": {
                            "type": "integer",
                            "description": "Number of lines to include from each dependency task log (default: 100)",
                            "default": 100
                        }
                    },
                    "required": ["prompt"]
                }
            }),
            json!({
                "name": "get_task",
                "description": "Get detailed information about a specific task including status, output, and timing",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to retrieve"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "list_tasks",
                "description": "List tasks with optional filtering by status and tags",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "status": {
                            "type": "array",
                            "items": {"type": "string", "enum": status_enum},
                            "description": "Filter by task status"
                        },
                        "tags": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Filter by tags (tasks must have all specified tags)"
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Maximum number of tasks to return",
                            "default": 20
                        },
                        "offset": {
                            "type": "integer",
                            "description": "Number of tasks to skip",
                            "default": 0
                        }
                    }
                }
            }),
            json!({
                "name": "wait_task",
                "description": "Wait for a specific task to complete. Returns the task when it reaches a terminal state (completed, failed, or cancelled)",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to wait for"
                        },
                        "timeout": {
                            "type": "string",
                            "description": "Maximum time to wait (e.g., '5m', '1h'). Empty for no timeout"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "wait_multiple",
                "description": "Wait for multiple tasks to complete. Can wait for all tasks or return when any task completes",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_ids": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "List of task IDs to wait for"
                        },
                        "wait_all": {
                            "type": "boolean",
                            "description": "Wait for all tasks (true) or return when first completes (false)",
                            "default": true
                        },
                        "timeout": {
                            "type": "string",
                            "description": "Maximum time to wait (e.g., '10m', '1h')"
                        }
                    },
                    "required": ["task_ids"]
                }
            }),
            json!({
                "name": "cancel_task",
                "description": "Cancel a running or pending task",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to cancel"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "pause_task",
                "description": "Pause a running or pending task without marking it as cancelled",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to pause"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "resume_task",
                "description": "Resume a paused task by spawning a new agent task that continues work",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The paused task ID to resume"
                        },
                        "prompt": {
                            "type": "string",
                            "description": "Additional resume prompt/instructions"
                        },
                        "model": {
                            "type": "string",
                            "description": "AI model to use (optional; defaults to previous task model)",
                            "enum": model_enum
                        },
                        "background": {
                            "type": "boolean",
                            "description": "Run in background (true) or wait for completion (false). Default: true",
                            "default": true
                        },
                        "timeout": {
                            "type": "string",
                            "description": "Timeout duration (e.g., '30m', '1h'). Empty for no timeout"
                        },
                        "tags": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Tags for organizing and filtering tasks (optional; defaults to previous task tags)"
                        }
                    },
                    "required": ["task_id", "prompt"]
                }
            }),
            json!({
                "name": "delete_task",
                "description": "Delete a completed, failed, or cancelled task from the store",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to delete"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "purge_task",
                "description": "Remove a task and best-effort delete its log file. Purging a missing task succeeds.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to purge"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "get_stats",
                "description": "Get orchestrator statistics including task counts by status",
                "inputSchema": {
                    "type": "object",
                    "properties": {}
                }
            }),
            json!({
                "name": "get_task_output",
                "description": "Get the output (stdout/stderr) of a task. For running tasks, returns current output. For completed tasks, returns full or tail output",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID"
                        },
                        "tail": {
                            "type": "boolean",
                            "description": "Return only the last 50 lines (default: false for completed, true for running)"
                        }
                    },
                    "required": ["task_id"]
                }
            }),
            json!({
                "name": "set_progress",
                "description": "Update the progress of a running task. This tool should be called by the agent task itself to report its progress. The percentage will be sanitized to be between 0 and 100.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {
                            "type": "string",
                            "description": "The task ID to update progress for"
                        },
                        "percentage": {
                            "type": "integer",
                            "description": "Progress percentage (0-100). Any non-numeric characters will be stripped."
                        },
                        "description": {
                            "type": "string",
                            "description": "Brief description of current progress or what the task is currently doing"
                        }
                    },
                    "required": ["task_id", "percentage"]
                }
            }),
        ]
    }
}

#[derive(Deserialize)]
struct TaskIdArgs {
    task_id: String,
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("invalid parameters: {e}"))
}

fn default_true() -> bool {
    true
}

fn parse_timeout(timeout: &str) -> Result<Option<std::time::Duration>, String> {
    if timeout.is_empty() {
        return Ok(None);
    }
    let parsed: mesnada_core::models::Duration = timeout
        .parse()
        .map_err(|e| format!("invalid timeout: {e}"))?;
    Ok((!parsed.is_zero()).then(|| parsed.as_std()))
}

/// Accepts integers, floats (truncated) and strings; strings are stripped
/// of everything but digits (keeping one leading minus) and parse to 0
/// when nothing numeric remains.
fn coerce_percentage(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                Ok(f as i64)
            } else {
                Err(format!("invalid percentage value: {n}"))
            }
        }
        Value::String(s) => {
            let mut sanitized = String::new();
            for ch in s.chars() {
                if ch.is_ascii_digit() || (ch == '-' && sanitized.is_empty()) {
                    sanitized.push(ch);
                }
            }
            Ok(sanitized.parse().unwrap_or(0))
        }
        other => Err(format!("invalid percentage type: {other}")),
    }
}
