use thiserror::Error;

use crate::models::{InvalidEngine, ParseDurationError, Task, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("failed to read store file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse store file: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("failed to create store directory: {0}")]
    CreateDir(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("failed to create log file: {0}")]
    LogFile(#[source] std::io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("prompt is required")]
    PromptRequired,
    #[error("invalid timeout: {0}")]
    InvalidTimeout(#[from] ParseDurationError),
    #[error(transparent)]
    InvalidEngine(#[from] InvalidEngine),
    #[error("task {id} is already in terminal state: {status}")]
    AlreadyTerminal { id: String, status: TaskStatus },
    #[error("task {id} is not paused (status={status})")]
    NotPaused { id: String, status: TaskStatus },
    #[error("timeout waiting for task {id}")]
    WaitTimeout { id: String, task: Box<Task> },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[source] serde_yaml::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[source] serde_json::Error),
    #[error("failed to write config: {0}")]
    Write(#[source] std::io::Error),
}
