//! Multi-engine supervisor: routes every operation to the adapter that
//! owns the task's child process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use mesnada_core::agent::{CompletionTx, Spawner};
use mesnada_core::error::AgentError;
use mesnada_core::models::{Engine, Task, TaskStatus};

use crate::host::CliSpawner;
use crate::profile::EngineProfile;

pub struct EngineManager {
    copilot: CliSpawner,
    claude: CliSpawner,
    gemini: CliSpawner,
    opencode: CliSpawner,
    /// Which engine owns which task, populated at spawn time. Entries for
    /// completed tasks are lazily retained; forwarding an unknown id to
    /// the default adapter is not an error.
    task_engines: RwLock<HashMap<String, Engine>>,
}

impl EngineManager {
    /// Builds one adapter per engine, all sharing `log_dir` and the
    /// completion channel. The directory is created and absolutized so
    /// every task's `log_file` is a full path.
    pub fn new(log_dir: impl Into<PathBuf>, completions: CompletionTx) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        let log_dir = absolutize(&log_dir);

        Ok(EngineManager {
            copilot: CliSpawner::new(EngineProfile::Copilot, log_dir.clone(), completions.clone()),
            claude: CliSpawner::new(EngineProfile::Claude, log_dir.clone(), completions.clone()),
            gemini: CliSpawner::new(EngineProfile::Gemini, log_dir.clone(), completions.clone()),
            opencode: CliSpawner::new(EngineProfile::OpenCode, log_dir, completions),
            task_engines: RwLock::new(HashMap::new()),
        })
    }

    fn adapter_for(&self, engine: Engine) -> &CliSpawner {
        match engine {
            Engine::Copilot => &self.copilot,
            Engine::Claude => &self.claude,
            Engine::Gemini => &self.gemini,
            Engine::Opencode => &self.opencode,
        }
    }

    fn engine_of(&self, task_id: &str) -> Engine {
        self.task_engines
            .read()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Spawner for EngineManager {
    async fn spawn(&self, task: &mut Task) -> Result<(), AgentError> {
        self.task_engines
            .write()
            .unwrap()
            .insert(task.id.clone(), task.engine);
        self.adapter_for(task.engine).spawn(task).await
    }

    async fn cancel(&self, task_id: &str) -> Result<(), AgentError> {
        self.adapter_for(self.engine_of(task_id))
            .stop_with(task_id, TaskStatus::Cancelled)
            .await
    }

    async fn pause(&self, task_id: &str) -> Result<(), AgentError> {
        self.adapter_for(self.engine_of(task_id))
            .stop_with(task_id, TaskStatus::Paused)
            .await
    }

    async fn wait(&self, task_id: &str) {
        self.adapter_for(self.engine_of(task_id)).wait(task_id).await
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.adapter_for(self.engine_of(task_id)).is_running(task_id)
    }

    fn running_count(&self) -> usize {
        self.copilot.running_count()
            + self.claude.running_count()
            + self.gemini.running_count()
            + self.opencode.running_count()
    }

    async fn shutdown(&self) {
        self.copilot.shutdown().await;
        self.claude.shutdown().await;
        self.gemini.shutdown().await;
        self.opencode.shutdown().await;
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
