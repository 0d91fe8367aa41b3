//! Coordinates agent tasks: dependency gating, completion fan-out, waiting,
//! explicit stops and the resume flow.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{CompletionRx, Spawner};
use crate::error::OrchestratorError;
use crate::models::{
    Duration, Engine, ListRequest, ResumeOptions, SpawnRequest, Stats, Task, TaskProgress,
    TaskProgressInfo, TaskStatus,
};
use crate::store::FileStore;

const DEFAULT_DEPENDENCY_LOG_LINES: usize = 100;

/// Orchestrator construction options, typically derived from configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub max_parallel: usize,
    pub default_engine: Engine,
    pub default_mcp_config: String,
}

/// Cheap-to-clone handle over the scheduler state. One instance is passed
/// to every tool dispatcher and transport.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<FileStore>,
    supervisor: Arc<dyn Spawner>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Task>>>>,
    #[allow(dead_code)] // advisory; strict enforcement is a planned enhancement
    max_parallel: usize,
    default_engine: Engine,
    default_mcp_config: String,
}

impl Orchestrator {
    /// Builds the orchestrator, reconciles tasks orphaned by a previous
    /// crash and starts draining the adapters' completion channel.
    pub fn new(
        opts: Options,
        store: Arc<FileStore>,
        supervisor: Arc<dyn Spawner>,
        mut completions: CompletionRx,
    ) -> Orchestrator {
        let max_parallel = if opts.max_parallel == 0 { 5 } else { opts.max_parallel };

        // Tasks persisted as running belonged to a process that no longer
        // exists; leaving them running would wedge their dependents.
        let orphaned = store.list(&ListRequest {
            status: vec![TaskStatus::Running],
            ..Default::default()
        });
        for mut task in orphaned {
            warn!(task_id = %task.id, "marking orphaned running task as failed");
            task.status = TaskStatus::Failed;
            task.error = "orchestrator restarted while task was running".to_string();
            task.completed_at = Some(Utc::now());
            store.save(task);
        }

        let orch = Orchestrator {
            inner: Arc::new(Inner {
                store,
                supervisor,
                subscribers: Mutex::new(HashMap::new()),
                max_parallel,
                default_engine: opts.default_engine,
                default_mcp_config: opts.default_mcp_config,
            }),
        };

        let drainer = orch.clone();
        tokio::spawn(async move {
            while let Some(task) = completions.recv().await {
                drainer.on_task_complete(task).await;
            }
        });

        orch
    }

    /// Creates and optionally starts a new agent task.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<Task, OrchestratorError> {
        if req.prompt.is_empty() {
            return Err(OrchestratorError::PromptRequired);
        }

        let work_dir = if req.work_dir.is_empty() {
            ".".to_string()
        } else {
            req.work_dir
        };

        let timeout = if req.timeout.is_empty() {
            Duration::ZERO
        } else {
            req.timeout.parse()?
        };

        let mcp_config = if req.mcp_config.is_empty() {
            self.inner.default_mcp_config.clone()
        } else {
            req.mcp_config
        };

        let engine = req.engine.unwrap_or(self.inner.default_engine);

        let mut prompt = req.prompt;
        if req.include_dependency_logs && !req.dependencies.is_empty() {
            let lines = if req.dependency_log_lines == 0 {
                DEFAULT_DEPENDENCY_LOG_LINES
            } else {
                req.dependency_log_lines
            };
            let logs = self.dependency_logs(&req.dependencies, lines);
            if !logs.is_empty() {
                prompt = format!("{prompt}\n\n{logs}");
            }
        }

        let task = Task {
            id: generate_id(),
            prompt,
            work_dir,
            status: TaskStatus::Pending,
            engine,
            pid: None,
            output: String::new(),
            output_tail: String::new(),
            error: String::new(),
            exit_code: None,
            model: req.model,
            log_file: String::new(),
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependencies: req.dependencies,
            tags: req.tags,
            priority: req.priority,
            timeout,
            mcp_config,
            extra_args: req.extra_args,
        };

        info!(
            task_event = "received",
            task_id = %task.id,
            status = %task.status,
            engine = %task.engine,
            work_dir = %task.work_dir,
            model = %task.model,
            dependencies = ?task.dependencies,
            tags = ?task.tags,
            priority = task.priority,
            timeout = %task.timeout,
            prompt_len = task.prompt.len(),
        );

        let id = task.id.clone();
        self.inner.store.save(task.clone());

        if self.can_start(&task) {
            let reason = if task.dependencies.is_empty() {
                "no_dependencies"
            } else {
                "dependencies_satisfied"
            };
            info!(task_event = "startable", task_id = %id, reason);
            if req.background {
                let orch = self.clone();
                let task = task.clone();
                tokio::spawn(async move { orch.start_task(task).await });
            } else {
                self.start_task(task.clone()).await;
            }
        }

        Ok(self.inner.store.get(&id).unwrap_or(task))
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        Ok(self.inner.store.get(task_id)?)
    }

    pub fn list_tasks(&self, req: &ListRequest) -> Vec<Task> {
        self.inner.store.list(req)
    }

    /// Blocks until the task reaches a terminal state. On timeout the
    /// error carries the current snapshot so callers get both.
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Option<StdDuration>,
    ) -> Result<Task, OrchestratorError> {
        let task = self.inner.store.get(task_id)?;
        if task.is_terminal() {
            return Ok(task);
        }

        let (tx, mut rx) = mpsc::channel::<Task>(1);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(tx.clone());

        // Also watch the adapter's done signal: it closes the race where
        // the task finishes between the terminal check above and the
        // subscriber registration.
        let helper = {
            let orch = self.clone();
            let id = task_id.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                orch.inner.supervisor.wait(&id).await;
                if let Ok(task) = orch.inner.store.get(&id) {
                    if task.is_terminal() {
                        let _ = tx.try_send(task);
                    }
                }
            })
        };

        let _guard = WaitGuard {
            orch: self.clone(),
            task_id: task_id.to_string(),
            tx,
            helper: helper.abort_handle(),
        };

        let received = match timeout {
            Some(d) => tokio::time::timeout(d, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        };

        match received {
            Some(task) => Ok(task),
            None => {
                let snapshot = self.inner.store.get(task_id).unwrap_or(task);
                Err(OrchestratorError::WaitTimeout {
                    id: task_id.to_string(),
                    task: Box::new(snapshot),
                })
            }
        }
    }

    /// Waits for several tasks at once. Partial results are always
    /// returned; `timed_out` tells the caller whether the overall deadline
    /// expired first.
    pub async fn wait_multiple(
        &self,
        task_ids: &[String],
        wait_all: bool,
        timeout: Option<StdDuration>,
    ) -> WaitMultipleOutcome {
        let results: Arc<Mutex<HashMap<String, Task>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut set = JoinSet::new();

        for id in task_ids {
            let orch = self.clone();
            let id = id.clone();
            let results = results.clone();
            set.spawn(async move {
                match orch.wait(&id, None).await {
                    Ok(task) => {
                        let terminal = task.is_terminal();
                        results.lock().unwrap().insert(id, task);
                        terminal
                    }
                    // Unknown ids are tolerated per-task.
                    Err(_) => false,
                }
            });
        }

        let drain = async {
            while let Some(res) = set.join_next().await {
                if let Ok(terminal) = res {
                    if !wait_all && terminal {
                        break;
                    }
                }
            }
        };

        let timed_out = match timeout {
            Some(d) => tokio::time::timeout(d, drain).await.is_err(),
            None => {
                drain.await;
                false
            }
        };
        set.abort_all();

        let tasks = results.lock().unwrap().clone();
        WaitMultipleOutcome { tasks, timed_out }
    }

    /// Cancels a running or pending task.
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = self.inner.store.get(task_id)?;
        if task.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                id: task_id.to_string(),
                status: task.status,
            });
        }

        if task.status == TaskStatus::Running {
            self.inner.supervisor.cancel(task_id).await?;
        }

        // The reaper may have already written the final record (with exit
        // code and output); only overlay what cancel owns.
        let mut task = self.inner.store.get(task_id)?;
        task.status = TaskStatus::Cancelled;
        if task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
        self.inner.store.save(task.clone());
        log_finished(&task);
        Ok(())
    }

    /// Pauses a running or pending task. Pausing is a destructive stop of
    /// the current attempt; `resume` spawns a successor task.
    pub async fn pause(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let task = self.inner.store.get(task_id)?;
        if task.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                id: task_id.to_string(),
                status: task.status,
            });
        }

        if task.status == TaskStatus::Running {
            self.inner.supervisor.pause(task_id).await?;
        }

        let mut task = self.inner.store.get(task_id)?;
        task.status = TaskStatus::Paused;
        if task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
        self.inner.store.save(task.clone());
        log_finished(&task);
        Ok(task)
    }

    /// Creates a new task continuing work from a paused one. The previous
    /// task stays paused; the successor gets a fresh id.
    pub async fn resume(
        &self,
        task_id: &str,
        opts: ResumeOptions,
    ) -> Result<Task, OrchestratorError> {
        let prev = self.inner.store.get(task_id)?;
        if prev.status != TaskStatus::Paused {
            return Err(OrchestratorError::NotPaused {
                id: task_id.to_string(),
                status: prev.status,
            });
        }
        if opts.prompt.trim().is_empty() {
            return Err(OrchestratorError::PromptRequired);
        }

        let model = if opts.model.is_empty() {
            prev.model.clone()
        } else {
            opts.model
        };

        let timeout = if opts.timeout.is_empty() && !prev.timeout.is_zero() {
            prev.timeout.to_string()
        } else {
            opts.timeout
        };

        let tags = opts.tags.unwrap_or_else(|| prev.tags.clone());

        let resume_prompt = format!(
            "Resume work from previous task_id: {}\nPrevious task log file path: {}\n\nAdditional resume instructions:\n{}\n",
            prev.id,
            prev.log_file,
            opts.prompt.trim(),
        );

        self.spawn(SpawnRequest {
            prompt: resume_prompt,
            work_dir: prev.work_dir,
            model,
            engine: None,
            dependencies: prev.dependencies,
            tags,
            priority: prev.priority,
            timeout,
            mcp_config: prev.mcp_config,
            extra_args: prev.extra_args,
            background: opts.background,
            include_dependency_logs: false,
            dependency_log_lines: 0,
        })
        .await
    }

    /// Removes a task from the store, cancelling it first when running.
    /// A child that already died does not block deletion.
    pub async fn delete(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = self.inner.store.get(task_id)?;

        if task.status == TaskStatus::Running {
            if let Err(e) = self.inner.supervisor.cancel(task_id).await {
                warn!(task_id, error = %e, "cancel before delete failed (process may be dead)");
            }
            let mut task = self.inner.store.get(task_id).unwrap_or(task);
            task.status = TaskStatus::Cancelled;
            if task.completed_at.is_none() {
                task.completed_at = Some(Utc::now());
            }
            self.inner.store.save(task);
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        Ok(self.inner.store.delete(task_id)?)
    }

    /// Deletes the task record and best-effort unlinks its log file.
    /// Purging a missing task succeeds.
    pub async fn purge(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let task = match self.inner.store.get(task_id) {
            Ok(task) => task,
            Err(crate::error::StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if task.status == TaskStatus::Running {
            if let Err(e) = self.inner.supervisor.cancel(task_id).await {
                warn!(task_id, error = %e, "cancel during purge failed (process may be dead)");
            }
            let mut task = self.inner.store.get(task_id).unwrap_or(task.clone());
            task.status = TaskStatus::Cancelled;
            if task.completed_at.is_none() {
                task.completed_at = Some(Utc::now());
            }
            self.inner.store.save(task);
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        if !task.log_file.is_empty() {
            let _ = std::fs::remove_file(&task.log_file);
        }

        match self.inner.store.delete(task_id) {
            Ok(()) | Err(crate::error::StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the task's progress entry. The percentage is clamped to
    /// [0, 100]; the status is never changed here.
    pub fn set_progress(
        &self,
        task_id: &str,
        percentage: i64,
        description: &str,
    ) -> Result<(), OrchestratorError> {
        let mut task = self.inner.store.get(task_id)?;
        task.progress = Some(TaskProgress {
            percentage: percentage.clamp(0, 100),
            description: description.to_string(),
            updated_at: Utc::now(),
        });
        self.inner.store.save(task);
        Ok(())
    }

    /// Counts by status across the whole store plus live progress for
    /// running tasks. `running` reflects the supervisor's live registry.
    pub fn stats(&self) -> Stats {
        let tasks = self.inner.store.list(&ListRequest::default());
        let mut stats = Stats {
            running: self.inner.supervisor.running_count(),
            ..Default::default()
        };

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => {
                    if let Some(progress) = &task.progress {
                        stats.running_progress.insert(
                            task.id.clone(),
                            TaskProgressInfo {
                                task_id: task.id.clone(),
                                percentage: progress.percentage,
                                description: progress.description.clone(),
                                updated_at: progress.updated_at,
                            },
                        );
                    }
                }
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stops all children, then closes the store after a final flush.
    pub async fn shutdown(&self) {
        self.inner.supervisor.shutdown().await;
        self.inner.store.close().await;
    }

    async fn on_task_complete(&self, task: Task) {
        self.inner.store.save(task.clone());
        log_finished(&task);

        let subs = self.inner.subscribers.lock().unwrap().remove(&task.id);
        if let Some(subs) = subs {
            for ch in subs {
                // Capacity-1, non-blocking: slow consumers re-read the store.
                let _ = ch.try_send(task.clone());
            }
        }

        self.process_dependent_tasks(&task).await;
    }

    async fn process_dependent_tasks(&self, completed: &Task) {
        if completed.status != TaskStatus::Completed {
            return;
        }

        let pending = self.inner.store.list(&ListRequest {
            status: vec![TaskStatus::Pending],
            ..Default::default()
        });

        for task in pending {
            if self.can_start(&task) {
                info!(
                    task_event = "startable",
                    task_id = %task.id,
                    reason = %format!("dependency_completed={}", completed.id),
                );
                let orch = self.clone();
                tokio::spawn(async move { orch.start_task(task).await });
            }
        }
    }

    fn can_start(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.inner
                .store
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    fn start_task(
        &self,
        mut task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.inner.supervisor.spawn(&mut task).await {
                Ok(()) => self.inner.store.save(task),
                Err(e) => {
                    task.status = TaskStatus::Failed;
                    task.error = e.to_string();
                    task.completed_at = Some(Utc::now());
                    // A task that never started still finishes: subscribers are
                    // woken and dependents re-evaluated.
                    self.on_task_complete(task).await;
                }
            }
        })
    }

    /// Collects the tail of each dependency's log file for prompt
    /// inclusion. Unreadable logs are skipped.
    fn dependency_logs(&self, dependencies: &[String], lines: usize) -> String {
        let mut out = String::from("===LAST TASK RESULTS===\n\n");
        let mut any = false;

        for dep_id in dependencies {
            let dep = match self.inner.store.get(dep_id) {
                Ok(dep) => dep,
                Err(e) => {
                    warn!(dep_id = %dep_id, error = %e, "failed to get dependency task");
                    continue;
                }
            };
            if dep.log_file.is_empty() {
                warn!(dep_id = %dep_id, "dependency task has no log file");
                continue;
            }
            let content = match std::fs::read_to_string(&dep.log_file) {
                Ok(content) => content,
                Err(e) => {
                    warn!(dep_id = %dep_id, log_file = %dep.log_file, error = %e, "failed to read dependency log");
                    continue;
                }
            };

            out.push_str(&format!("--- Task: {dep_id} ---\n"));
            out.push_str(&crate::util::tail_lines(&content, lines));
            out.push_str("\n\n");
            any = true;
        }

        if any {
            out
        } else {
            String::new()
        }
    }
}

/// Result of `wait_multiple`: whatever terminal records were collected,
/// plus whether the overall deadline fired.
#[derive(Debug, Default)]
pub struct WaitMultipleOutcome {
    pub tasks: HashMap<String, Task>,
    pub timed_out: bool,
}

struct WaitGuard {
    orch: Orchestrator,
    task_id: String,
    tx: mpsc::Sender<Task>,
    helper: AbortHandle,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.helper.abort();
        let mut subs = self.orch.inner.subscribers.lock().unwrap();
        if let Some(list) = subs.get_mut(&self.task_id) {
            list.retain(|s| !s.same_channel(&self.tx));
            if list.is_empty() {
                subs.remove(&self.task_id);
            }
        }
    }
}

fn generate_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    format!("task-{}", &uuid[..8])
}

fn log_finished(task: &Task) {
    let duration = match (task.started_at, task.completed_at) {
        (Some(start), Some(end)) => {
            Duration::new((end - start).to_std().unwrap_or_default()).to_string()
        }
        _ => String::new(),
    };
    info!(
        task_event = "finished",
        task_id = %task.id,
        status = %task.status,
        exit_code = ?task.exit_code,
        error = %task.error,
        duration = %duration,
        log_file = %task.log_file,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CompletionTx;
    use crate::error::AgentError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io;

    /// Test double standing in for the engine manager: "running" tasks sit
    /// in a set until the test completes them over the completion channel.
    struct MockSpawner {
        completions: CompletionTx,
        live: Mutex<HashMap<String, Task>>,
        cancelled: Mutex<HashSet<String>>,
        fail_spawn: bool,
    }

    impl MockSpawner {
        fn new(completions: CompletionTx) -> Arc<Self> {
            Arc::new(MockSpawner {
                completions,
                live: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
                fail_spawn: false,
            })
        }

        fn failing(completions: CompletionTx) -> Arc<Self> {
            Arc::new(MockSpawner {
                completions,
                live: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(HashSet::new()),
                fail_spawn: true,
            })
        }

        /// Simulates the child exiting naturally with `exit_code`.
        fn finish(&self, task_id: &str, exit_code: i32) {
            let mut task = self.live.lock().unwrap().remove(task_id).expect("task not live");
            task.exit_code = Some(exit_code);
            task.completed_at = Some(Utc::now());
            task.status = if exit_code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            self.completions.send(task).unwrap();
        }

        fn was_cancelled(&self, task_id: &str) -> bool {
            self.cancelled.lock().unwrap().contains(task_id)
        }
    }

    #[async_trait]
    impl Spawner for MockSpawner {
        async fn spawn(&self, task: &mut Task) -> Result<(), AgentError> {
            if self.fail_spawn {
                return Err(AgentError::Spawn {
                    program: "copilot".into(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such binary"),
                });
            }
            task.prompt = format!("You are the task_id: {}\n\n{}", task.id, task.prompt);
            task.status = TaskStatus::Running;
            task.pid = Some(4242);
            task.started_at = Some(Utc::now());
            task.log_file = format!("/tmp/{}.log", task.id);
            self.live.lock().unwrap().insert(task.id.clone(), task.clone());
            Ok(())
        }

        async fn cancel(&self, task_id: &str) -> Result<(), AgentError> {
            self.cancelled.lock().unwrap().insert(task_id.to_string());
            let mut task = self
                .live
                .lock()
                .unwrap()
                .remove(task_id)
                .ok_or_else(|| AgentError::ProcessNotFound(task_id.to_string()))?;
            // Explicit stop: the status marker is preserved over the exit
            // code the dying child reports.
            task.status = TaskStatus::Cancelled;
            task.exit_code = Some(143);
            task.completed_at = Some(Utc::now());
            self.completions.send(task).unwrap();
            Ok(())
        }

        async fn pause(&self, task_id: &str) -> Result<(), AgentError> {
            let mut task = self
                .live
                .lock()
                .unwrap()
                .remove(task_id)
                .ok_or_else(|| AgentError::ProcessNotFound(task_id.to_string()))?;
            task.status = TaskStatus::Paused;
            task.exit_code = Some(143);
            task.completed_at = Some(Utc::now());
            self.completions.send(task).unwrap();
            Ok(())
        }

        async fn wait(&self, _task_id: &str) {}

        fn is_running(&self, task_id: &str) -> bool {
            self.live.lock().unwrap().contains_key(task_id)
        }

        fn running_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        async fn shutdown(&self) {}
    }

    struct Fixture {
        orch: Orchestrator,
        spawner: Arc<MockSpawner>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(MockSpawner::new)
    }

    fn fixture_with(make: fn(CompletionTx) -> Arc<MockSpawner>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("tasks.json")).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = make(tx);
        let orch = Orchestrator::new(Options::default(), store, spawner.clone(), rx);
        Fixture {
            orch,
            spawner,
            _dir: dir,
        }
    }

    fn spawn_req(prompt: &str) -> SpawnRequest {
        SpawnRequest {
            prompt: prompt.to_string(),
            background: false,
            ..Default::default()
        }
    }

    async fn wait_for_status(orch: &Orchestrator, id: &str, status: TaskStatus) -> Task {
        for _ in 0..200 {
            if let Ok(task) = orch.get_task(id) {
                if task.status == status {
                    return task;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn spawn_requires_prompt() {
        let f = fixture();
        let err = f.orch.spawn(spawn_req("")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PromptRequired));
    }

    #[tokio::test]
    async fn spawn_rejects_bad_timeout() {
        let f = fixture();
        let err = f
            .orch
            .spawn(SpawnRequest {
                timeout: "banana".into(),
                ..spawn_req("hi")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTimeout(_)));
    }

    #[tokio::test]
    async fn spawn_starts_task_and_prefixes_prompt() {
        let f = fixture();
        let task = f.orch.spawn(spawn_req("echo hi")).await.unwrap();
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.prompt.starts_with(&format!("You are the task_id: {}\n\n", task.id)));
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed_and_fans_out() {
        let f = fixture_with(MockSpawner::failing);
        let task = f.orch.spawn(spawn_req("boom")).await.unwrap();
        let task = wait_for_status(&f.orch, &task.id, TaskStatus::Failed).await;
        assert!(task.error.contains("no such binary"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn dependency_gating_wakes_dependents() {
        let f = fixture();

        let a = f.orch.spawn(spawn_req("echo hi")).await.unwrap();
        let b = f
            .orch
            .spawn(SpawnRequest {
                dependencies: vec![a.id.clone()],
                ..spawn_req("after a")
            })
            .await
            .unwrap();
        assert_eq!(b.status, TaskStatus::Pending);

        f.spawner.finish(&a.id, 0);

        // B starts without further external input once A completes.
        wait_for_status(&f.orch, &b.id, TaskStatus::Running).await;
        f.spawner.finish(&b.id, 0);

        let outcome = f
            .orch
            .wait_multiple(
                &[a.id.clone(), b.id.clone()],
                true,
                Some(StdDuration::from_secs(5)),
            )
            .await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.tasks.len(), 2);
        assert!(outcome.tasks.values().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn failed_dependency_leaves_dependent_pending() {
        let f = fixture();
        let a = f.orch.spawn(spawn_req("will fail")).await.unwrap();
        let b = f
            .orch
            .spawn(SpawnRequest {
                dependencies: vec![a.id.clone()],
                ..spawn_req("after a")
            })
            .await
            .unwrap();

        f.spawner.finish(&a.id, 1);
        wait_for_status(&f.orch, &a.id, TaskStatus::Failed).await;

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(f.orch.get_task(&b.id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_preserves_status_over_exit_code() {
        let f = fixture();
        let c = f.orch.spawn(spawn_req("long running")).await.unwrap();
        assert_eq!(c.status, TaskStatus::Running);

        f.orch.cancel(&c.id).await.unwrap();
        assert!(f.spawner.was_cancelled(&c.id));

        let c = wait_for_status(&f.orch, &c.id, TaskStatus::Cancelled).await;
        assert_eq!(c.exit_code, Some(143));
        assert!(c.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_pending_never_touches_supervisor() {
        let f = fixture();
        let a = f.orch.spawn(spawn_req("dep")).await.unwrap();
        let b = f
            .orch
            .spawn(SpawnRequest {
                dependencies: vec![a.id.clone()],
                ..spawn_req("blocked")
            })
            .await
            .unwrap();

        f.orch.cancel(&b.id).await.unwrap();
        assert!(!f.spawner.was_cancelled(&b.id));
        let b = f.orch.get_task(&b.id).unwrap();
        assert_eq!(b.status, TaskStatus::Cancelled);
        assert!(b.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_terminal_is_an_error() {
        let f = fixture();
        let t = f.orch.spawn(spawn_req("quick")).await.unwrap();
        f.spawner.finish(&t.id, 0);
        wait_for_status(&f.orch, &t.id, TaskStatus::Completed).await;

        let err = f.orch.cancel(&t.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn pause_then_resume_spawns_successor() {
        let f = fixture();
        let d = f.orch.spawn(spawn_req("original work")).await.unwrap();

        let paused = f.orch.pause(&d.id).await.unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        let d = wait_for_status(&f.orch, &d.id, TaskStatus::Paused).await;

        let successor = f
            .orch
            .resume(
                &d.id,
                ResumeOptions {
                    prompt: "keep going".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_ne!(successor.id, d.id);
        assert!(successor
            .prompt
            .contains(&format!("Resume work from previous task_id: {}", d.id)));
        assert!(successor
            .prompt
            .contains(&format!("Previous task log file path: {}", d.log_file)));
        assert!(successor.prompt.contains("keep going"));
        assert_eq!(successor.work_dir, d.work_dir);

        // The paused task is untouched by the resume.
        assert_eq!(f.orch.get_task(&d.id).unwrap().status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let f = fixture();
        let t = f.orch.spawn(spawn_req("running")).await.unwrap();
        let err = f
            .orch
            .resume(
                &t.id,
                ResumeOptions {
                    prompt: "go".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotPaused { .. }));
    }

    #[tokio::test]
    async fn set_progress_clamps_percentage() {
        let f = fixture();
        let e = f.orch.spawn(spawn_req("report progress")).await.unwrap();

        f.orch.set_progress(&e.id, 45, "half").unwrap();
        assert_eq!(f.orch.get_task(&e.id).unwrap().progress.unwrap().percentage, 45);

        f.orch.set_progress(&e.id, 150, "over").unwrap();
        assert_eq!(f.orch.get_task(&e.id).unwrap().progress.unwrap().percentage, 100);

        f.orch.set_progress(&e.id, -10, "under").unwrap();
        assert_eq!(f.orch.get_task(&e.id).unwrap().progress.unwrap().percentage, 0);
    }

    #[tokio::test]
    async fn purge_is_idempotent_and_removes_log() {
        let f = fixture();
        f.orch.purge("task-nonexistent").await.unwrap();

        let t = f.orch.spawn(spawn_req("purge me")).await.unwrap();
        f.spawner.finish(&t.id, 0);
        let t = wait_for_status(&f.orch, &t.id, TaskStatus::Completed).await;

        let log_path = f._dir.path().join("purge.log");
        std::fs::write(&log_path, "log data").unwrap();
        let mut with_log = t.clone();
        with_log.log_file = log_path.to_string_lossy().into_owned();
        f.orch.inner.store.save(with_log);

        f.orch.purge(&t.id).await.unwrap();
        assert!(f.orch.get_task(&t.id).is_err());
        assert!(!log_path.exists());

        f.orch.purge(&t.id).await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_terminal_tasks() {
        let f = fixture();
        let t = f.orch.spawn(spawn_req("fast")).await.unwrap();
        f.spawner.finish(&t.id, 0);
        wait_for_status(&f.orch, &t.id, TaskStatus::Completed).await;

        let task = f.orch.wait(&t.id, Some(StdDuration::from_secs(1))).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn wait_timeout_returns_snapshot() {
        let f = fixture();
        let t = f.orch.spawn(spawn_req("slow")).await.unwrap();

        let err = f
            .orch
            .wait(&t.id, Some(StdDuration::from_millis(50)))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::WaitTimeout { id, task } => {
                assert_eq!(id, t.id);
                assert_eq!(task.status, TaskStatus::Running);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The task itself is untouched by the timeout.
        assert_eq!(f.orch.get_task(&t.id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn wait_wakes_on_completion() {
        let f = fixture();
        let t = f.orch.spawn(spawn_req("finishes soon")).await.unwrap();

        let waiter = {
            let orch = f.orch.clone();
            let id = t.id.clone();
            tokio::spawn(async move { orch.wait(&id, Some(StdDuration::from_secs(5))).await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        f.spawner.finish(&t.id, 0);

        let task = waiter.await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn wait_multiple_any_returns_on_first_terminal() {
        let f = fixture();
        let a = f.orch.spawn(spawn_req("a")).await.unwrap();
        let b = f.orch.spawn(spawn_req("b")).await.unwrap();

        let waiter = {
            let orch = f.orch.clone();
            let ids = vec![a.id.clone(), b.id.clone()];
            tokio::spawn(async move {
                orch.wait_multiple(&ids, false, Some(StdDuration::from_secs(5))).await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        f.spawner.finish(&a.id, 0);

        let outcome = waiter.await.unwrap();
        assert!(!outcome.timed_out);
        assert!(outcome.tasks.contains_key(&a.id));
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let f = fixture();
        let a = f.orch.spawn(spawn_req("a")).await.unwrap();
        let _b = f.orch.spawn(spawn_req("b")).await.unwrap();
        f.spawner.finish(&a.id, 0);
        wait_for_status(&f.orch, &a.id, TaskStatus::Completed).await;

        f.orch.set_progress(&_b.id, 30, "working").unwrap();
        let stats = f.orch.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.running_progress.len(), 1);
    }

    #[tokio::test]
    async fn restart_reconciles_orphaned_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        {
            let store = FileStore::open(&path).unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let spawner = MockSpawner::new(tx);
            let orch = Orchestrator::new(Options::default(), store.clone(), spawner.clone(), rx);
            let t = orch.spawn(spawn_req("survives restart")).await.unwrap();
            assert_eq!(t.status, TaskStatus::Running);
            store.close().await;
        }

        // A fresh orchestrator over the same store finds the running task
        // with no live child and fails it.
        let store = FileStore::open(&path).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = MockSpawner::new(tx);
        let orch = Orchestrator::new(Options::default(), store, spawner, rx);
        let tasks = orch.list_tasks(&ListRequest::default());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.contains("restarted"));
        assert!(tasks[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn dependency_logs_are_included_in_prompt() {
        let f = fixture();
        let a = f.orch.spawn(spawn_req("dep with logs")).await.unwrap();

        f.spawner.finish(&a.id, 0);
        wait_for_status(&f.orch, &a.id, TaskStatus::Completed).await;

        let log_path = f._dir.path().join("dep.log");
        std::fs::write(&log_path, "line1\nline2\nline3\n").unwrap();
        let mut a_final = f.orch.get_task(&a.id).unwrap();
        a_final.log_file = log_path.to_string_lossy().into_owned();
        f.orch.inner.store.save(a_final);

        let b = f
            .orch
            .spawn(SpawnRequest {
                dependencies: vec![a.id.clone()],
                include_dependency_logs: true,
                dependency_log_lines: 2,
                ..spawn_req("use dep output")
            })
            .await
            .unwrap();

        assert!(b.prompt.contains("===LAST TASK RESULTS==="));
        assert!(b.prompt.contains(&format!("--- Task: {} ---", a.id)));
        assert!(b.prompt.contains("line3"));
    }
}
