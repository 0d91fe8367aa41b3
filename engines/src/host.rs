//! Shared process host behind every engine adapter.
//!
//! Owns the live-process registry for one engine: spawns the child with
//! the task's working directory and environment, pumps stdout/stderr into
//! the per-task log file and a bounded in-memory capture, enforces the
//! optional timeout, and reaps the child with explicit-stop preservation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use mesnada_core::agent::CompletionTx;
use mesnada_core::error::AgentError;
use mesnada_core::models::{Task, TaskStatus};
use mesnada_core::util::{tail_lines, OutputCapture};

use crate::mcp;
use crate::profile::{EngineProfile, PromptDelivery};
use crate::pump::{pump, LineStream, LineTap};

const OUTPUT_TAIL_LINES: usize = 50;
const MAX_OUTPUT_CAPTURE: usize = 1024 * 1024;
const STOP_GRACE: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[cfg(unix)]
const SIG_TERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIG_TERM: i32 = 15;
#[cfg(unix)]
const SIG_KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIG_KILL: i32 = 9;

/// One engine's spawner: builds the invocation from the profile and runs
/// it through the shared host machinery.
pub struct CliSpawner {
    profile: EngineProfile,
    log_dir: PathBuf,
    registry: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    completions: CompletionTx,
}

struct ProcessEntry {
    pid: Option<u32>,
    /// Explicit-stop marker. Written before the child is signalled so the
    /// reaper sees the requested final status when it wakes.
    stop: Arc<Mutex<Option<TaskStatus>>>,
    done_rx: watch::Receiver<bool>,
}

struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin_payload: Option<String>,
}

impl CliSpawner {
    pub fn new(profile: EngineProfile, log_dir: PathBuf, completions: CompletionTx) -> CliSpawner {
        CliSpawner {
            profile,
            log_dir,
            registry: Arc::new(RwLock::new(HashMap::new())),
            completions,
        }
    }

    pub async fn spawn(&self, task: &mut Task) -> Result<(), AgentError> {
        // Translate the MCP reference into the engine's sidecar dialect.
        // Failure is a warning: the child proceeds without it.
        let sidecar = match (self.profile.sidecar_format(), task.mcp_config.is_empty()) {
            (Some(format), false) => {
                match mcp::convert_for_task(
                    format,
                    &task.mcp_config,
                    &task.id,
                    &self.log_dir,
                    &task.work_dir,
                ) {
                    Ok(paths) => {
                        info!(task_id = %task.id, path = %paths.config_path.display(), "MCP config converted");
                        Some(paths)
                    }
                    Err(e) => {
                        warn!(
                            task_id = %task.id,
                            mcp_config = %task.mcp_config,
                            work_dir = %task.work_dir,
                            error = %e,
                            "failed to convert MCP config, continuing without it"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        // Later observers see exactly what the child saw.
        let prompt = format!("You are the task_id: {}\n\n{}", task.id, task.prompt);
        task.prompt = prompt.clone();

        let sidecar_path = sidecar
            .as_ref()
            .map(|s| s.config_path.to_string_lossy().into_owned());
        let args = self
            .profile
            .build_args(task, &prompt, sidecar_path.as_deref());

        let invocation = Invocation {
            program: self.profile.program().to_string(),
            args,
            env: self
                .profile
                .extra_env()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            stdin_payload: (self.profile.prompt_delivery() == PromptDelivery::Stdin)
                .then_some(prompt),
        };

        self.launch(task, invocation, sidecar.map(|s| s.temp_dir))
            .await
    }

    async fn launch(
        &self,
        task: &mut Task,
        invocation: Invocation,
        temp_dir: Option<PathBuf>,
    ) -> Result<(), AgentError> {
        let log_path = self.log_dir.join(format!("{}.log", task.id));
        let log_file = tokio::fs::File::create(&log_path).await.map_err(|e| {
            cleanup_temp_dir(&temp_dir);
            AgentError::LogFile(e)
        })?;
        task.log_file = log_path.to_string_lossy().into_owned();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&task.work_dir)
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &invocation.env {
            cmd.env(k, v);
        }
        if invocation.stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| {
            cleanup_temp_dir(&temp_dir);
            AgentError::Spawn {
                program: invocation.program.clone(),
                source: e,
            }
        })?;

        if let Some(payload) = invocation.stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(payload.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        task.pid = child.id();
        task.started_at = Some(Utc::now());
        task.status = TaskStatus::Running;

        info!(
            task_event = "started",
            task_id = %task.id,
            status = %task.status,
            engine = %self.profile.engine(),
            pid = ?task.pid,
            log_file = %task.log_file,
            work_dir = %task.work_dir,
            model = %task.model,
        );

        let (line_tx, line_rx) = mpsc::channel::<LineTap>(256);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        if let Some(stdout) = stdout {
            pump(stdout, LineStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = stderr {
            pump(stderr, LineStream::Stderr, line_tx);
        }

        let stop = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = watch::channel(false);
        self.registry.write().unwrap().insert(
            task.id.clone(),
            ProcessEntry {
                pid: task.pid,
                stop: stop.clone(),
                done_rx,
            },
        );

        let timeout = (!task.timeout.is_zero()).then(|| task.timeout.as_std());
        tokio::spawn(monitor(MonitorArgs {
            child,
            line_rx,
            log_file,
            task: task.clone(),
            stop,
            done_tx,
            registry: self.registry.clone(),
            completions: self.completions.clone(),
            temp_dir,
            timeout,
        }));

        Ok(())
    }

    /// Stops the child, recording `status` as the final state. The marker
    /// is set before the SIGTERM so the reaper preserves it over whatever
    /// exit code the dying child reports.
    pub async fn stop_with(&self, task_id: &str, status: TaskStatus) -> Result<(), AgentError> {
        let (stop, mut done_rx, pid) = {
            let reg = self.registry.read().unwrap();
            let entry = reg
                .get(task_id)
                .ok_or_else(|| AgentError::ProcessNotFound(task_id.to_string()))?;
            (entry.stop.clone(), entry.done_rx.clone(), entry.pid)
        };

        *stop.lock().unwrap() = Some(status);
        signal_pid(pid, SIG_TERM);

        if tokio::time::timeout(STOP_GRACE, wait_done(&mut done_rx))
            .await
            .is_err()
        {
            signal_pid(pid, SIG_KILL);
        }
        Ok(())
    }

    /// Resolves once the task's child has been reaped; returns immediately
    /// for ids with no live process.
    pub async fn wait(&self, task_id: &str) {
        let done_rx = self
            .registry
            .read()
            .unwrap()
            .get(task_id)
            .map(|e| e.done_rx.clone());
        if let Some(mut done_rx) = done_rx {
            wait_done(&mut done_rx).await;
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.registry.read().unwrap().contains_key(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.registry.read().unwrap().len()
    }

    /// SIGTERMs every child, then SIGKILLs whatever survives the grace
    /// period.
    pub async fn shutdown(&self) {
        let entries: Vec<(Option<u32>, watch::Receiver<bool>)> = self
            .registry
            .read()
            .unwrap()
            .values()
            .map(|e| (e.pid, e.done_rx.clone()))
            .collect();

        for (pid, _) in &entries {
            signal_pid(*pid, SIG_TERM);
        }
        for (pid, mut done_rx) in entries {
            if tokio::time::timeout(SHUTDOWN_GRACE, wait_done(&mut done_rx))
                .await
                .is_err()
            {
                signal_pid(pid, SIG_KILL);
            }
        }
    }
}

struct MonitorArgs {
    child: Child,
    line_rx: mpsc::Receiver<LineTap>,
    log_file: tokio::fs::File,
    task: Task,
    stop: Arc<Mutex<Option<TaskStatus>>>,
    done_tx: watch::Sender<bool>,
    registry: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    completions: CompletionTx,
    temp_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

/// Reaper: drains output lines into the log and capture while awaiting
/// child exit, then finalizes the task record and fans the completion out.
async fn monitor(args: MonitorArgs) {
    let MonitorArgs {
        mut child,
        mut line_rx,
        mut log_file,
        mut task,
        stop,
        done_tx,
        registry,
        completions,
        temp_dir,
        timeout,
    } = args;

    let capture = OutputCapture::new(MAX_OUTPUT_CAPTURE);
    let mut exit: Option<std::io::Result<std::process::ExitStatus>> = None;
    let mut lines_open = true;
    let mut timed_out = false;

    let timeout_fut = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_fut);

    let exit = loop {
        tokio::select! {
            res = child.wait(), if exit.is_none() => {
                exit = Some(res);
            }
            _ = &mut timeout_fut, if exit.is_none() && !timed_out => {
                timed_out = true;
                warn!(task_id = %task.id, timeout = ?timeout, "task timed out, terminating child");
                if let Some(res) = terminate_child(&mut child).await {
                    exit = Some(res);
                }
            }
            tap = line_rx.recv(), if lines_open => {
                match tap {
                    Some(tap) => {
                        let prefix = match tap.stream {
                            LineStream::Stdout => "",
                            LineStream::Stderr => "[stderr] ",
                        };
                        let rendered = format!("{prefix}{}\n", tap.line);
                        if let Err(e) = log_file.write_all(rendered.as_bytes()).await {
                            warn!(task_id = %task.id, error = %e, "log write failed");
                        }
                        capture.push_line(&format!("{prefix}{}", tap.line));
                    }
                    None => lines_open = false,
                }
            }
        }
        if !lines_open {
            if let Some(res) = exit.take() {
                break res;
            }
        }
    };

    let _ = log_file.flush().await;
    drop(log_file);

    let output = capture.snapshot();
    task.completed_at = Some(Utc::now());
    task.output_tail = tail_lines(&output, OUTPUT_TAIL_LINES);
    task.output = output;

    let explicit_stop = *stop.lock().unwrap();
    match exit {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            task.exit_code = Some(code);
            if let Some(stop_status) = explicit_stop {
                // Cancelled/paused win over whatever the dying child
                // reported; only the exit code is still recorded.
                task.status = stop_status;
            } else if timed_out {
                task.status = TaskStatus::Failed;
                task.error = "task timed out".to_string();
            } else if code == 0 {
                task.status = TaskStatus::Completed;
            } else {
                task.status = TaskStatus::Failed;
                task.error = format!("exit status {code}");
            }
        }
        Err(e) => {
            if let Some(stop_status) = explicit_stop {
                task.status = stop_status;
            } else {
                task.status = TaskStatus::Failed;
                task.error = format!("wait failed: {e}");
            }
        }
    }

    registry.write().unwrap().remove(&task.id);
    let _ = completions.send(task);
    let _ = done_tx.send(true);

    cleanup_temp_dir(&temp_dir);
}

/// SIGTERM, wait out the grace period, then SIGKILL. Returns the exit
/// status when the child died within the grace period.
async fn terminate_child(child: &mut Child) -> Option<std::io::Result<std::process::ExitStatus>> {
    signal_pid(child.id(), SIG_TERM);
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(res) => Some(res),
        Err(_) => {
            let _ = child.kill().await;
            None
        }
    }
}

async fn wait_done(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(unix)]
fn signal_pid(pid: Option<u32>, sig: i32) {
    if let Some(pid) = pid {
        let ret = unsafe { libc::kill(pid as i32, sig) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, sig, error = %err, "failed to signal child");
        }
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: Option<u32>, _sig: i32) {}

fn cleanup_temp_dir(temp_dir: &Option<PathBuf>) {
    if let Some(dir) = temp_dir {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mesnada_core::models::Engine;
    use tokio::sync::mpsc::unbounded_channel;

    fn make_task(id: &str, timeout: &str) -> Task {
        Task {
            id: id.to_string(),
            prompt: "test".into(),
            work_dir: "/tmp".into(),
            status: TaskStatus::Pending,
            engine: Engine::Copilot,
            pid: None,
            output: String::new(),
            output_tail: String::new(),
            error: String::new(),
            exit_code: None,
            model: String::new(),
            log_file: String::new(),
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
            priority: 0,
            timeout: if timeout.is_empty() {
                Default::default()
            } else {
                timeout.parse().unwrap()
            },
            mcp_config: String::new(),
            extra_args: Vec::new(),
        }
    }

    fn sh(script: &str) -> Invocation {
        Invocation {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            stdin_payload: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_completes_on_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-ok", "");
        spawner
            .launch(&mut task, sh("echo hello; echo oops 1>&2"), None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.pid.is_some());
        assert!(spawner.is_running("task-host-ok"));

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.output.contains("hello"));
        assert!(done.output.contains("[stderr] oops"));
        assert!(done.completed_at.is_some());
        assert!(!spawner.is_running("task-host-ok"));

        let log = std::fs::read_to_string(&done.log_file).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("[stderr] oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-fail", "");
        spawner.launch(&mut task, sh("exit 3"), None).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.exit_code, Some(3));
        assert!(done.error.contains("exit status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_payload_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-stdin", "");
        let invocation = Invocation {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "cat".into()],
            env: Vec::new(),
            stdin_payload: Some("from stdin".into()),
        };
        spawner.launch(&mut task, invocation, None).await.unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.output.contains("from stdin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_preserves_status_and_records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-cancel", "");
        spawner
            .launch(&mut task, sh("sleep 30"), None)
            .await
            .unwrap();

        spawner
            .stop_with("task-host-cancel", TaskStatus::Cancelled)
            .await
            .unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        // SIGTERM death reports no code; the recorded value is still set.
        assert!(done.exit_code.is_some());
        assert!(!spawner.is_running("task-host-cancel"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_of_unknown_task_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);
        let err = spawner
            .stop_with("task-ghost", TaskStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ProcessNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-timeout", "200ms");
        spawner
            .launch(&mut task, sh("sleep 30"), None)
            .await
            .unwrap();

        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error, "task timed out");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = unbounded_channel();
        let spawner = CliSpawner::new(EngineProfile::Copilot, dir.path().to_path_buf(), tx);

        let mut task = make_task("task-host-missing", "");
        let invocation = Invocation {
            program: "/definitely/not/a/binary".into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin_payload: None,
        };
        let err = spawner.launch(&mut task, invocation, None).await.unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
        assert!(!spawner.is_running("task-host-missing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn adapter_wait_resolves_after_reap() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let spawner = Arc::new(CliSpawner::new(
            EngineProfile::Copilot,
            dir.path().to_path_buf(),
            tx,
        ));

        let mut task = make_task("task-host-wait", "");
        spawner
            .launch(&mut task, sh("sleep 0.1"), None)
            .await
            .unwrap();

        let waiter = {
            let spawner = spawner.clone();
            tokio::spawn(async move { spawner.wait("task-host-wait").await })
        };
        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();

        // Unknown ids resolve immediately.
        spawner.wait("task-ghost").await;
    }
}
