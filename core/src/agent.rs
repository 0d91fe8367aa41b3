//! Seam between the scheduler and the concrete backend adapters.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::models::Task;

/// Finished task records flow back to the orchestrator over this channel.
/// The adapter writes every final field (status, exit code, output tail,
/// timestamps) into the record before sending.
pub type CompletionTx = mpsc::UnboundedSender<Task>;
pub type CompletionRx = mpsc::UnboundedReceiver<Task>;

/// A backend adapter capable of running agent tasks as child processes.
///
/// Implementations own the child handle and its pipes until reap. `spawn`
/// mutates the task in place: it rewrites the prompt with the
/// self-identification preface and records `log_file`, `pid`, `started_at`
/// and the transition to `running`.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, task: &mut Task) -> Result<(), AgentError>;

    /// Stops a running agent, preserving `cancelled` as the final status.
    /// The status marker is recorded before the process is signalled so the
    /// reaper, when it wakes, sees the explicit-stop condition.
    async fn cancel(&self, task_id: &str) -> Result<(), AgentError>;

    /// Stops a running agent, preserving `paused` as the final status.
    async fn pause(&self, task_id: &str) -> Result<(), AgentError>;

    /// Resolves once the task's child has been reaped. Returns immediately
    /// for ids with no live process.
    async fn wait(&self, task_id: &str);

    fn is_running(&self, task_id: &str) -> bool;

    fn running_count(&self) -> usize;

    /// Signals every live child and waits (bounded) for them to die.
    async fn shutdown(&self);
}
