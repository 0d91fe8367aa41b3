//! Domain types shared across the store, the orchestrator and the backend
//! adapters.

mod duration;
mod task;

pub use duration::{Duration, ParseDurationError};
pub use task::{
    Engine, InvalidEngine, ListRequest, ResumeOptions, SpawnRequest, Stats, Task, TaskProgress,
    TaskProgressInfo, TaskStatus, TaskSummary,
};
