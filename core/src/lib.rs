//! Core domain for the mesnada orchestrator: task model, persistent store,
//! supervisor trait and the dependency-aware scheduler.

pub mod agent;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod util;

pub use agent::{CompletionRx, CompletionTx, Spawner};
pub use error::{AgentError, ConfigError, OrchestratorError, StoreError};
pub use models::{Engine, Task, TaskProgress, TaskStatus};
pub use orchestrator::Orchestrator;
pub use store::FileStore;
