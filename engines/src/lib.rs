//! Backend adapters: one spawner per external CLI engine, a shared process
//! host, MCP sidecar translation and the multi-engine supervisor.

mod host;
pub mod manager;
pub mod mcp;
pub mod profile;
mod pump;

pub use host::CliSpawner;
pub use manager::EngineManager;
pub use profile::EngineProfile;
