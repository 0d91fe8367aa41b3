//! Application configuration: YAML or JSON, loaded once at process start.
//!
//! Paths beginning with `~` expand to the home directory; relative store
//! and log paths resolve against the configuration file's directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::Engine;

/// A model with its human description, used to build tool schema enums.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Per-engine model allow-list and default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub default_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub default_mcp_config: String,
    #[serde(default)]
    pub default_engine: String,
}

fn mesnada_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".mesnada")
}

fn default_store_path() -> String {
    mesnada_dir().join("tasks.json").to_string_lossy().into_owned()
}

fn default_log_dir() -> String {
    mesnada_dir().join("logs").to_string_lossy().into_owned()
}

fn default_max_parallel() -> usize {
    5
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            store_path: default_store_path(),
            log_dir: default_log_dir(),
            max_parallel: default_max_parallel(),
            default_mcp_config: String::new(),
            default_engine: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter string, e.g. "info" or "mesnada_core=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default)]
    pub file: bool,
    /// Directory for log files when `file` is enabled; OS temp dir if unset.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            console: true,
            file: false,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_default_model")]
    pub default_model: String,
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_default_model() -> String {
    "claude-sonnet-4.5".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_model: default_default_model(),
            models: default_models(),
            engines: HashMap::new(),
            server: ServerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_models() -> Vec<ModelConfig> {
    [
        ("claude-sonnet-4.5", "Balanced performance and speed for general tasks"),
        ("claude-opus-4.5", "Highest capability for complex reasoning and analysis"),
        ("claude-haiku-4.5", "Fast responses for simple tasks and quick iterations"),
        ("gpt-5.1-codex-max", "Advanced coding capabilities with extended context"),
        ("gpt-5.1-codex", "Optimized for code generation and refactoring"),
        ("gpt-5.2", "Latest GPT model with improved reasoning"),
        ("gpt-5.1", "Stable GPT model for production use"),
        ("gpt-5", "Base GPT-5 model"),
        ("gpt-5.1-codex-mini", "Lightweight coding model for quick tasks"),
        ("gpt-5-mini", "Fast and efficient for simple queries"),
        ("gpt-4.1", "Reliable GPT-4 variant"),
        ("gemini-3-pro-preview", "Google's latest multimodal model"),
    ]
    .into_iter()
    .map(|(id, description)| ModelConfig {
        id: id.to_string(),
        description: description.to_string(),
    })
    .collect()
}

impl Config {
    /// Loads configuration from `path`, or from
    /// `~/.mesnada/config.{yaml,json}` when no path is given. A missing
    /// file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let (path, base_dir) = match path {
            Some(p) => (Some(p.to_path_buf()), p.parent().map(Path::to_path_buf)),
            None => match find_default_config() {
                Some(p) => {
                    let base = p.parent().map(Path::to_path_buf);
                    (Some(p), base)
                }
                None => (None, None),
            },
        };

        let mut cfg = Config::default();
        if let Some(path) = path {
            let data = match std::fs::read_to_string(&path) {
                Ok(data) => Some(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(ConfigError::Read(e)),
            };
            if let Some(data) = data {
                cfg = parse_config(&path, &data)?;
            }
        }

        let base_dir = base_dir.as_deref();
        cfg.orchestrator.store_path = resolve_path(&cfg.orchestrator.store_path, base_dir);
        cfg.orchestrator.log_dir = resolve_path(&cfg.orchestrator.log_dir, base_dir);
        cfg.orchestrator.default_mcp_config =
            expand_mcp_config(&cfg.orchestrator.default_mcp_config);
        Ok(cfg)
    }

    /// Writes the configuration as pretty JSON, used by `--init`.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => mesnada_dir().join("config.json"),
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(ConfigError::Write)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(ConfigError::Json)?;
        std::fs::write(&path, data).map_err(ConfigError::Write)?;
        Ok(path)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn default_engine(&self) -> Engine {
        self.orchestrator
            .default_engine
            .parse()
            .unwrap_or_default()
    }

    /// Model ids allowed for `engine`: the engine's own list when
    /// configured, the global list otherwise. An empty result means the
    /// model is unvalidated.
    pub fn model_ids_for_engine(&self, engine: Engine) -> Vec<String> {
        if let Some(engine_cfg) = self.engines.get(engine.as_str()) {
            if !engine_cfg.models.is_empty() {
                return engine_cfg.models.iter().map(|m| m.id.clone()).collect();
            }
        }
        self.models.iter().map(|m| m.id.clone()).collect()
    }

    pub fn validate_model_for_engine(&self, engine: Engine, model: &str) -> bool {
        let allowed = self.model_ids_for_engine(engine);
        allowed.is_empty() || allowed.iter().any(|id| id == model)
    }

    /// Deduplicated union of the global list and every engine list, used
    /// for the tool schema enum.
    pub fn all_model_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for m in &self.models {
            if seen.insert(m.id.clone()) {
                out.push(m.id.clone());
            }
        }
        for engine_cfg in self.engines.values() {
            for m in &engine_cfg.models {
                if seen.insert(m.id.clone()) {
                    out.push(m.id.clone());
                }
            }
        }
        out
    }
}

fn find_default_config() -> Option<PathBuf> {
    let dir = mesnada_dir();
    for name in ["config.yaml", "config.yml", "config.json"] {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn parse_config(path: &Path, data: &str) -> Result<Config, ConfigError> {
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);
    if is_yaml {
        serde_yaml::from_str(data).map_err(ConfigError::Yaml)
    } else {
        serde_json::from_str(data).map_err(ConfigError::Json)
    }
}

/// Expands a leading `~` to the home directory. `~user/...` forms are left
/// alone.
fn expand_home(path: &str) -> String {
    let path = path.trim();
    if path == "~" {
        return dirs::home_dir()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Expands `~` and resolves relative paths against `base_dir` (the config
/// file's directory). With no base dir, relative paths pass through.
fn resolve_path(value: &str, base_dir: Option<&Path>) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    let expanded = expand_home(value);
    let p = Path::new(&expanded);
    if p.is_absolute() {
        return expanded;
    }
    match base_dir {
        Some(base) => base.join(p).to_string_lossy().into_owned(),
        None => expanded,
    }
}

/// MCP config references keep their `@` file prefix while still getting
/// `~` expansion after it.
fn expand_mcp_config(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    match value.strip_prefix('@') {
        Some(rest) => format!("@{}", expand_home(rest)),
        None => expand_home(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8765);
        assert_eq!(cfg.orchestrator.max_parallel, 5);
        assert!(!cfg.models.is_empty());
    }

    #[test]
    fn loads_yaml_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "server:\n  host: 0.0.0.0\n  port: 9000\n",
                "orchestrator:\n  store_path: state/tasks.json\n  log_dir: state/logs\n",
                "  default_engine: claude\n",
            ),
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.default_engine(), Engine::Claude);
        assert_eq!(
            cfg.orchestrator.store_path,
            dir.path().join("state/tasks.json").to_string_lossy()
        );
        assert_eq!(
            cfg.orchestrator.log_dir,
            dir.path().join("state/logs").to_string_lossy()
        );
    }

    #[test]
    fn loads_json_flavour() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"default_model": "m1", "models": [{"id": "m1"}], "server": {"port": 7777}}"#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.default_model, "m1");
        assert_eq!(cfg.server.port, 7777);
        assert_eq!(cfg.server.host, "127.0.0.1");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(Some(&dir.path().join("nope.yaml"))).unwrap();
        assert_eq!(cfg.server.port, 8765);
    }

    #[test]
    fn mcp_config_keeps_at_prefix() {
        assert_eq!(
            expand_mcp_config("@.github/mcp-config.json"),
            "@.github/mcp-config.json"
        );
        let expanded = expand_mcp_config("@~/mcp.json");
        assert!(expanded.starts_with('@'));
        assert!(!expanded.contains('~'));
    }

    #[test]
    fn per_engine_models_shadow_global_list() {
        let mut cfg = Config::default();
        cfg.engines.insert(
            "claude".to_string(),
            EngineConfig {
                models: vec![
                    ModelConfig { id: "c1".into(), description: String::new() },
                    ModelConfig { id: "c2".into(), description: String::new() },
                ],
                default_model: String::new(),
            },
        );

        assert!(cfg.validate_model_for_engine(Engine::Claude, "c1"));
        assert!(!cfg.validate_model_for_engine(Engine::Claude, "gpt-5"));
        // Engines without a dedicated list fall back to the global one.
        assert!(cfg.validate_model_for_engine(Engine::Gemini, "gpt-5"));
        assert_eq!(
            cfg.model_ids_for_engine(Engine::Claude),
            vec!["c1".to_string(), "c2".to_string()]
        );
    }

    #[test]
    fn unconfigured_models_are_unvalidated() {
        let mut cfg = Config::default();
        cfg.models.clear();
        assert!(cfg.validate_model_for_engine(Engine::Copilot, "anything"));
    }

    #[test]
    fn all_model_ids_deduplicates() {
        let mut cfg = Config::default();
        cfg.models = vec![ModelConfig { id: "m1".into(), description: String::new() }];
        cfg.engines.insert(
            "claude".into(),
            EngineConfig {
                models: vec![
                    ModelConfig { id: "m1".into(), description: String::new() },
                    ModelConfig { id: "m2".into(), description: String::new() },
                ],
                default_model: String::new(),
            },
        );
        assert_eq!(cfg.all_model_ids(), vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = Config::default();
        cfg.save(Some(&path)).unwrap();
        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.server.port, cfg.server.port);
        assert_eq!(loaded.default_model, cfg.default_model);
    }
}
