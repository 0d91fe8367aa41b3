//! MCP sidecar translation.
//!
//! Tasks carry an opaque MCP configuration reference in the orchestrator's
//! own format (a `mcpServers` map of `local`/`http` entries, optionally
//! behind a `@file` prefix). Engines that take a config file expect their
//! own dialect, so the reference is translated into a per-task sidecar
//! file. Translation failure is a warning at the call site, never fatal:
//! the child runs without the sidecar.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarFormat {
    Claude,
    Gemini,
    OpenCode,
}

impl SidecarFormat {
    fn dir_prefix(&self) -> &'static str {
        match self {
            SidecarFormat::Claude => "claude-mcp",
            SidecarFormat::Gemini => "gemini-mcp",
            SidecarFormat::OpenCode => "opencode-mcp",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            SidecarFormat::Claude => "claude-mcp-config.json",
            SidecarFormat::Gemini => "gemini-mcp-config.json",
            SidecarFormat::OpenCode => "opencode.json",
        }
    }
}

/// Where the translated config landed; `temp_dir` is removed when the
/// task's child is reaped.
#[derive(Debug, Clone)]
pub struct SidecarPaths {
    pub config_path: PathBuf,
    pub temp_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to read MCP config: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse MCP config: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("failed to write sidecar config: {0}")]
    Write(#[source] std::io::Error),
}

/// The orchestrator's MCP configuration format.
#[derive(Debug, Deserialize)]
struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Deserialize)]
struct McpServerEntry {
    /// "local" or "http"; unset entries are treated as local.
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Serialize)]
struct ClaudeMcpConfig {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, ClaudeMcpServer>,
}

#[derive(Debug, Default, Serialize)]
struct ClaudeMcpServer {
    #[serde(skip_serializing_if = "String::is_empty")]
    command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    cwd: String,
}

#[derive(Debug, Default, Serialize)]
struct GeminiMcpConfig {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, GeminiMcpServer>,
}

#[derive(Debug, Default, Serialize)]
struct GeminiMcpServer {
    #[serde(skip_serializing_if = "String::is_empty")]
    command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    cwd: String,
    trust: bool,
}

#[derive(Debug, Default, Serialize)]
struct OpenCodeMcpConfig {
    mcp: HashMap<String, OpenCodeMcpServer>,
}

#[derive(Debug, Default, Serialize)]
struct OpenCodeMcpServer {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
    enabled: bool,
}

/// Translates the task's MCP reference into `format` under
/// `<base_dir>/<engine>-mcp/<task_id>/`.
pub fn convert_for_task(
    format: SidecarFormat,
    mcp_config: &str,
    task_id: &str,
    base_dir: &Path,
    work_dir: &str,
) -> Result<SidecarPaths, McpError> {
    let source = resolve_source(mcp_config, work_dir);
    let data = std::fs::read_to_string(&source).map_err(McpError::Read)?;
    let config: McpConfig = serde_json::from_str(&data).map_err(McpError::Parse)?;

    let abs_work_dir = absolutize(work_dir);
    let temp_dir = base_dir.join(format.dir_prefix()).join(task_id);
    std::fs::create_dir_all(&temp_dir).map_err(McpError::Write)?;
    let config_path = temp_dir.join(format.file_name());

    let rendered = match format {
        SidecarFormat::Claude => {
            let out = ClaudeMcpConfig {
                mcp_servers: config
                    .mcp_servers
                    .into_iter()
                    .map(|(name, entry)| (name, to_claude(entry, &abs_work_dir)))
                    .collect(),
            };
            serde_json::to_vec_pretty(&out).map_err(McpError::Parse)?
        }
        SidecarFormat::Gemini => {
            let out = GeminiMcpConfig {
                mcp_servers: config
                    .mcp_servers
                    .into_iter()
                    .map(|(name, entry)| (name, to_gemini(entry, &abs_work_dir)))
                    .collect(),
            };
            serde_json::to_vec_pretty(&out).map_err(McpError::Parse)?
        }
        SidecarFormat::OpenCode => {
            let out = OpenCodeMcpConfig {
                mcp: config
                    .mcp_servers
                    .into_iter()
                    .map(|(name, entry)| (name, to_opencode(entry)))
                    .collect(),
            };
            serde_json::to_vec_pretty(&out).map_err(McpError::Parse)?
        }
    };

    std::fs::write(&config_path, rendered).map_err(McpError::Write)?;
    Ok(SidecarPaths {
        config_path,
        temp_dir,
    })
}

fn to_claude(entry: McpServerEntry, work_dir: &Path) -> ClaudeMcpServer {
    match entry.kind.as_str() {
        // The CLI has no native HTTP MCP transport; bridge through
        // mcp-remote over stdio.
        "http" => ClaudeMcpServer {
            command: "npx".into(),
            args: vec!["-y".into(), "mcp-remote".into(), entry.url],
            cwd: String::new(),
        },
        _ => ClaudeMcpServer {
            command: entry.command,
            args: entry.args,
            cwd: resolve_cwd(&entry.cwd, work_dir),
        },
    }
}

fn to_gemini(entry: McpServerEntry, work_dir: &Path) -> GeminiMcpServer {
    match entry.kind.as_str() {
        "http" => GeminiMcpServer {
            command: "npx".into(),
            args: vec!["-y".into(), "mcp-remote".into(), entry.url],
            cwd: String::new(),
            trust: true,
        },
        _ => GeminiMcpServer {
            command: entry.command,
            args: entry.args,
            cwd: resolve_cwd(&entry.cwd, work_dir),
            trust: true,
        },
    }
}

fn to_opencode(entry: McpServerEntry) -> OpenCodeMcpServer {
    match entry.kind.as_str() {
        "http" => OpenCodeMcpServer {
            kind: "local".into(),
            command: "npx".into(),
            args: vec!["-y".into(), "mcp-remote".into(), entry.url],
            enabled: true,
        },
        _ => OpenCodeMcpServer {
            kind: "local".into(),
            command: entry.command,
            args: entry.args,
            enabled: true,
        },
    }
}

/// Strips the `@` file prefix and resolves a relative reference against
/// the task's working directory.
fn resolve_source(mcp_config: &str, work_dir: &str) -> PathBuf {
    let source = mcp_config.strip_prefix('@').unwrap_or(mcp_config);
    let source = Path::new(source);
    if source.is_absolute() || work_dir.is_empty() {
        return source.to_path_buf();
    }
    absolutize(work_dir).join(source)
}

fn resolve_cwd(cwd: &str, work_dir: &Path) -> String {
    if cwd.is_empty() {
        return String::new();
    }
    let p = Path::new(cwd);
    if p.is_absolute() {
        return cwd.to_string();
    }
    work_dir.join(p).to_string_lossy().into_owned()
}

fn absolutize(dir: &str) -> PathBuf {
    let p = Path::new(dir);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(p))
        .unwrap_or_else(|_| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"{
        "mcpServers": {
            "files": {"type": "local", "command": "mcp-files", "args": ["--root", "."], "cwd": "sub"},
            "remote": {"type": "http", "url": "http://localhost:9999/mcp"}
        }
    }"#;

    fn write_source(dir: &Path) -> PathBuf {
        let path = dir.join("mcp-config.json");
        std::fs::write(&path, SOURCE).unwrap();
        path
    }

    #[test]
    fn converts_to_claude_format() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());

        let paths = convert_for_task(
            SidecarFormat::Claude,
            &format!("@{}", source.display()),
            "task-1",
            dir.path(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        assert!(paths.config_path.ends_with("claude-mcp-config.json"));
        assert!(paths.temp_dir.ends_with("claude-mcp/task-1"));

        let out: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.config_path).unwrap()).unwrap();
        let servers = &out["mcpServers"];
        assert_eq!(servers["files"]["command"], "mcp-files");
        // Relative cwd is resolved against the work dir.
        assert_eq!(
            servers["files"]["cwd"],
            dir.path().join("sub").to_string_lossy().into_owned()
        );
        // HTTP entries become an mcp-remote stdio bridge.
        assert_eq!(servers["remote"]["command"], "npx");
        assert_eq!(servers["remote"]["args"][1], "mcp-remote");
        assert_eq!(servers["remote"]["args"][2], "http://localhost:9999/mcp");
    }

    #[test]
    fn converts_to_gemini_format_with_trust() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());

        let paths = convert_for_task(
            SidecarFormat::Gemini,
            source.to_str().unwrap(),
            "task-2",
            dir.path(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        let out: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.config_path).unwrap()).unwrap();
        assert_eq!(out["mcpServers"]["files"]["trust"], true);
        assert_eq!(out["mcpServers"]["remote"]["command"], "npx");
    }

    #[test]
    fn converts_to_opencode_format() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());

        let paths = convert_for_task(
            SidecarFormat::OpenCode,
            source.to_str().unwrap(),
            "task-3",
            dir.path(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        assert!(paths.config_path.ends_with("opencode.json"));
        let out: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.config_path).unwrap()).unwrap();
        assert_eq!(out["mcp"]["files"]["type"], "local");
        assert_eq!(out["mcp"]["files"]["enabled"], true);
        assert_eq!(out["mcp"]["remote"]["command"], "npx");
    }

    #[test]
    fn relative_source_resolves_against_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_source(dir.path());

        let paths = convert_for_task(
            SidecarFormat::Claude,
            "@mcp-config.json",
            "task-4",
            dir.path(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();
        assert!(paths.config_path.exists());
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_for_task(
            SidecarFormat::Claude,
            "@/does/not/exist.json",
            "task-5",
            dir.path(),
            "/tmp",
        )
        .unwrap_err();
        assert!(matches!(err, McpError::Read(_)));
    }
}
