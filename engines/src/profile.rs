//! Per-engine invocation vocabularies.
//!
//! Each external CLI has its own flag set, prompt delivery convention and
//! MCP configuration format; the profile hides all of it behind one fixed
//! operation set so the host machinery stays engine-agnostic.

use mesnada_core::models::{Engine, Task};

use crate::mcp::SidecarFormat;

/// How the prompt reaches the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    /// Written to the child's stdin, which is then closed.
    Stdin,
    /// Passed as the final positional argument.
    Argv,
}

/// Tagged union over the supported engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProfile {
    Copilot,
    Claude,
    Gemini,
    OpenCode,
}

impl EngineProfile {
    pub fn for_engine(engine: Engine) -> EngineProfile {
        match engine {
            Engine::Copilot => EngineProfile::Copilot,
            Engine::Claude => EngineProfile::Claude,
            Engine::Gemini => EngineProfile::Gemini,
            Engine::Opencode => EngineProfile::OpenCode,
        }
    }

    pub fn engine(&self) -> Engine {
        match self {
            EngineProfile::Copilot => Engine::Copilot,
            EngineProfile::Claude => Engine::Claude,
            EngineProfile::Gemini => Engine::Gemini,
            EngineProfile::OpenCode => Engine::Opencode,
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            EngineProfile::Copilot => "copilot",
            EngineProfile::Claude => "claude",
            EngineProfile::Gemini => "gemini",
            EngineProfile::OpenCode => "opencode",
        }
    }

    pub fn prompt_delivery(&self) -> PromptDelivery {
        match self {
            EngineProfile::Copilot => PromptDelivery::Stdin,
            _ => PromptDelivery::Argv,
        }
    }

    /// Engine-specific environment on top of `NO_COLOR=1`.
    pub fn extra_env(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EngineProfile::Copilot => &[("COPILOT_ALLOW_ALL", "1")],
            _ => &[],
        }
    }

    /// Which sidecar format the opaque MCP config is translated into.
    /// Copilot takes the reference verbatim via a flag, so no sidecar.
    pub fn sidecar_format(&self) -> Option<SidecarFormat> {
        match self {
            EngineProfile::Copilot => None,
            EngineProfile::Claude => Some(SidecarFormat::Claude),
            EngineProfile::Gemini => Some(SidecarFormat::Gemini),
            EngineProfile::OpenCode => Some(SidecarFormat::OpenCode),
        }
    }

    /// Assembles the engine's command line. `prompt` already carries the
    /// task-id preface; `sidecar` is the translated MCP config path, when
    /// one was produced.
    pub fn build_args(&self, task: &Task, prompt: &str, sidecar: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        match self {
            EngineProfile::Copilot => {
                args.extend(
                    ["--allow-all-tools", "--no-color", "--no-custom-instructions"]
                        .map(String::from),
                );
                if !task.model.is_empty() {
                    args.push("--model".into());
                    args.push(task.model.clone());
                }
                if !task.mcp_config.is_empty() {
                    args.push("--additional-mcp-config".into());
                    args.push(task.mcp_config.clone());
                }
                args.extend(task.extra_args.iter().cloned());
                // Prompt goes to stdin.
            }
            EngineProfile::Claude => {
                args.extend(
                    [
                        "-p",
                        "--output-format",
                        "text",
                        "--dangerously-skip-permissions",
                        "--verbose",
                    ]
                    .map(String::from),
                );
                if !task.model.is_empty() {
                    args.push("--model".into());
                    args.push(task.model.clone());
                }
                args.extend(task.extra_args.iter().cloned());
                // The prompt must precede --mcp-config; the CLI otherwise
                // concatenates the two values into one path.
                args.push(prompt.to_string());
                if let Some(sidecar) = sidecar {
                    args.push("--mcp-config".into());
                    args.push(sidecar.to_string());
                }
            }
            EngineProfile::Gemini => {
                args.push("-p".into());
                if !task.model.is_empty() {
                    args.push("--model".into());
                    args.push(task.model.clone());
                }
                if let Some(sidecar) = sidecar {
                    args.push("--mcp-config".into());
                    args.push(sidecar.to_string());
                }
                args.extend(task.extra_args.iter().cloned());
                args.push(prompt.to_string());
            }
            EngineProfile::OpenCode => {
                args.push("run".into());
                if !task.model.is_empty() {
                    args.push("-m".into());
                    args.push(task.model.clone());
                }
                args.extend(task.extra_args.iter().cloned());
                // opencode has no MCP flag; the sidecar (if any) is only
                // written for operators to wire up via `opencode mcp`.
                args.push(prompt.to_string());
            }
        }
        args
    }
}
