//! The MCP tool server: JSON-RPC dispatch shared by both transports, plus
//! the session registry used by the streamable HTTP transport.

pub mod http;
pub mod rpc;
pub mod stdio;
mod tools;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mesnada_core::config::Config;
use mesnada_core::orchestrator::Orchestrator;

use self::rpc::{
    JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, MCP_PROTOCOL_VERSION, METHOD_NOT_FOUND,
};

const SESSION_EVENT_CAPACITY: usize = 100;

/// Shared server handle; cheap to clone into every transport.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    orchestrator: Orchestrator,
    config: Config,
    version: String,
    sessions: RwLock<HashMap<String, Session>>,
}

/// One MCP session. The event channel feeds the session's SSE stream.
struct Session {
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    events_tx: mpsc::Sender<Value>,
    events_rx: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl McpServer {
    pub fn new(orchestrator: Orchestrator, config: Config, version: impl Into<String>) -> Self {
        McpServer {
            inner: Arc::new(ServerInner {
                orchestrator,
                config,
                version: version.into(),
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Handles one JSON-RPC request; both transports funnel through here.
    pub async fn dispatch(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        match req.method.as_str() {
            "initialize" => JsonRpcResponse::result(
                req.id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "mesnada",
                        "version": self.inner.version.clone(),
                    },
                    "capabilities": {
                        "tools": {}
                    },
                }),
            ),
            "initialized" | "ping" => JsonRpcResponse::result(req.id, json!({})),
            "tools/list" => {
                JsonRpcResponse::result(req.id, json!({ "tools": self.tool_definitions() }))
            }
            "tools/call" => self.handle_tools_call(req).await,
            _ => JsonRpcResponse::error(req.id, METHOD_NOT_FOUND, "Method not found", None),
        }
    }

    async fn handle_tools_call(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        #[derive(serde::Deserialize)]
        struct CallParams {
            name: String,
            #[serde(default)]
            arguments: Value,
        }

        let params: CallParams = match serde_json::from_value(req.params.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(
                    req.id,
                    INVALID_PARAMS,
                    "Invalid params",
                    Some(json!(e.to_string())),
                )
            }
        };

        let outcome = match self.call_tool(&params.name, params.arguments).await {
            Some(outcome) => outcome,
            None => {
                return JsonRpcResponse::error(
                    req.id,
                    INVALID_PARAMS,
                    format!("Unknown tool: {}", params.name),
                    None,
                )
            }
        };

        // Tool failures travel inside the envelope, not as JSON-RPC errors,
        // so tools-aware clients see structured failures.
        let envelope = match outcome {
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value)
                    .unwrap_or_else(|_| value.to_string());
                json!({
                    "content": [{"type": "text", "text": text}],
                })
            }
            Err(message) => json!({
                "content": [{"type": "text", "text": format!("Error: {message}")}],
                "isError": true,
            }),
        };

        JsonRpcResponse::result(req.id, envelope)
    }

    /// Returns the session id, creating the session on first contact.
    pub fn ensure_session(&self, session_id: Option<String>) -> String {
        let session_id = session_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut sessions = self.inner.sessions.write().unwrap();
        sessions.entry(session_id.clone()).or_insert_with(|| {
            let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
            Session {
                created_at: Utc::now(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }
        });
        session_id
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.inner.sessions.read().unwrap().contains_key(session_id)
    }

    /// Detaches the session's event receiver for an SSE stream. `None`
    /// when the session is unknown or a stream is already attached.
    pub(crate) fn take_session_events(&self, session_id: &str) -> Option<mpsc::Receiver<Value>> {
        let sessions = self.inner.sessions.read().unwrap();
        let session = sessions.get(session_id)?;
        let events_rx = session.events_rx.lock().unwrap().take();
        events_rx
    }

    /// Queues a server-to-client notification for the session's SSE
    /// stream. Fails when the session is unknown or its buffer is full.
    pub fn send_event(&self, session_id: &str, event: Value) -> Result<(), SendEventError> {
        let sessions = self.inner.sessions.read().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SendEventError::SessionNotFound(session_id.to_string()))?;
        session
            .events_tx
            .try_send(event)
            .map_err(|_| SendEventError::ChannelFull)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendEventError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("event channel full")]
    ChannelFull,
}
