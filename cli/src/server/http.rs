//! Streamable HTTP transport: `POST /mcp` for JSON-RPC calls,
//! `GET /mcp/sse` for server-to-client notifications, `GET /health` for
//! aggregate stats. CORS is permissive: this is a local-network tool.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::signal;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::rpc::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use super::McpServer;

const SESSION_HEADER: &str = "mcp-session-id";

pub fn router(server: McpServer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/mcp/sse", get(handle_sse))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(server)
}

/// Binds and serves until ctrl-c or SIGTERM.
pub async fn serve(server: McpServer, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(server);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("MCP server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

async fn handle_mcp(
    State(server): State<McpServer>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    // First contact creates the session; the id is echoed back either way.
    let requested = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let session_id = server.ensure_session(requested);

    let response = match serde_json::from_str::<JsonRpcRequest>(&body) {
        Ok(req) => server.dispatch(req).await,
        Err(e) => JsonRpcResponse::error(
            None,
            PARSE_ERROR,
            "Parse error",
            Some(json!(e.to_string())),
        ),
    };

    ([(SESSION_HEADER, session_id)], Json(response))
}

async fn handle_sse(
    State(server): State<McpServer>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or((StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header"))?;

    if !server.session_exists(&session_id) {
        return Err((StatusCode::NOT_FOUND, "Session not found"));
    }
    let rx = server
        .take_session_events(&session_id)
        .ok_or((StatusCode::CONFLICT, "Session stream already attached"))?;

    let connected = stream::once(async move {
        Ok::<Event, Infallible>(
            Event::default()
                .event("connected")
                .data(json!({"sessionId": session_id}).to_string()),
        )
    });
    let events = ReceiverStream::new(rx).map(|value: Value| {
        Ok::<Event, Infallible>(Event::default().event("message").data(value.to_string()))
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(KeepAlive::default()))
}

async fn handle_health(State(server): State<McpServer>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "stats": server.orchestrator().stats(),
    }))
}
