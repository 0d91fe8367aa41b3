//! Stdio transport: newline-delimited JSON-RPC frames on stdin, responses
//! on stdout. No session concept. Logs stay on stderr so the frame stream
//! is never polluted.

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::rpc::{JsonRpcRequest, JsonRpcResponse, PARSE_ERROR};
use super::McpServer;

/// Reads frames from stdin until EOF.
pub async fn run(server: McpServer) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_frames(server, stdin, stdout).await
}

async fn run_frames<R, W>(server: McpServer, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => server.dispatch(req).await,
            Err(e) => JsonRpcResponse::error(
                None,
                PARSE_ERROR,
                "Parse error",
                Some(json!(e.to_string())),
            ),
        };

        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}
