//! Stdio subprocess MCP client.
//!
//! The server process is spawned once at startup and shared by every
//! session; calls are serialized inside the client by the inner lock.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::protocol::{
    call_tool_params, initialize_params, list_tools_params, CallToolResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpToolInfo,
};

pub struct StdioMcpClient {
    name: String,
    inner: Mutex<StdioInner>,
}

struct StdioInner {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl StdioMcpClient {
    /// Spawn the server process and run the initialize handshake.
    pub async fn connect(name: &str, command: &str, args: &[String]) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server {name} ({command})"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("no stdin for MCP server {name}"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout for MCP server {name}"))?;

        let client = Self {
            name: name.to_string(),
            inner: Mutex::new(StdioInner {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 0,
            }),
        };

        client
            .request(
                "initialize",
                Some(initialize_params(crate::NAME, crate::VERSION)),
            )
            .await
            .with_context(|| format!("MCP server {name} initialize failed"))?;
        client
            .notify("notifications/initialized", None)
            .await
            .with_context(|| format!("MCP server {name} initialized notification failed"))?;

        tracing::info!(server = name, "mcp stdio client connected");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full tool listing, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = list_tools_params(cursor.as_deref());
            let result = self.request("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(result).context("failed to parse tools/list result")?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a tool and return its text content.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let result = self
            .request("tools/call", Some(call_tool_params(name, arguments)))
            .await?;
        let result: CallToolResult =
            serde_json::from_value(result).context("failed to parse tools/call result")?;
        if result.is_error.unwrap_or(false) {
            bail!("tool {name} reported error: {}", result.text());
        }
        Ok(result.text())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        let request = JsonRpcRequest::new(id, method, params);
        inner.write_line(&serde_json::to_string(&request)?).await?;

        // Skip notifications and unrelated traffic until our id answers
        loop {
            let line = inner.read_line().await?;
            let response: JsonRpcResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(_) => continue,
            };
            match &response.id {
                Some(rid) if rid.as_u64() == Some(id) => {
                    if let Some(err) = response.error {
                        bail!("MCP server {} {method} failed: {err}", self.name);
                    }
                    return response
                        .result
                        .ok_or_else(|| anyhow!("MCP server {} returned no result", self.name));
                }
                _ => continue,
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let mut inner = self.inner.lock().await;
        inner.write_line(&serde_json::to_string(&notification)?).await
    }

    /// Kill the subprocess. Used at process shutdown only.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.child.kill().await;
    }
}

impl StdioInner {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            bail!("MCP server closed its stdout");
        }
        Ok(line)
    }
}
