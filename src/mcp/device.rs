//! Device-hosted MCP client: tools that live on the connected device,
//! reached through the session's own text channel.
//!
//! Requests ride inside `{type:"mcp", payload:{...}}` frames. Ids 1 and 2
//! are reserved for initialize and tools/list; tool calls take 3 and up.
//! Responses correlate by id against a pending map; each caller blocks on a
//! oneshot with a 30 s deadline. The connection reference is weak so a torn
//! down session cannot keep the socket alive through this client.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use super::protocol::{
    call_tool_params, initialize_params, list_tools_params, CallToolResult, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, McpToolInfo,
};
use crate::connection::Connection;
use crate::protocol::OutboundMessage;
use crate::tools::{ActionResponse, ToolExecutor};

pub const ID_INITIALIZE: u64 = 1;
pub const ID_TOOLS_LIST: u64 = 2;
pub const FIRST_TOOL_CALL_ID: u64 = 3;

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

type PendingReply = oneshot::Sender<Result<Value, String>>;

pub struct DeviceMcpClient {
    session_id: StdMutex<String>,
    conn: StdMutex<Weak<Connection>>,
    pending: StdMutex<HashMap<u64, PendingReply>>,
    next_call_id: AtomicU64,
}

impl Default for DeviceMcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMcpClient {
    pub fn new() -> Self {
        Self {
            session_id: StdMutex::new(String::new()),
            conn: StdMutex::new(Weak::new()),
            pending: StdMutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(FIRST_TOOL_CALL_ID),
        }
    }

    /// Attach to a live session. The connection is held weakly.
    pub fn bind(&self, conn: &Arc<Connection>, session_id: &str) {
        *self.conn.lock().expect("conn lock poisoned") = Arc::downgrade(conn);
        *self.session_id.lock().expect("session lock poisoned") = session_id.to_string();
        self.next_call_id.store(FIRST_TOOL_CALL_ID, Ordering::Release);
    }

    /// Detach from the session; every waiting caller fails immediately.
    pub fn unbind(&self) {
        *self.conn.lock().expect("conn lock poisoned") = Weak::new();
        self.session_id.lock().expect("session lock poisoned").clear();
        let pending: Vec<PendingReply> = {
            let mut map = self.pending.lock().expect("pending lock poisoned");
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err("session closed".to_string()));
        }
    }

    /// Route an inbound `mcp` payload to the caller waiting on its id.
    pub fn handle_payload(&self, payload: Value) {
        let response: JsonRpcResponse = match serde_json::from_value(payload.clone()) {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable device mcp payload");
                return;
            }
        };
        let Some(id) = response.id.as_ref().and_then(|v| v.as_u64()) else {
            // Device-initiated requests and notifications are not part of
            // the server-side protocol; log and move on.
            tracing::debug!("device mcp payload without response id ignored");
            return;
        };
        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        let Some(waiter) = waiter else {
            tracing::debug!(id, "device mcp response with no pending caller");
            return;
        };
        let outcome = if let Some(err) = response.error {
            Err(err.to_string())
        } else {
            Ok(response.result.unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
    }

    async fn send_request(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value> {
        let conn = self
            .conn
            .lock()
            .expect("conn lock poisoned")
            .upgrade()
            .ok_or_else(|| anyhow!("device mcp client not bound to a connection"))?;
        let session_id = self.session_id.lock().expect("session lock poisoned").clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let envelope = OutboundMessage::mcp(&session_id, serde_json::to_value(&request)?);
        if let Err(e) = conn.write_text(envelope.to_text()).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(e.context("failed to send device mcp request"));
        }

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => bail!("device mcp {method} failed: {e}"),
            Ok(Err(_)) => bail!("device mcp reply channel dropped"),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&id);
                bail!("device mcp {method} timed out")
            }
        }
    }

    pub async fn initialize(&self) -> Result<Value> {
        self.send_request(
            ID_INITIALIZE,
            "initialize",
            Some(initialize_params(crate::NAME, crate::VERSION)),
        )
        .await
    }

    /// Full device tool listing; each page reuses the reserved list id.
    pub async fn list_all_tools(&self) -> Result<Vec<McpToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let result = self
                .send_request(ID_TOOLS_LIST, "tools/list", list_tools_params(cursor.as_deref()))
                .await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .context("failed to parse device tools/list result")?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let id = self.next_call_id.fetch_add(1, Ordering::AcqRel);
        let result = self
            .send_request(id, "tools/call", Some(call_tool_params(name, arguments)))
            .await?;
        let result: CallToolResult =
            serde_json::from_value(result).context("failed to parse device tools/call result")?;
        if result.is_error.unwrap_or(false) {
            bail!("device tool {name} reported error: {}", result.text());
        }
        Ok(result.text())
    }
}

/// Result shape device tools use for camera/vision style calls.
#[derive(Debug, Deserialize)]
struct VisionResponse {
    success: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Routes registry calls to the device. Vision-style results short-circuit
/// to a direct spoken reply; anything else re-enters the model.
pub struct DeviceToolExecutor {
    client: Arc<DeviceMcpClient>,
}

impl DeviceToolExecutor {
    pub fn new(client: Arc<DeviceMcpClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for DeviceToolExecutor {
    async fn execute(&self, name: &str, args: Value) -> ActionResponse {
        let text = match self.client.call_tool(name, args).await {
            Ok(text) => text,
            Err(e) => return ActionResponse::Error(e.to_string()),
        };
        if let Ok(vision) = serde_json::from_str::<VisionResponse>(&text) {
            return if vision.success {
                ActionResponse::DirectReply(vision.result.unwrap_or_default())
            } else {
                ActionResponse::ReqLlm(format!(
                    "工具调用失败：{}",
                    vision.message.unwrap_or_else(|| "未知错误".to_string())
                ))
            };
        }
        ActionResponse::ReqLlm(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::ChannelTransport;
    use crate::connection::Frame;
    use serde_json::json;

    fn bound_client() -> (
        Arc<DeviceMcpClient>,
        Arc<Connection>,
        tokio::sync::mpsc::UnboundedReceiver<Frame>,
    ) {
        let (transport, _in_tx, out_rx) = ChannelTransport::new();
        let conn = Arc::new(Connection::new(Box::new(transport)));
        let client = Arc::new(DeviceMcpClient::new());
        client.bind(&conn, "s1");
        (client, conn, out_rx)
    }

    #[tokio::test]
    async fn test_initialize_uses_reserved_id() {
        let (client, _conn, mut out_rx) = bound_client();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.initialize().await }
        });

        let frame = out_rx.recv().await.unwrap();
        let Frame::Text(text) = frame else { panic!("expected text frame") };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "mcp");
        assert_eq!(v["payload"]["id"], 1);
        assert_eq!(v["payload"]["method"], "initialize");

        client.handle_payload(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"protocolVersion": "2024-11-05"}
        }));
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
    }

    #[tokio::test]
    async fn test_paginated_tools_list() {
        let (client, _conn, mut out_rx) = bound_client();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.list_all_tools().await }
        });

        // page 1
        let Frame::Text(text) = out_rx.recv().await.unwrap() else { panic!() };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["payload"]["id"], 2);
        client.handle_payload(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {
                "tools": [{"name": "self.camera.take_photo"}],
                "nextCursor": "p2"
            }
        }));

        // page 2 reuses id 2 and carries the cursor
        let Frame::Text(text) = out_rx.recv().await.unwrap() else { panic!() };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["payload"]["id"], 2);
        assert_eq!(v["payload"]["params"]["cursor"], "p2");
        client.handle_payload(json!({
            "jsonrpc": "2.0", "id": 2,
            "result": {"tools": [{"name": "self.screen.snapshot"}]}
        }));

        let tools = call.await.unwrap().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["self.camera.take_photo", "self.screen.snapshot"]);
    }

    #[tokio::test]
    async fn test_tool_calls_use_monotonic_ids() {
        let (client, _conn, mut out_rx) = bound_client();

        for expected_id in [3u64, 4] {
            let call = tokio::spawn({
                let client = client.clone();
                async move { client.call_tool("self.camera.take_photo", json!({})).await }
            });
            let Frame::Text(text) = out_rx.recv().await.unwrap() else { panic!() };
            let v: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(v["payload"]["id"], expected_id);
            client.handle_payload(json!({
                "jsonrpc": "2.0", "id": expected_id,
                "result": {"content": [{"type": "text", "text": "ok"}]}
            }));
            assert_eq!(call.await.unwrap().unwrap(), "ok");
        }
    }

    #[tokio::test]
    async fn test_unbind_fails_pending_calls() {
        let (client, _conn, mut out_rx) = bound_client();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call_tool("self.camera.take_photo", json!({})).await }
        });
        let _ = out_rx.recv().await;
        client.unbind();
        assert!(call.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_vision_response_success_is_direct_reply() {
        let (client, _conn, mut out_rx) = bound_client();
        let executor = DeviceToolExecutor::new(client.clone());
        let call = tokio::spawn(async move {
            executor.execute("self.camera.take_photo", json!({})).await
        });

        let Frame::Text(text) = out_rx.recv().await.unwrap() else { panic!() };
        let v: Value = serde_json::from_str(&text).unwrap();
        let id = v["payload"]["id"].as_u64().unwrap();
        client.handle_payload(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {"content": [{"type": "text",
                "text": "{\"success\":true,\"result\":\"画面里有一只猫\"}"}]}
        }));

        assert_eq!(
            call.await.unwrap(),
            ActionResponse::DirectReply("画面里有一只猫".to_string())
        );
    }

    #[tokio::test]
    async fn test_vision_response_failure_reenters_llm() {
        let (client, _conn, mut out_rx) = bound_client();
        let executor = DeviceToolExecutor::new(client.clone());
        let call = tokio::spawn(async move {
            executor.execute("self.camera.take_photo", json!({})).await
        });

        let Frame::Text(text) = out_rx.recv().await.unwrap() else { panic!() };
        let v: Value = serde_json::from_str(&text).unwrap();
        let id = v["payload"]["id"].as_u64().unwrap();
        client.handle_payload(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {"content": [{"type": "text",
                "text": "{\"success\":false,\"message\":\"摄像头忙\"}"}]}
        }));

        match call.await.unwrap() {
            ActionResponse::ReqLlm(text) => assert!(text.contains("摄像头忙")),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
