//! MCP manager: one per provider set.
//!
//! The expensive part - the stdio subprocess clients - is started once at
//! pool init and shared. Binding a manager to a session only wires the
//! device client to the live connection and fills the session's tool
//! registry; returning it undoes exactly that.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::device::{DeviceMcpClient, DeviceToolExecutor};
use super::stdio::StdioMcpClient;
use crate::connection::Connection;
use crate::tools::{ActionResponse, ToolDescriptor, ToolExecutor, ToolOwner, ToolRegistry};

/// Routes registry calls for tools owned by one stdio server.
struct StdioToolExecutor {
    client: Arc<StdioMcpClient>,
}

#[async_trait]
impl ToolExecutor for StdioToolExecutor {
    async fn execute(&self, name: &str, args: Value) -> ActionResponse {
        match self.client.call_tool(name, args).await {
            Ok(text) => ActionResponse::ReqLlm(text),
            Err(e) => ActionResponse::Error(e.to_string()),
        }
    }
}

pub struct McpManager {
    shared: Arc<Vec<Arc<StdioMcpClient>>>,
    device: Arc<DeviceMcpClient>,
}

impl McpManager {
    pub fn new(shared: Arc<Vec<Arc<StdioMcpClient>>>) -> Self {
        Self {
            shared,
            device: Arc::new(DeviceMcpClient::new()),
        }
    }

    pub fn device_client(&self) -> Arc<DeviceMcpClient> {
        self.device.clone()
    }

    /// Bind to a live session: register the shared servers' tools and point
    /// the device client at the connection.
    pub async fn bind(
        &self,
        conn: &Arc<Connection>,
        session_id: &str,
        registry: &ToolRegistry,
    ) -> Result<()> {
        self.device.bind(conn, session_id);
        for client in self.shared.iter() {
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = client.name(), error = %e, "mcp tool listing failed");
                    continue;
                }
            };
            for tool in tools {
                registry.register(
                    ToolDescriptor::new(
                        &tool.name,
                        tool.description.as_deref().unwrap_or(""),
                        tool.input_schema,
                        ToolOwner::RemoteMcp,
                    ),
                    Arc::new(StdioToolExecutor {
                        client: client.clone(),
                    }),
                );
            }
        }
        Ok(())
    }

    /// Ask the device for its hosted tools (initialize then tools/list) and
    /// register what comes back. Returns the number of tools registered.
    pub async fn probe_device_tools(&self, registry: &ToolRegistry) -> Result<usize> {
        self.device.initialize().await?;
        let tools = self.device.list_all_tools().await?;
        let count = tools.len();
        for tool in tools {
            registry.register(
                ToolDescriptor::new(
                    &tool.name,
                    tool.description.as_deref().unwrap_or(""),
                    tool.input_schema,
                    ToolOwner::DeviceMcp,
                ),
                Arc::new(DeviceToolExecutor::new(self.device.clone())),
            );
        }
        Ok(count)
    }

    /// Route an inbound device `mcp` payload.
    pub fn handle_device_payload(&self, payload: Value) {
        self.device.handle_payload(payload);
    }

    /// Reset connection-bound state. The subprocess clients stay alive for
    /// the next session. Best effort and idempotent.
    pub fn unbind(&self) {
        self.device.unbind();
    }
}
