//! Tool registry and router: the catalog of everything the model may call.
//!
//! Tools come from three owners: in-process local handlers, external MCP
//! servers (stdio subprocess), and tools hosted on the connected device.
//! The registry indexes by canonical name and by the sanitized name used on
//! the wire (LLM function schemas reject dots).

pub mod local;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::llm::ToolDefinition;

/// Per-call deadline for remote tools.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a tool invocation, interpreted by the LLM driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResponse {
    /// Invocation failed; logged, nothing fed back to the model
    Error(String),
    /// No such tool
    NotFound,
    /// Tool ran for its side effect only
    None,
    /// Speak this text directly, without re-entering the model
    DirectReply(String),
    /// Dispatch a named in-process side-effect handler
    CallHandler { name: String, args: Value },
    /// Append this as a tool result and re-enter the model
    ReqLlm(String),
}

/// Which subsystem owns a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOwner {
    Local,
    RemoteMcp,
    DeviceMcp,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub sanitized_name: String,
    pub description: String,
    pub input_schema: Value,
    pub owner: ToolOwner,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, input_schema: Value, owner: ToolOwner) -> Self {
        Self {
            name: name.to_string(),
            sanitized_name: sanitize_tool_name(name),
            description: description.to_string(),
            input_schema,
            owner,
        }
    }

    /// The wire-facing function definition; always uses the sanitized name.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            &self.sanitized_name,
            &self.description,
            self.input_schema.clone(),
        )
    }
}

/// Replace every character the LLM function-name grammar rejects with `_`.
/// Notably `self.camera.take_photo` -> `self_camera_take_photo`.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Executes calls for the tools it owns. `name` is always canonical.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, args: Value) -> ActionResponse;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    executor: Arc<dyn ToolExecutor>,
}

/// Catalog of callable tools for one session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: StdMutex<HashMap<String, RegisteredTool>>,
    by_sanitized: StdMutex<HashMap<String, String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: ToolDescriptor, executor: Arc<dyn ToolExecutor>) {
        let mut by_sanitized = self
            .by_sanitized
            .lock()
            .expect("sanitized index lock poisoned");
        let mut tools = self.tools.lock().expect("tools lock poisoned");
        by_sanitized.insert(descriptor.sanitized_name.clone(), descriptor.name.clone());
        tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                executor,
            },
        );
    }

    /// Drop every tool of one owner; used when a session unbinds its
    /// device-hosted tools.
    pub fn unregister_owner(&self, owner: ToolOwner) {
        let mut tools = self.tools.lock().expect("tools lock poisoned");
        let mut by_sanitized = self
            .by_sanitized
            .lock()
            .expect("sanitized index lock poisoned");
        tools.retain(|_, t| {
            if t.descriptor.owner == owner {
                by_sanitized.remove(&t.descriptor.sanitized_name);
                false
            } else {
                true
            }
        });
    }

    /// Resolve canonical-or-sanitized name to the canonical name.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let tools = self.tools.lock().expect("tools lock poisoned");
        if tools.contains_key(name) {
            return Some(name.to_string());
        }
        self.by_sanitized
            .lock()
            .expect("sanitized index lock poisoned")
            .get(name)
            .cloned()
    }

    /// Wire-facing definitions for the current catalog.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.lock().expect("tools lock poisoned");
        let mut defs: Vec<ToolDefinition> =
            tools.values().map(|t| t.descriptor.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.lock().expect("tools lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch a call to the owning executor. Unknown tools yield
    /// `NotFound`; calls are bounded by `TOOL_CALL_TIMEOUT`.
    pub async fn execute(&self, name: &str, args: Value) -> ActionResponse {
        let Some(canonical) = self.resolve(name) else {
            return ActionResponse::NotFound;
        };
        let executor = {
            let tools = self.tools.lock().expect("tools lock poisoned");
            match tools.get(&canonical) {
                Some(t) => t.executor.clone(),
                None => return ActionResponse::NotFound,
            }
        };
        match tokio::time::timeout(TOOL_CALL_TIMEOUT, executor.execute(&canonical, args)).await {
            Ok(response) => response,
            Err(_) => ActionResponse::Error(format!("tool {canonical} timed out")),
        }
    }
}
