//! Built-in local tools.
//!
//! These run in-process. Tools whose effect lives in the session (closing
//! the connection, switching the TTS voice, playing a file) return
//! `CallHandler` so the LLM driver can run the side effect with session
//! context; pure lookups answer through `ReqLlm`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{ActionResponse, ToolDescriptor, ToolExecutor, ToolOwner, ToolRegistry};

pub const HANDLER_EXIT: &str = "mcp_handler_exit";
pub const HANDLER_PLAY_MUSIC: &str = "mcp_handler_play_music";
pub const HANDLER_CHANGE_VOICE: &str = "mcp_handler_change_voice";
pub const HANDLER_CHANGE_ROLE: &str = "mcp_handler_change_role";

pub struct LocalToolExecutor;

#[async_trait]
impl ToolExecutor for LocalToolExecutor {
    async fn execute(&self, name: &str, args: Value) -> ActionResponse {
        match name {
            "exit" => ActionResponse::CallHandler {
                name: HANDLER_EXIT.to_string(),
                args,
            },
            "get_time" => {
                let now = chrono::Local::now();
                ActionResponse::ReqLlm(format!(
                    "当前时间是 {}，今天是{}。",
                    now.format("%Y-%m-%d %H:%M:%S"),
                    now.format("%A")
                ))
            }
            "change_role" => ActionResponse::CallHandler {
                name: HANDLER_CHANGE_ROLE.to_string(),
                args,
            },
            "change_voice" => ActionResponse::CallHandler {
                name: HANDLER_CHANGE_VOICE.to_string(),
                args,
            },
            "play_music" => ActionResponse::CallHandler {
                name: HANDLER_PLAY_MUSIC.to_string(),
                args,
            },
            _ => ActionResponse::NotFound,
        }
    }
}

/// Register the built-in tools into a session registry.
pub fn register_local_tools(registry: &ToolRegistry) {
    let executor = Arc::new(LocalToolExecutor);
    let empty_schema = json!({"type": "object", "properties": {}, "required": []});

    registry.register(
        ToolDescriptor::new(
            "exit",
            "当用户想结束对话或让你退出时调用",
            empty_schema.clone(),
            ToolOwner::Local,
        ),
        executor.clone(),
    );
    registry.register(
        ToolDescriptor::new(
            "get_time",
            "查询当前的日期和时间",
            empty_schema.clone(),
            ToolOwner::Local,
        ),
        executor.clone(),
    );
    registry.register(
        ToolDescriptor::new(
            "change_role",
            "切换助手的角色设定",
            json!({
                "type": "object",
                "properties": {
                    "role": {"type": "string", "description": "角色名称"},
                    "prompt": {"type": "string", "description": "角色的系统提示词"}
                },
                "required": ["role"]
            }),
            ToolOwner::Local,
        ),
        executor.clone(),
    );
    registry.register(
        ToolDescriptor::new(
            "change_voice",
            "切换语音合成的音色",
            json!({
                "type": "object",
                "properties": {
                    "voice": {"type": "string", "description": "音色名称"}
                },
                "required": ["voice"]
            }),
            ToolOwner::Local,
        ),
        executor.clone(),
    );
    registry.register(
        ToolDescriptor::new(
            "play_music",
            "播放本地音乐文件",
            json!({
                "type": "object",
                "properties": {
                    "file": {"type": "string", "description": "音频文件路径"}
                },
                "required": ["file"]
            }),
            ToolOwner::Local,
        ),
        executor,
    );
}
