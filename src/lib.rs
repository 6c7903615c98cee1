//! Voicehub - Real-time Voice Assistant Server Library
//!
//! The server side of a full-duplex voice-assistant protocol:
//! - One persistent WebSocket per device (JSON control + binary audio frames)
//! - Streaming ASR -> LLM (with tool calls) -> TTS -> paced audio egress
//! - Turn-based dialogue with barge-in and tight interruption latency
//! - Local and MCP-backed tool calling (stdio subprocess and device-hosted)
//!
//! # Example
//!
//! ```ignore
//! use voicehub::config::Config;
//! use voicehub::server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     server::start(config).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod config;
pub mod queue;
pub mod protocol;
pub mod connection;
pub mod dialogue;
pub mod asr;
pub mod llm;
pub mod tts;
pub mod audio;
pub mod vision;

// Tooling and orchestration
pub mod tools;
pub mod mcp;
pub mod pool;
pub mod session;
pub mod server;

pub use config::Config;
pub use connection::Connection;
pub use pool::{ProviderSet, ResourcePool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Truncate a string to at most `max` bytes without splitting a UTF-8
/// character. Used for log lines that may carry long model output.
pub fn truncate_safe(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_safe_ascii() {
        assert_eq!(truncate_safe("hello", 10), "hello");
        assert_eq!(truncate_safe("hello world", 5), "hello...");
    }

    #[test]
    fn test_truncate_safe_multibyte() {
        // Must not split inside a CJK character
        let s = "你好世界";
        let t = truncate_safe(s, 4);
        assert!(t.starts_with('你'));
        assert!(t.ends_with("..."));
    }
}
