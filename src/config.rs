//! Configuration management
//!
//! Loads the YAML server configuration. Every section has serde defaults so
//! a partial config file (or none at all) still yields a runnable server.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Downlink audio settings
    #[serde(default)]
    pub audio: AudioConfig,
    /// Provider selection and credentials
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Connection resource pool
    #[serde(default)]
    pub pool: PoolConfig,
    /// Dialogue behaviour
    #[serde(default)]
    pub chat: ChatConfig,
    /// Listen-mode tuning
    #[serde(default)]
    pub listen: ListenConfig,
    /// MCP tool servers
    #[serde(default)]
    pub mcp: McpConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket route the devices connect to
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_ws_path() -> String {
    "/voicehub/v1/".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            auth: AuthConfig::default(),
        }
    }
}

/// Device authentication gate. When enabled, the upgrade request must carry
/// a known bearer token or come from an allow-listed device id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub allowed_devices: Vec<String>,
}

/// Downlink audio settings (server -> device)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// "opus" or "pcm"
    #[serde(default = "default_audio_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_frame_duration")]
    pub frame_duration_ms: u32,
    /// Frames sent back-to-back before real-time pacing starts
    #[serde(default = "default_pre_buffer_frames")]
    pub pre_buffer_frames: usize,
    /// Delete synthesized audio files after playback
    #[serde(default = "default_true")]
    pub delete_audio: bool,
}

fn default_audio_format() -> String {
    "opus".to_string()
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_channels() -> u8 {
    1
}

fn default_frame_duration() -> u32 {
    60
}

fn default_pre_buffer_frames() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            format: default_audio_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration_ms: default_frame_duration(),
            pre_buffer_frames: default_pre_buffer_frames(),
            delete_audio: true,
        }
    }
}

/// Provider selection. Each provider is resolved by name through the
/// process-global factory registry at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub asr: AsrProviderConfig,
    #[serde(default)]
    pub llm: LlmProviderConfig,
    #[serde(default)]
    pub tts: TtsProviderConfig,
    #[serde(default)]
    pub vllm: VllmProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrProviderConfig {
    #[serde(default)]
    pub provider: String,
    /// Provider-specific options, passed through opaquely
    #[serde(default)]
    pub options: serde_yaml::Value,
}

impl Default for AsrProviderConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            options: serde_yaml::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub voice: String,
    /// Directory synthesized files are written to
    #[serde(default = "default_tts_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub options: serde_yaml::Value,
}

fn default_tts_output_dir() -> String {
    "tmp/tts".to_string()
}

impl Default for TtsProviderConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            voice: String::new(),
            output_dir: default_tts_output_dir(),
            options: serde_yaml::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VllmProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
}

/// Connection resource pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Provider sets pre-built at startup; also the max concurrent sessions
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

fn default_pool_size() -> usize {
    8
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

/// Dialogue behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Punctuation-stripped transcripts matching any of these close the session
    #[serde(default = "default_exit_commands")]
    pub exit_commands: Vec<String>,
    /// Retain the system prompt plus this many recent messages
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default)]
    pub quick_reply: QuickReplyConfig,
    /// Wakewords that trigger the canned greeting instead of a full turn
    #[serde(default)]
    pub wakeup_words: Vec<String>,
}

fn default_system_prompt() -> String {
    "你是一个亲切的语音助手，回答要简短口语化，适合朗读。今天是{date}。".to_string()
}

fn default_exit_commands() -> Vec<String> {
    vec!["退出".to_string(), "关闭".to_string()]
}

fn default_max_history() -> usize {
    20
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            exit_commands: default_exit_commands(),
            max_history: default_max_history(),
            quick_reply: QuickReplyConfig::default(),
            wakeup_words: Vec::new(),
        }
    }
}

/// Canned wake-greeting phrases whose audio is disk-cached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReplyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_quick_reply_words")]
    pub words: Vec<String>,
    /// On-disk cache of synthesized quick replies
    #[serde(default = "default_quick_reply_cache_dir")]
    pub cache_dir: String,
}

fn default_quick_reply_words() -> Vec<String> {
    vec!["我在".to_string(), "在呢".to_string()]
}

fn default_quick_reply_cache_dir() -> String {
    "wake_replay".to_string()
}

impl Default for QuickReplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            words: default_quick_reply_words(),
            cache_dir: default_quick_reply_cache_dir(),
        }
    }
}

/// Listen-mode tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Keep recognition running through a realtime-mode barge-in instead of
    /// stopping it. Continuing recognition while the server speaks risks
    /// cascading false interrupts, so this defaults to off.
    #[serde(default)]
    pub realtime_continue_recognition: bool,
}

/// MCP tool servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Stdio subprocess servers started once and shared across sessions
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
    /// Probe connected devices for device-hosted tools after hello
    #[serde(default = "default_true")]
    pub device_enabled: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            device_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// The system prompt with `{date}` substituted for today's date.
    pub fn rendered_system_prompt(&self) -> String {
        let today = chrono::Local::now().format("%Y-%m-%d %A").to_string();
        self.chat.system_prompt.replace("{date}", &today)
    }
}
