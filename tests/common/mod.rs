//! Shared fakes and session harness for the integration suites.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use voicehub::asr::{AsrListener, AsrProvider};
use voicehub::config::Config;
use voicehub::connection::testing::ChannelTransport;
use voicehub::connection::{Connection, Frame};
use voicehub::dialogue::Message;
use voicehub::llm::{LlmProvider, LlmResponse, LlmStream, ToolDefinition};
use voicehub::mcp::manager::McpManager;
use voicehub::pool::ProviderSet;
use voicehub::server;
use voicehub::tts::{TtsProvider, TtsVoiceInfo};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

pub struct FakeAsr {
    listener: StdMutex<Option<Arc<dyn AsrListener>>>,
    pub audio_bytes: AtomicUsize,
    pub resets: AtomicUsize,
}

impl FakeAsr {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listener: StdMutex::new(None),
            audio_bytes: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }

    /// Deliver a transcript exactly as the vendor stream would.
    pub async fn emit(&self, text: &str) -> bool {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .clone()
            .expect("no listener attached");
        listener.on_asr_result(text.to_string()).await
    }
}

#[async_trait]
impl AsrProvider for FakeAsr {
    async fn add_audio(&self, data: Vec<u8>) -> Result<()> {
        self.audio_bytes.fetch_add(data.len(), Ordering::Relaxed);
        Ok(())
    }
    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    fn set_listener(&self, listener: Arc<dyn AsrListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// LLM fake that plays back one scripted delta sequence per call.
pub struct ScriptedLlm {
    scripts: StdMutex<VecDeque<Vec<LlmResponse>>>,
    pub calls: StdMutex<Vec<Vec<Message>>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(VecDeque::new()),
            calls: StdMutex::new(Vec::new()),
        })
    }

    pub fn push_script(&self, deltas: Vec<LlmResponse>) {
        self.scripts.lock().unwrap().push_back(deltas);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn content_delta(text: &str) -> LlmResponse {
    LlmResponse {
        content: Some(text.to_string()),
        ..Default::default()
    }
}

pub fn error_delta(message: &str) -> LlmResponse {
    LlmResponse {
        error: Some(message.to_string()),
        ..Default::default()
    }
}

pub fn tool_call_delta(id: &str, name: &str, arguments: &str) -> LlmResponse {
    LlmResponse {
        tool_calls: Some(vec![voicehub::llm::ToolCallDelta {
            index: Some(0),
            id: if id.is_empty() {
                None
            } else {
                Some(id.to_string())
            },
            function: voicehub::llm::FunctionCallDelta {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                arguments: Some(arguments.to_string()),
            },
        }]),
        ..Default::default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream_with_tools(
        &self,
        _session_id: &str,
        messages: Vec<Message>,
        _tools: Vec<ToolDefinition>,
    ) -> Result<LlmStream> {
        self.calls.lock().unwrap().push(messages);
        let deltas = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// TTS fake that writes short wav files into a tempdir.
pub struct FakeTts {
    dir: PathBuf,
    counter: AtomicUsize,
    pub fail: AtomicBool,
    /// Length of the audio each synthesis produces
    pub duration_ms: AtomicUsize,
    pub synthesized: StdMutex<Vec<String>>,
    pub voice: StdMutex<String>,
}

impl FakeTts {
    pub fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            counter: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            duration_ms: AtomicUsize::new(120),
            synthesized: StdMutex::new(Vec::new()),
            voice: StdMutex::new("zh-CN-XiaoxiaoNeural".to_string()),
        })
    }

    pub fn synth_count(&self) -> usize {
        self.synthesized.lock().unwrap().len()
    }
}

#[async_trait]
impl TtsProvider for FakeTts {
    async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        if self.fail.load(Ordering::Acquire) {
            bail!("synthesis backend unavailable");
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("tts_{n}.wav"));
        let samples_len = 24 * self.duration_ms.load(Ordering::Acquire);
        let samples: Vec<i16> = (0..samples_len).map(|i| ((i % 60) * 100) as i16).collect();
        write_wav(&path, &samples, 24000);
        self.synthesized.lock().unwrap().push(text.to_string());
        Ok(path)
    }

    async fn set_voice(&self, voice: &str) -> Result<()> {
        *self.voice.lock().unwrap() = voice.to_string();
        Ok(())
    }

    fn voice_info(&self) -> TtsVoiceInfo {
        TtsVoiceInfo {
            provider: "EdgeTTS".to_string(),
            voice: self.voice.lock().unwrap().clone(),
        }
    }
}

pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) {
    use std::io::Write;
    let data_len = (samples.len() * 2) as u32;
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(b"RIFF").unwrap();
    f.write_all(&(36 + data_len).to_le_bytes()).unwrap();
    f.write_all(b"WAVEfmt ").unwrap();
    f.write_all(&16u32.to_le_bytes()).unwrap();
    f.write_all(&1u16.to_le_bytes()).unwrap();
    f.write_all(&1u16.to_le_bytes()).unwrap();
    f.write_all(&sample_rate.to_le_bytes()).unwrap();
    f.write_all(&(sample_rate * 2).to_le_bytes()).unwrap();
    f.write_all(&2u16.to_le_bytes()).unwrap();
    f.write_all(&16u16.to_le_bytes()).unwrap();
    f.write_all(b"data").unwrap();
    f.write_all(&data_len.to_le_bytes()).unwrap();
    for s in samples {
        f.write_all(&s.to_le_bytes()).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Session harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub in_tx: mpsc::UnboundedSender<Frame>,
    pub out_rx: mpsc::UnboundedReceiver<Frame>,
    pub asr: Arc<FakeAsr>,
    pub llm: Arc<ScriptedLlm>,
    pub tts: Arc<FakeTts>,
    pub session: JoinHandle<()>,
    pub tmp: tempfile::TempDir,
}

/// A config tuned for the suites: everything local, no device MCP probe
/// unless a test opts in.
pub fn test_config(tmp: &Path) -> Config {
    let mut config = Config::default();
    config.mcp.device_enabled = false;
    config.chat.quick_reply.cache_dir = tmp.join("wake_replay").to_string_lossy().into_owned();
    config.providers.tts.output_dir = tmp.join("tts").to_string_lossy().into_owned();
    config
}

pub async fn start_session_in(config: Config, tmp: tempfile::TempDir) -> Harness {
    let (transport, in_tx, out_rx) = ChannelTransport::new();
    let conn = Arc::new(Connection::new(Box::new(transport)));

    let asr = FakeAsr::new();
    let llm = ScriptedLlm::new();
    let tts = FakeTts::new(tmp.path());

    let set = ProviderSet {
        asr: asr.clone(),
        llm: llm.clone(),
        tts: tts.clone(),
        vllm: None,
        mcp: Arc::new(McpManager::new(Arc::new(Vec::new()))),
    };

    let config = Arc::new(config);
    let session_conn = conn.clone();
    let session = tokio::spawn(async move {
        server::run_session(
            config,
            session_conn,
            &set,
            "sess-test".to_string(),
            "dev-1".to_string(),
            "cli-1".to_string(),
            HashMap::new(),
            true,
        )
        .await;
    });

    Harness {
        in_tx,
        out_rx,
        asr,
        llm,
        tts,
        session,
        tmp,
    }
}

impl Harness {
    pub fn send_json(&self, value: Value) {
        self.in_tx
            .send(Frame::Text(value.to_string()))
            .expect("session gone");
    }

    pub fn send_hello(&self) {
        self.send_json(serde_json::json!({
            "type": "hello",
            "version": 1,
            "transport": "websocket",
            "audio_params": {
                "format": "opus", "sample_rate": 16000,
                "channels": 1, "frame_duration": 60
            }
        }));
    }

    /// Next text frame as JSON, skipping binary audio.
    pub async fn next_text(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.out_rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed");
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).unwrap_or(Value::String(text));
            }
        }
    }

    /// Collect text frames until one matches, returning the full trail
    /// (binary frames are counted, not kept).
    pub async fn text_until<F: Fn(&Value) -> bool>(&mut self, pred: F) -> (Vec<Value>, usize) {
        let mut seen = Vec::new();
        let mut binary = 0usize;
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.out_rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed");
            match frame {
                Frame::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                    let done = pred(&value);
                    seen.push(value);
                    if done {
                        return (seen, binary);
                    }
                }
                Frame::Binary(_) => binary += 1,
            }
        }
    }
}

/// Frame-trail helpers for assertions.
pub fn tts_states(trail: &[Value]) -> Vec<String> {
    trail
        .iter()
        .filter(|v| v["type"] == "tts")
        .filter_map(|v| v["state"].as_str().map(String::from))
        .collect()
}

pub fn sentence_indices(trail: &[Value]) -> Vec<u64> {
    trail
        .iter()
        .filter(|v| v["type"] == "tts" && v["state"] == "sentence_start")
        .filter_map(|v| v["index"].as_u64())
        .collect()
}
