//! Per-connection session: negotiated state, turn counters, and the shared
//! context every pipeline task works against.

pub mod chat;
pub mod handlers;
pub mod turn;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex};

use crate::asr::AsrAdapter;
use crate::audio::egress::EgressItem;
use crate::audio::ingress::AudioIngress;
use crate::config::Config;
use crate::connection::Connection;
use crate::dialogue::DialogueHistory;
use crate::llm::LlmProvider;
use crate::mcp::manager::McpManager;
use crate::protocol::{AudioParams, ListenMode};
use crate::queue::BoundedQueue;
use crate::tools::ToolRegistry;
use crate::tts::cache::QuickReplyCache;
use crate::tts::{TtsItem, TtsProvider};
use crate::vision::VisionProvider;

/// Once-only session stop signal; all five per-session tasks exit on it.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    fired: AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            fired: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Fire the signal. Returns true only for the first caller.
    pub fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Mutable per-connection state shared across the pipeline tasks.
pub struct SessionState {
    pub session_id: String,
    pub device_id: String,
    pub client_id: String,
    /// Immutable snapshot of the upgrade request headers
    pub headers: HashMap<String, String>,
    pub device_verified: bool,

    /// Uplink parameters from the latest client hello
    pub client_audio: StdMutex<AudioParams>,
    /// Downlink parameters, fixed by server config
    pub server_audio: AudioParams,

    pub listen_mode: StdMutex<ListenMode>,
    /// Manual-mode transcript accumulator
    pub client_asr_text: StdMutex<String>,

    pub talk_round: AtomicU64,
    pub server_voice_stop: AtomicBool,
    pub client_voice_stop: AtomicBool,
    pub close_after_chat: AtomicBool,
    /// Index of the terminal segment of the current response; -1 when unset
    pub tts_last_text_index: AtomicI64,
}

impl SessionState {
    pub fn new(
        session_id: String,
        device_id: String,
        client_id: String,
        headers: HashMap<String, String>,
        server_audio: AudioParams,
        device_verified: bool,
    ) -> Self {
        Self {
            session_id,
            device_id,
            client_id,
            headers,
            device_verified,
            client_audio: StdMutex::new(AudioParams::default()),
            server_audio,
            listen_mode: StdMutex::new(ListenMode::Auto),
            client_asr_text: StdMutex::new(String::new()),
            talk_round: AtomicU64::new(0),
            server_voice_stop: AtomicBool::new(false),
            client_voice_stop: AtomicBool::new(false),
            close_after_chat: AtomicBool::new(false),
            tts_last_text_index: AtomicI64::new(-1),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.talk_round.load(Ordering::Acquire)
    }

    /// Bump the talk round for a new user-initiated turn.
    pub fn begin_round(&self) -> u64 {
        self.talk_round.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn listen_mode(&self) -> ListenMode {
        *self.listen_mode.lock().expect("listen_mode lock poisoned")
    }

    pub fn set_listen_mode(&self, mode: ListenMode) {
        *self.listen_mode.lock().expect("listen_mode lock poisoned") = mode;
    }

    pub fn client_audio(&self) -> AudioParams {
        self.client_audio
            .lock()
            .expect("client_audio lock poisoned")
            .clone()
    }

    pub fn set_client_audio(&self, params: AudioParams) {
        *self
            .client_audio
            .lock()
            .expect("client_audio lock poisoned") = params;
    }

    pub fn voice_stopped(&self) -> bool {
        self.server_voice_stop.load(Ordering::Acquire)
    }

    pub fn set_voice_stop(&self, stop: bool) {
        self.server_voice_stop.store(stop, Ordering::Release);
    }

    pub fn last_text_index(&self) -> i64 {
        self.tts_last_text_index.load(Ordering::Acquire)
    }

    pub fn set_last_text_index(&self, index: i64) {
        self.tts_last_text_index.store(index, Ordering::Release);
    }

    pub fn take_client_asr_text(&self) -> String {
        std::mem::take(
            &mut *self
                .client_asr_text
                .lock()
                .expect("client_asr_text lock poisoned"),
        )
    }

    pub fn push_client_asr_text(&self, text: &str) {
        self.client_asr_text
            .lock()
            .expect("client_asr_text lock poisoned")
            .push_str(text);
    }
}

/// Events consumed by the orchestrator task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A raw inbound text frame from the device
    InboundText(String),
    /// A finalized transcript ready to start a chat turn
    Transcript(String),
}

/// Everything a session task needs, bundled once at connection setup.
pub struct SessionCtx {
    pub config: Arc<Config>,
    pub state: Arc<SessionState>,
    pub conn: Arc<Connection>,
    pub history: Arc<Mutex<DialogueHistory>>,

    pub asr: Arc<AsrAdapter>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub vllm: Option<Arc<dyn VisionProvider>>,

    pub registry: Arc<ToolRegistry>,
    pub mcp: Arc<McpManager>,

    pub ingress: Arc<AudioIngress>,
    pub tts_queue: Arc<BoundedQueue<TtsItem>>,
    pub egress_queue: Arc<BoundedQueue<EgressItem>>,
    pub quick_cache: Option<Arc<QuickReplyCache>>,

    pub events: mpsc::Sender<SessionEvent>,
    pub shutdown: Arc<Shutdown>,
}
