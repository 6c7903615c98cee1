//! ASR adapter: upstream audio to the recognition backend, transcripts back
//! to the session through the listener contract.
//!
//! The provider owns the vendor connection (established lazily on first
//! audio). The adapter sits between provider and session listener so it can
//! track recognition progress and run the silence watchdog.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::task::JoinHandle;

/// Idle window after which one silence strike is recorded.
pub const SILENCE_WINDOW: Duration = Duration::from_secs(30);
/// Strikes before the conversation is wound down.
pub const MAX_SILENCE_STRIKES: u32 = 2;
/// Sentinel fed to the dialogue when the user has gone quiet for good.
pub const SILENCE_PROMPT: &str = "长时间未检测到用户说话，请礼貌的结束对话";

/// Receives transcription results. The return value tells the provider
/// whether to stop recognition after this result.
#[async_trait]
pub trait AsrListener: Send + Sync {
    async fn on_asr_result(&self, text: String) -> bool;
}

/// Streaming speech recognition backend.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Feed PCM (or salvage-mode raw) audio. The upstream connection is
    /// established lazily on the first call.
    async fn add_audio(&self, data: Vec<u8>) -> Result<()>;

    /// Close the upstream and clear buffers. Must be callable from any task.
    async fn reset(&self) -> Result<()>;

    fn set_listener(&self, listener: Arc<dyn AsrListener>);

    /// Force the current utterance to a final result.
    async fn finalize(&self) -> Result<()>;

    fn silence_count(&self) -> u32 {
        0
    }

    fn reset_start_listen_time(&self) {}
}

/// Wraps a provider, interposing on the listener path for silence
/// bookkeeping. The adapter registers itself as the provider's listener and
/// forwards results downstream.
pub struct AsrAdapter {
    provider: Arc<dyn AsrProvider>,
    downstream: Arc<dyn AsrListener>,
    last_progress: StdMutex<Instant>,
    silence_count: AtomicU32,
}

impl AsrAdapter {
    pub fn attach(provider: Arc<dyn AsrProvider>, downstream: Arc<dyn AsrListener>) -> Arc<Self> {
        let adapter = Arc::new(Self {
            provider,
            downstream,
            last_progress: StdMutex::new(Instant::now()),
            silence_count: AtomicU32::new(0),
        });
        adapter.provider.set_listener(adapter.clone());
        adapter
    }

    pub async fn add_audio(&self, data: Vec<u8>) -> Result<()> {
        self.provider.add_audio(data).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.mark_progress();
        self.silence_count.store(0, Ordering::Release);
        self.provider.reset_start_listen_time();
        self.provider.reset().await
    }

    pub async fn finalize(&self) -> Result<()> {
        self.provider.finalize().await
    }

    /// The client opened its microphone; restart the idle clock.
    pub fn note_listen_start(&self) {
        self.mark_progress();
        self.silence_count.store(0, Ordering::Release);
        self.provider.reset_start_listen_time();
    }

    pub fn silence_count(&self) -> u32 {
        self.silence_count.load(Ordering::Acquire)
    }

    fn mark_progress(&self) {
        *self.last_progress.lock().expect("progress lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_progress
            .lock()
            .expect("progress lock poisoned")
            .elapsed()
    }

    /// Periodically check for recognition progress. Two idle windows in a
    /// row feed the end-conversation sentinel to the session.
    pub fn spawn_watchdog(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SILENCE_WINDOW);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                if adapter.idle_for() < SILENCE_WINDOW {
                    continue;
                }
                let strikes = adapter.silence_count.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(strikes, "asr silence window elapsed");
                if strikes >= MAX_SILENCE_STRIKES {
                    adapter.silence_count.store(0, Ordering::Release);
                    adapter.mark_progress();
                    let _ = adapter
                        .downstream
                        .on_asr_result(SILENCE_PROMPT.to_string())
                        .await;
                }
            }
        })
    }
}

#[async_trait]
impl AsrListener for AsrAdapter {
    async fn on_asr_result(&self, text: String) -> bool {
        self.mark_progress();
        self.silence_count.store(0, Ordering::Release);
        self.downstream.on_asr_result(text).await
    }
}
