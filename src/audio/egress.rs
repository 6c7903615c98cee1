//! Paced audio egress: synthesized files out to the device as fixed-duration
//! frames on a real-time clock.
//!
//! The device only has a small jitter buffer; blasting a whole utterance at
//! once would overrun it and make barge-in useless. So the first few frames
//! go out back-to-back to seed the buffer, and the rest are paced on the
//! wall clock with short interruptible waits.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::asr::AsrAdapter;
use crate::audio::codec::{self, FrameEncoding};
use crate::config::AudioConfig;
use crate::connection::Connection;
use crate::protocol::OutboundMessage;
use crate::queue::BoundedQueue;
use crate::session::{SessionState, Shutdown};

/// Downlink item queue capacity.
pub const EGRESS_QUEUE_SIZE: usize = 100;

/// Interruptible-wait granularity; bounds barge-in latency during playback.
const PACER_POLL: Duration = Duration::from_millis(10);

/// One synthesized segment headed for the wire. A `None` path is a sentinel
/// that keeps the index sequence dense without producing audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressItem {
    pub path: Option<PathBuf>,
    pub text: String,
    pub round: u64,
    pub index: u32,
    /// Quick-reply cache files are never deleted
    pub cached: bool,
}

impl EgressItem {
    pub fn sentinel(text: String, round: u64, index: u32) -> Self {
        Self {
            path: None,
            text,
            round,
            index,
            cached: false,
        }
    }

    /// Remove the backing file when cleanup is configured and the file is
    /// not a shared cache entry.
    pub fn cleanup(&self, delete_audio: bool) {
        if let Some(path) = &self.path {
            if delete_audio && !self.cached {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// The single egress consumer. Exits when the queue closes.
pub async fn run_egress_worker(
    state: Arc<SessionState>,
    conn: Arc<Connection>,
    asr: Arc<AsrAdapter>,
    queue: Arc<BoundedQueue<EgressItem>>,
    audio: AudioConfig,
    shutdown: Arc<Shutdown>,
) {
    let mut stop_rx = shutdown.subscribe();
    while let Some(item) = queue.pop().await {
        send_item(&state, &conn, &asr, &audio, &shutdown, &mut stop_rx, item).await;
    }
    tracing::debug!(session_id = %state.session_id, "egress worker stopped");
}

async fn send_item(
    state: &SessionState,
    conn: &Connection,
    asr: &AsrAdapter,
    audio: &AudioConfig,
    shutdown: &Shutdown,
    stop_rx: &mut tokio::sync::watch::Receiver<bool>,
    item: EgressItem,
) {
    // Stale turn: a newer round owns the wire now
    if item.round != state.current_round() {
        item.cleanup(audio.delete_audio);
        return;
    }
    if state.voice_stopped() || shutdown.is_triggered() || conn.is_closed() {
        item.cleanup(audio.delete_audio);
        return;
    }

    let Some(path) = item.path.clone() else {
        // Sanitized-to-empty or failed synthesis: no audio, but the terminal
        // segment still has to emit the stop marker
        finalize(state, conn, asr, shutdown, &item).await;
        return;
    };

    let frames = match transcode(&path, audio) {
        Ok(frames) => frames,
        Err(e) => {
            tracing::error!(
                session_id = %state.session_id,
                device_id = %state.device_id,
                file = %path.display(),
                error = %e,
                "transcode failed, skipping segment"
            );
            item.cleanup(audio.delete_audio);
            finalize(state, conn, asr, shutdown, &item).await;
            return;
        }
    };

    let encoding = FrameEncoding::from_name(&audio.format);
    let start_msg =
        OutboundMessage::sentence_start(&state.session_id, &item.text, item.index, encoding.name());
    if conn.write_text(start_msg.to_text()).await.is_err() {
        item.cleanup(audio.delete_audio);
        return;
    }

    let frame_ms = audio.frame_duration_ms as u64;
    let pre_buffer = audio.pre_buffer_frames.min(frames.len());

    // Seed the client jitter buffer without pacing
    for frame in &frames[..pre_buffer] {
        if interrupted(state, shutdown, item.round) {
            item.cleanup(audio.delete_audio);
            return;
        }
        if conn.write_binary(frame.clone()).await.is_err() {
            item.cleanup(audio.delete_audio);
            return;
        }
    }

    // Pace the remainder on the wall clock
    let start = Instant::now();
    for (k, frame) in frames[pre_buffer..].iter().enumerate() {
        let expected = start + Duration::from_millis(k as u64 * frame_ms);
        if !sleep_until_interruptible(state, stop_rx, item.round, expected).await {
            item.cleanup(audio.delete_audio);
            return;
        }
        if conn.write_binary(frame.clone()).await.is_err() {
            item.cleanup(audio.delete_audio);
            return;
        }
    }

    // Let the client drain its pre-buffer before declaring the sentence done
    let drain_deadline = Instant::now() + Duration::from_millis(pre_buffer as u64 * frame_ms);
    if !sleep_until_interruptible(state, stop_rx, item.round, drain_deadline).await {
        item.cleanup(audio.delete_audio);
        return;
    }

    let end_msg = OutboundMessage::sentence_end(&state.session_id, &item.text, item.index);
    let _ = conn.write_text(end_msg.to_text()).await;

    item.cleanup(audio.delete_audio);
    finalize(state, conn, asr, shutdown, &item).await;
}

/// Decode, resample to the downlink rate, and frame up one audio file.
fn transcode(path: &std::path::Path, audio: &AudioConfig) -> anyhow::Result<Vec<Vec<u8>>> {
    let decoded = codec::decode_audio_file(path)?;
    let samples = codec::resample_linear(&decoded.samples, decoded.sample_rate, audio.sample_rate);
    codec::encode_frames(
        &samples,
        audio.sample_rate,
        audio.frame_duration_ms,
        FrameEncoding::from_name(&audio.format),
    )
}

fn interrupted(state: &SessionState, shutdown: &Shutdown, round: u64) -> bool {
    state.voice_stopped() || state.current_round() != round || shutdown.is_triggered()
}

/// Sleep until `deadline`, waking every few milliseconds to re-check the
/// stop flag and round. Returns false when playback should be abandoned.
async fn sleep_until_interruptible(
    state: &SessionState,
    stop_rx: &mut tokio::sync::watch::Receiver<bool>,
    round: u64,
    deadline: Instant,
) -> bool {
    loop {
        if state.voice_stopped() || state.current_round() != round {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let step = PACER_POLL.min(deadline - now);
        tokio::select! {
            _ = tokio::time::sleep(step) => {}
            _ = stop_rx.changed() => return false,
        }
    }
}

/// Terminal-segment bookkeeping: exactly one `tts stop` per response, then
/// either close the connection or go back to listening.
async fn finalize(
    state: &SessionState,
    conn: &Connection,
    asr: &AsrAdapter,
    shutdown: &Shutdown,
    item: &EgressItem,
) {
    if item.index as i64 != state.last_text_index() {
        return;
    }
    let _ = conn
        .write_text(OutboundMessage::tts_stop(&state.session_id).to_text())
        .await;
    if state.close_after_chat.load(Ordering::Acquire) {
        tracing::info!(
            session_id = %state.session_id,
            device_id = %state.device_id,
            "closing connection after final response"
        );
        conn.close().await;
        shutdown.trigger();
        return;
    }
    state.set_last_text_index(-1);
    if let Err(e) = asr.reset().await {
        tracing::warn!(session_id = %state.session_id, error = %e, "asr reset after speak failed");
    }
}
