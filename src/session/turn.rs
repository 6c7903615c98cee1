//! Turn and barge-in control: round bookkeeping, the stop sequence, and the
//! bridge that turns ASR results into chat turns.

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::asr::{AsrListener, SILENCE_PROMPT};
use crate::audio::egress::EgressItem;
use crate::dialogue::Message;
use crate::protocol::{ListenMode, OutboundMessage};
use crate::queue::BoundedQueue;
use crate::session::chat::ChatDriver;
use crate::session::{SessionCtx, SessionEvent, SessionState};
use crate::tts::TtsItem;

/// Spoken when the model or its transport falls over mid-turn.
pub const APOLOGY_TEXT: &str = "抱歉，服务暂时出了点问题，请稍后再试。";

/// Segment boundaries for speakable chunks.
pub const SEGMENT_DELIMITERS: [char; 5] = ['。', '？', '！', '；', '：'];

/// Barge-in: raise the stop flag, then purge both speech queues. Safe to
/// call concurrently with the consumers; they observe the flag themselves.
pub fn stop_server_speak(
    state: &SessionState,
    tts_queue: &BoundedQueue<TtsItem>,
    egress_queue: &BoundedQueue<EgressItem>,
    delete_audio: bool,
) {
    state.set_voice_stop(true);
    let dropped_tts = tts_queue.drain().len();
    let dropped_egress = egress_queue.drain();
    for item in &dropped_egress {
        item.cleanup(delete_audio);
    }
    if dropped_tts > 0 || !dropped_egress.is_empty() {
        tracing::debug!(
            session_id = %state.session_id,
            dropped_tts,
            dropped_egress = dropped_egress.len(),
            "purged speech queues"
        );
    }
}

/// Client-initiated abort: stop speaking, acknowledge with a `tts stop`,
/// and go back to listening.
pub async fn client_abort_chat(ctx: &SessionCtx) {
    tracing::info!(
        session_id = %ctx.state.session_id,
        device_id = %ctx.state.device_id,
        "client abort"
    );
    stop_server_speak(
        &ctx.state,
        &ctx.tts_queue,
        &ctx.egress_queue,
        ctx.config.audio.delete_audio,
    );
    let _ = ctx
        .conn
        .write_text(OutboundMessage::tts_stop(&ctx.state.session_id).to_text())
        .await;
    ctx.state.set_last_text_index(-1);
    if let Err(e) = ctx.asr.reset().await {
        tracing::warn!(session_id = %ctx.state.session_id, error = %e, "asr reset on abort failed");
    }
}

/// Strip everything that is not a letter, digit, or CJK character so exit
/// phrases match regardless of trailing punctuation.
fn strip_punctuation(text: &str) -> String {
    text.chars().filter(|c| c.is_alphanumeric()).collect()
}

fn is_exit_command(ctx: &SessionCtx, text: &str) -> bool {
    let stripped = strip_punctuation(text);
    ctx.config
        .chat
        .exit_commands
        .iter()
        .any(|cmd| strip_punctuation(cmd) == stripped)
}

fn is_wakeup_word(ctx: &SessionCtx, text: &str) -> bool {
    let stripped = strip_punctuation(text);
    ctx.config
        .chat
        .wakeup_words
        .iter()
        .any(|w| strip_punctuation(w) == stripped)
}

/// Entry point for every user-initiated turn (transcript, chat text, or a
/// detect frame).
pub async fn begin_chat_turn(ctx: &Arc<SessionCtx>, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }

    if is_exit_command(ctx, text) {
        tracing::info!(
            session_id = %ctx.state.session_id,
            device_id = %ctx.state.device_id,
            "exit command matched, closing"
        );
        ctx.conn.close().await;
        ctx.shutdown.trigger();
        return;
    }

    if ctx.config.chat.quick_reply.enabled && is_wakeup_word(ctx, text) {
        wake_greeting(ctx, text).await;
        return;
    }

    let round = ctx.state.begin_round();
    ctx.state.set_voice_stop(false);
    ctx.state.client_voice_stop.store(false, Ordering::Release);
    ctx.state.set_last_text_index(-1);

    let session_id = &ctx.state.session_id;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::stt(session_id, text).to_text())
        .await;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::tts_start(session_id).to_text())
        .await;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::emotion(session_id, "🤔", "thinking").to_text())
        .await;

    {
        let mut history = ctx.history.lock().await;
        history.append(Message::user(text));
    }

    spawn_chat_turn(ctx.clone(), round);
}

/// Wakeword path: a canned greeting straight from the quick-reply cache,
/// no model round-trip.
async fn wake_greeting(ctx: &Arc<SessionCtx>, text: &str) {
    let words = &ctx.config.chat.quick_reply.words;
    let Some(reply) = words.choose(&mut rand::rng()).cloned() else {
        return;
    };
    let round = ctx.state.begin_round();
    ctx.state.set_voice_stop(false);

    let session_id = &ctx.state.session_id;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::stt(session_id, text).to_text())
        .await;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::tts_start(session_id).to_text())
        .await;

    ctx.state.set_last_text_index(1);
    let _ = ctx
        .tts_queue
        .push(TtsItem {
            text: reply,
            round,
            index: 1,
        })
        .await;
}

/// Run the streaming driver for one turn in its own task. A panic inside
/// the driver is converted into the apology path; the connection survives.
pub fn spawn_chat_turn(ctx: Arc<SessionCtx>, round: u64) {
    let driver_ctx = ctx.clone();
    let turn = tokio::spawn(async move {
        let mut driver = ChatDriver::new(driver_ctx, round);
        driver.generate_response().await
    });

    tokio::spawn(async move {
        match turn.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    session_id = %ctx.state.session_id,
                    device_id = %ctx.state.device_id,
                    round,
                    error = %e,
                    "chat turn failed"
                );
            }
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(
                    session_id = %ctx.state.session_id,
                    device_id = %ctx.state.device_id,
                    round,
                    "chat turn panicked, sending apology"
                );
                ctx.state.set_last_text_index(1);
                let _ = ctx
                    .tts_queue
                    .push(TtsItem {
                        text: APOLOGY_TEXT.to_string(),
                        round,
                        index: 1,
                    })
                    .await;
            }
            Err(_) => {}
        }
    });
}

/// Map response text to the emotion hint frame.
pub fn emotion_for(text: &str) -> (&'static str, &'static str) {
    if text.contains('哈') || text.contains("开心") || text.contains('笑') {
        ("😄", "happy")
    } else if text.contains("抱歉") || text.contains("对不起") || text.contains("遗憾") {
        ("😔", "sad")
    } else if text.contains('？') {
        ("🤔", "thinking")
    } else {
        ("🙂", "neutral")
    }
}

/// Listener wired between the ASR adapter and the orchestrator. Runs the
/// per-mode logic from the provider's delivery context and forwards
/// finalized transcripts as session events.
pub struct SessionAsrBridge {
    state: Arc<SessionState>,
    tts_queue: Arc<BoundedQueue<TtsItem>>,
    egress_queue: Arc<BoundedQueue<EgressItem>>,
    events: mpsc::Sender<SessionEvent>,
    delete_audio: bool,
    realtime_continue_recognition: bool,
}

impl SessionAsrBridge {
    pub fn new(
        state: Arc<SessionState>,
        tts_queue: Arc<BoundedQueue<TtsItem>>,
        egress_queue: Arc<BoundedQueue<EgressItem>>,
        events: mpsc::Sender<SessionEvent>,
        delete_audio: bool,
        realtime_continue_recognition: bool,
    ) -> Self {
        Self {
            state,
            tts_queue,
            egress_queue,
            events,
            delete_audio,
            realtime_continue_recognition,
        }
    }

    async fn forward(&self, text: String) {
        let _ = self.events.send(SessionEvent::Transcript(text)).await;
    }
}

#[async_trait]
impl AsrListener for SessionAsrBridge {
    async fn on_asr_result(&self, text: String) -> bool {
        // The silence watchdog speaks through the same channel; its
        // sentinel winds the conversation down regardless of mode.
        if text == SILENCE_PROMPT {
            self.state.close_after_chat.store(true, Ordering::Release);
            self.forward(text).await;
            return true;
        }

        match self.state.listen_mode() {
            ListenMode::Auto => {
                if text.trim().is_empty() {
                    return false;
                }
                self.forward(text).await;
                true
            }
            ListenMode::Manual => {
                self.state.push_client_asr_text(&text);
                if self.state.client_voice_stop.load(Ordering::Acquire) {
                    let accumulated = self.state.take_client_asr_text();
                    if !accumulated.trim().is_empty() {
                        self.forward(accumulated).await;
                    }
                    return true;
                }
                false
            }
            ListenMode::Realtime => {
                // Interrupt whatever the server is saying, then start the
                // new turn with this transcript.
                stop_server_speak(
                    &self.state,
                    &self.tts_queue,
                    &self.egress_queue,
                    self.delete_audio,
                );
                self.forward(text).await;
                !self.realtime_continue_recognition
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AudioParams;
    use std::collections::HashMap;

    fn state() -> Arc<SessionState> {
        Arc::new(SessionState::new(
            "s1".to_string(),
            "dev".to_string(),
            "cli".to_string(),
            HashMap::new(),
            AudioParams::default(),
            true,
        ))
    }

    fn bridge(
        state: Arc<SessionState>,
        realtime_continue: bool,
    ) -> (
        SessionAsrBridge,
        Arc<BoundedQueue<TtsItem>>,
        Arc<BoundedQueue<EgressItem>>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let tts = Arc::new(BoundedQueue::new(10));
        let egress = Arc::new(BoundedQueue::new(10));
        let (tx, rx) = mpsc::channel(10);
        let bridge = SessionAsrBridge::new(
            state,
            tts.clone(),
            egress.clone(),
            tx,
            true,
            realtime_continue,
        );
        (bridge, tts, egress, rx)
    }

    #[test]
    fn test_strip_punctuation() {
        assert_eq!(strip_punctuation("退出。"), "退出");
        assert_eq!(strip_punctuation("再见！！"), "再见");
        assert_eq!(strip_punctuation("bye-bye"), "byebye");
    }

    #[tokio::test]
    async fn test_auto_mode_forwards_and_stops() {
        let (bridge, _tts, _egress, mut rx) = bridge(state(), false);
        assert!(bridge.on_asr_result("你好".to_string()).await);
        match rx.recv().await.unwrap() {
            SessionEvent::Transcript(text) => assert_eq!(text, "你好"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_mode_ignores_empty() {
        let (bridge, _tts, _egress, mut rx) = bridge(state(), false);
        assert!(!bridge.on_asr_result("  ".to_string()).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_mode_accumulates_until_stop() {
        let s = state();
        s.set_listen_mode(ListenMode::Manual);
        let (bridge, _tts, _egress, mut rx) = bridge(s.clone(), false);

        assert!(!bridge.on_asr_result("今天".to_string()).await);
        assert!(rx.try_recv().is_err());

        s.client_voice_stop.store(true, Ordering::Release);
        assert!(bridge.on_asr_result("天气怎么样".to_string()).await);
        match rx.recv().await.unwrap() {
            SessionEvent::Transcript(text) => assert_eq!(text, "今天天气怎么样"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_realtime_mode_barges_in() {
        let s = state();
        s.set_listen_mode(ListenMode::Realtime);
        let (bridge, tts, egress, mut rx) = bridge(s.clone(), false);

        let round = s.begin_round();
        tts.push(TtsItem {
            text: "旧句子".to_string(),
            round,
            index: 1,
        })
        .await
        .unwrap();
        egress
            .push(EgressItem::sentinel("旧句子".to_string(), round, 1))
            .await
            .unwrap();

        // Canonical variant: recognition stops after the interrupt
        assert!(bridge.on_asr_result("等一下".to_string()).await);
        assert!(s.voice_stopped());
        assert!(tts.is_empty());
        assert!(egress.is_empty());
        match rx.recv().await.unwrap() {
            SessionEvent::Transcript(text) => assert_eq!(text, "等一下"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_realtime_continue_variant() {
        let s = state();
        s.set_listen_mode(ListenMode::Realtime);
        let (bridge, _tts, _egress, _rx) = bridge(s, true);
        assert!(!bridge.on_asr_result("继续".to_string()).await);
    }

    #[tokio::test]
    async fn test_silence_sentinel_sets_close_after_chat() {
        let s = state();
        let (bridge, _tts, _egress, mut rx) = bridge(s.clone(), false);
        assert!(bridge.on_asr_result(SILENCE_PROMPT.to_string()).await);
        assert!(s.close_after_chat.load(Ordering::Acquire));
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Transcript(_)
        ));
    }

    #[test]
    fn test_emotion_mapping() {
        assert_eq!(emotion_for("哈哈，太有意思了").1, "happy");
        assert_eq!(emotion_for("抱歉，我不知道").1, "sad");
        assert_eq!(emotion_for("今天天气不错").1, "neutral");
    }
}
