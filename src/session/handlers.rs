//! Orchestrator event loop and the inbound dispatch table.
//!
//! One task per session consumes `SessionEvent`s: raw text frames from the
//! socket reader and finalized transcripts from the ASR bridge. Dialogue
//! history is only ever touched from turns this loop starts.

use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{
    parse_inbound, AudioParams, InboundMessage, ListenMode, ListenState, OutboundMessage,
    ParseError,
};
use crate::session::chat::ChatDriver;
use crate::session::turn::{begin_chat_turn, client_abort_chat, APOLOGY_TEXT};
use crate::session::{SessionCtx, SessionEvent};
use crate::tts::TtsItem;

/// The session's main consumer loop. Exits on shutdown or channel close.
pub async fn run_orchestrator(ctx: Arc<SessionCtx>, mut events: mpsc::Receiver<SessionEvent>) {
    let mut stop_rx = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(&ctx, event).await,
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
    tracing::debug!(session_id = %ctx.state.session_id, "orchestrator stopped");
}

async fn handle_event(ctx: &Arc<SessionCtx>, event: SessionEvent) {
    match event {
        SessionEvent::InboundText(raw) => match parse_inbound(&raw) {
            Ok(message) => dispatch(ctx, message).await,
            Err(ParseError::NotJson) => {
                // Passthrough clients get their text echoed back
                let _ = ctx.conn.write_text(raw).await;
            }
            Err(ParseError::UnknownType(kind)) => {
                tracing::warn!(
                    session_id = %ctx.state.session_id,
                    device_id = %ctx.state.device_id,
                    kind,
                    "unknown inbound message type"
                );
            }
            Err(ParseError::BadPayload { kind, source }) => {
                tracing::warn!(
                    session_id = %ctx.state.session_id,
                    device_id = %ctx.state.device_id,
                    kind,
                    error = %source,
                    "malformed inbound payload"
                );
            }
        },
        SessionEvent::Transcript(text) => on_transcript(ctx, text).await,
    }
}

async fn dispatch(ctx: &Arc<SessionCtx>, message: InboundMessage) {
    match message {
        InboundMessage::Hello { audio_params, .. } => handle_hello(ctx, audio_params).await,
        InboundMessage::Listen {
            state,
            mode,
            text,
            image,
        } => handle_listen(ctx, state, mode, text, image).await,
        InboundMessage::Abort { .. } => client_abort_chat(ctx).await,
        InboundMessage::Chat { text } => begin_chat_turn(ctx, &text).await,
        InboundMessage::Iot {
            descriptors,
            states,
        } => {
            tracing::info!(
                session_id = %ctx.state.session_id,
                device_id = %ctx.state.device_id,
                has_descriptors = descriptors.is_some(),
                has_states = states.is_some(),
                "iot report"
            );
        }
        InboundMessage::Vision { action, .. } => {
            // Image/video generation jobs belong to the external task
            // manager; only acknowledge the trigger here.
            tracing::info!(
                session_id = %ctx.state.session_id,
                action = action.as_deref().unwrap_or(""),
                "vision task requested"
            );
        }
        InboundMessage::Image { image, text } => {
            begin_image_turn(ctx, image, text.unwrap_or_default()).await;
        }
        InboundMessage::Mcp { payload } => handle_mcp(ctx, payload),
    }
}

async fn handle_hello(ctx: &Arc<SessionCtx>, audio_params: Option<AudioParams>) {
    let client_params = audio_params.unwrap_or_default();
    tracing::info!(
        session_id = %ctx.state.session_id,
        device_id = %ctx.state.device_id,
        format = %client_params.format,
        sample_rate = client_params.sample_rate,
        channels = client_params.channels,
        "client hello"
    );
    ctx.state.set_client_audio(client_params.clone());
    if let Err(e) = ctx.ingress.configure(&client_params) {
        tracing::warn!(session_id = %ctx.state.session_id, error = %e, "uplink decoder setup failed");
    }

    let reply = OutboundMessage::hello(&ctx.state.session_id, ctx.state.server_audio.clone());
    let _ = ctx.conn.write_text(reply.to_text()).await;

    // Probe for device-hosted tools off the event loop so their responses
    // can flow back through it
    if ctx.config.mcp.device_enabled {
        let probe_ctx = ctx.clone();
        tokio::spawn(async move {
            match probe_ctx.mcp.probe_device_tools(&probe_ctx.registry).await {
                Ok(count) if count > 0 => {
                    tracing::info!(
                        session_id = %probe_ctx.state.session_id,
                        device_id = %probe_ctx.state.device_id,
                        count,
                        "registered device-hosted tools"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        session_id = %probe_ctx.state.session_id,
                        error = %e,
                        "device mcp probe failed"
                    );
                }
            }
        });
    }
}

async fn handle_listen(
    ctx: &Arc<SessionCtx>,
    state: ListenState,
    mode: Option<ListenMode>,
    text: Option<String>,
    image: Option<String>,
) {
    match state {
        ListenState::Start => {
            if let Some(mode) = mode {
                ctx.state.set_listen_mode(mode);
            }
            ctx.state.take_client_asr_text();
            ctx.state.client_voice_stop.store(false, Ordering::Release);
            ctx.asr.note_listen_start();
        }
        ListenState::Stop => {
            ctx.state.client_voice_stop.store(true, Ordering::Release);
            if ctx.state.listen_mode() == ListenMode::Manual {
                if let Err(e) = ctx.asr.finalize().await {
                    tracing::warn!(session_id = %ctx.state.session_id, error = %e, "asr finalize failed");
                }
                let accumulated = ctx.state.take_client_asr_text();
                if !accumulated.trim().is_empty() {
                    begin_chat_turn(ctx, &accumulated).await;
                }
            }
        }
        ListenState::Detect => {
            if let Some(image) = image {
                begin_image_turn(ctx, image, text.unwrap_or_default()).await;
            } else if let Some(text) = text {
                begin_chat_turn(ctx, &text).await;
            }
        }
    }
}

fn handle_mcp(ctx: &Arc<SessionCtx>, payload: Value) {
    ctx.mcp.handle_device_payload(payload);
}

/// Single-shot image-grounded turn through the vision model.
async fn begin_image_turn(ctx: &Arc<SessionCtx>, image: String, text: String) {
    use base64::Engine;
    if base64::engine::general_purpose::STANDARD
        .decode(image.trim())
        .is_err()
    {
        tracing::warn!(
            session_id = %ctx.state.session_id,
            device_id = %ctx.state.device_id,
            "image payload is not valid base64, dropping"
        );
        return;
    }
    if ctx.vllm.is_none() {
        tracing::warn!(
            session_id = %ctx.state.session_id,
            device_id = %ctx.state.device_id,
            "image turn requested but no vision provider is configured"
        );
        if !text.trim().is_empty() {
            begin_chat_turn(ctx, &text).await;
        }
        return;
    }

    let prompt = if text.trim().is_empty() {
        "看看这张图片，告诉我里面有什么。".to_string()
    } else {
        text
    };

    let round = ctx.state.begin_round();
    ctx.state.set_voice_stop(false);
    ctx.state.set_last_text_index(-1);

    let session_id = &ctx.state.session_id;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::stt(session_id, &prompt).to_text())
        .await;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::tts_start(session_id).to_text())
        .await;
    let _ = ctx
        .conn
        .write_text(OutboundMessage::emotion(session_id, "🤔", "thinking").to_text())
        .await;
    ctx.history.lock().await.append(crate::dialogue::Message::user(&prompt));

    let turn_ctx = ctx.clone();
    let turn = tokio::spawn(async move {
        let mut driver = ChatDriver::new(turn_ctx, round);
        driver.run_image(&image, &prompt).await
    });
    let guard_ctx = ctx.clone();
    tokio::spawn(async move {
        match turn.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(
                    session_id = %guard_ctx.state.session_id,
                    device_id = %guard_ctx.state.device_id,
                    error = %e,
                    "image turn failed"
                );
            }
            Err(join_err) if join_err.is_panic() => {
                guard_ctx.state.set_last_text_index(1);
                let _ = guard_ctx
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

async fn on_transcript(ctx: &Arc<SessionCtx>, text: String) {
    // Canonical realtime behaviour stops recognition across the barge-in;
    // the bridge already purged the speech queues.
    if ctx.state.listen_mode() == ListenMode::Realtime
        && !ctx.config.listen.realtime_continue_recognition
    {
        if let Err(e) = ctx.asr.reset().await {
            tracing::warn!(session_id = %ctx.state.session_id, error = %e, "asr reset on barge-in failed");
        }
    }
    begin_chat_turn(ctx, &text).await;
}
