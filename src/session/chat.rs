//! LLM streaming driver: one instance per chat turn.
//!
//! Streams the completion, carves speakable segments out of the content as
//! it arrives, reassembles tool calls scattered across deltas, and hands
//! each finished segment to the TTS queue. Tool results can re-enter the
//! model; the recursion bottoms out when the model answers without calling
//! anything.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::dialogue::Message;
use crate::llm::{extract_json_object, FunctionCall, ToolCall, ToolCallDelta};
use crate::protocol::OutboundMessage;
use crate::session::turn::{emotion_for, APOLOGY_TEXT, SEGMENT_DELIMITERS};
use crate::session::SessionCtx;
use crate::tools::local::{
    HANDLER_CHANGE_ROLE, HANDLER_CHANGE_VOICE, HANDLER_EXIT, HANDLER_PLAY_MUSIC,
};
use crate::tools::ActionResponse;
use crate::tts::TtsItem;

/// Provider-side failure phrase some backends embed in the content stream.
const UPSTREAM_ERROR_MARKER: &str = "服务响应异常";
/// Inline tool-call marker used by model families that skip the tool_calls
/// delta channel.
const INLINE_TOOL_MARKER: &str = "<tool_call>";

/// Split text into speakable chunks after every segment delimiter. The
/// trailing remainder (if any) becomes the last chunk.
pub fn split_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if SEGMENT_DELIMITERS.contains(&c) {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                segments.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    segments
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    /// Delta index this accumulator follows, adopted from the first tagged
    /// delta; providers are not guaranteed to start at 0
    tracked_index: Option<u32>,
}

impl PendingToolCall {
    fn merge(&mut self, delta: &ToolCallDelta) {
        // Only the first tool call is tracked. Untagged deltas always
        // belong to it; tagged deltas for a different index are later
        // concurrent calls and are ignored.
        match (self.tracked_index, delta.index) {
            (None, Some(index)) => self.tracked_index = Some(index),
            (Some(tracked), Some(index)) if index != tracked => return,
            _ => {}
        }
        if let Some(id) = &delta.id {
            if self.id.is_empty() {
                self.id = id.clone();
            }
        }
        if let Some(name) = &delta.function.name {
            if self.name.is_empty() {
                self.name = name.clone();
            }
        }
        if let Some(arguments) = &delta.function.arguments {
            self.arguments.push_str(arguments);
        }
    }
}

pub struct ChatDriver {
    ctx: Arc<SessionCtx>,
    round: u64,
    segment_index: u32,
    started: Instant,
}

impl ChatDriver {
    pub fn new(ctx: Arc<SessionCtx>, round: u64) -> Self {
        Self {
            ctx,
            round,
            segment_index: 0,
            started: Instant::now(),
        }
    }

    /// Stream one completion and drive the speech pipeline with it.
    /// Recursive through `ReqLlm` tool results.
    pub fn generate_response(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.ctx.state.current_round() != self.round {
                // a newer turn took over while this one was queued
                return Ok(());
            }
            self.ctx.state.set_voice_stop(false);

            let messages = self.ctx.history.lock().await.snapshot();
            let tools = self.ctx.registry.definitions();
            let session_id = self.ctx.state.session_id.clone();

            let mut stream = match self
                .ctx
                .llm
                .stream_with_tools(&session_id, messages, tools)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    self.dispatch_apology().await;
                    return Err(e.context("failed to open LLM stream"));
                }
            };

            let mut content_accum = String::new();
            let mut processed_chars = 0usize;
            let mut pending: Option<PendingToolCall> = None;
            let mut inline_tool = false;

            while let Some(delta) = stream.next().await {
                if let Some(err) = delta.error {
                    self.dispatch_apology().await;
                    return Err(anyhow!("LLM stream error: {err}"));
                }
                if let Some(tool_calls) = &delta.tool_calls {
                    let accum = pending.get_or_insert_with(PendingToolCall::default);
                    for tc in tool_calls {
                        accum.merge(tc);
                    }
                }
                if let Some(content) = delta.content {
                    content_accum.push_str(&content);
                    if content_accum.contains(UPSTREAM_ERROR_MARKER) {
                        self.dispatch_apology().await;
                        return Err(anyhow!("upstream reported service error"));
                    }
                    let trimmed = content_accum.trim_start();
                    if trimmed.starts_with(INLINE_TOOL_MARKER) {
                        inline_tool = true;
                    }
                    // While the prefix could still turn into the marker,
                    // hold segmentation back
                    let maybe_marker = INLINE_TOOL_MARKER.starts_with(trimmed) && !trimmed.is_empty();
                    if pending.is_none() && !inline_tool && !maybe_marker {
                        self.scan_and_dispatch(&content_accum, &mut processed_chars)
                            .await?;
                    }
                }
            }
            drop(stream);

            if pending.is_some() || inline_tool {
                return self
                    .resolve_tool_call(pending.unwrap_or_default(), &content_accum)
                    .await;
            }

            self.finish_content_turn(&content_accum, processed_chars).await
        })
    }

    /// Multimodal turn: stream the vision model over an image, reusing the
    /// same segmentation path. No tool calls on this route.
    pub async fn run_image(&mut self, image_data: &str, text: &str) -> Result<()> {
        let vllm = self
            .ctx
            .vllm
            .clone()
            .ok_or_else(|| anyhow!("no vision provider available"))?;
        self.ctx.state.set_voice_stop(false);

        let messages = self.ctx.history.lock().await.snapshot();
        let session_id = self.ctx.state.session_id.clone();
        let mut stream = match vllm
            .stream_with_image(&session_id, messages, image_data, text)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.dispatch_apology().await;
                return Err(e.context("failed to open vision stream"));
            }
        };

        let mut content_accum = String::new();
        let mut processed_chars = 0usize;
        while let Some(chunk) = stream.next().await {
            content_accum.push_str(&chunk);
            self.scan_and_dispatch(&content_accum, &mut processed_chars)
                .await?;
        }
        drop(stream);

        self.finish_content_turn(&content_accum, processed_chars).await
    }

    /// Dispatch the suffix past `processed` up to the last delimiter.
    async fn scan_and_dispatch(&mut self, accum: &str, processed: &mut usize) -> Result<()> {
        let chars: Vec<char> = accum.chars().collect();
        if *processed >= chars.len() {
            return Ok(());
        }
        let tail = &chars[*processed..];
        let Some(rel_last) = tail.iter().rposition(|c| SEGMENT_DELIMITERS.contains(c)) else {
            return Ok(());
        };
        let segment: String = tail[..=rel_last].iter().collect();
        *processed += rel_last + 1;
        let segment = segment.trim().to_string();
        if !segment.is_empty() {
            self.dispatch_segment(segment).await?;
        }
        Ok(())
    }

    async fn dispatch_segment(&mut self, text: String) -> Result<()> {
        self.segment_index += 1;
        if self.segment_index == 1 {
            tracing::info!(
                session_id = %self.ctx.state.session_id,
                device_id = %self.ctx.state.device_id,
                round = self.round,
                latency_ms = self.started.elapsed().as_millis() as u64,
                "first speech segment ready"
            );
        }
        self.ctx
            .tts_queue
            .push(TtsItem {
                text,
                round: self.round,
                index: self.segment_index,
            })
            .await
            .map_err(|_| anyhow!("tts queue closed"))?;
        Ok(())
    }

    /// Speak a text directly (DirectReply and handler confirmations),
    /// segment by segment. Marks the final segment as terminal.
    async fn speak_text(&mut self, text: &str) -> Result<()> {
        let segments = split_segments(text);
        if segments.is_empty() {
            self.finish_without_speech().await;
            return Ok(());
        }
        let last = segments.len() - 1;
        for (i, segment) in segments.into_iter().enumerate() {
            if i == last {
                self.ctx
                    .state
                    .set_last_text_index((self.segment_index + 1) as i64);
            }
            self.dispatch_segment(segment).await?;
        }
        Ok(())
    }

    async fn dispatch_apology(&mut self) {
        self.ctx.state.set_last_text_index(1);
        let _ = self
            .ctx
            .tts_queue
            .push(TtsItem {
                text: APOLOGY_TEXT.to_string(),
                round: self.round,
                index: 1,
            })
            .await;
    }

    /// Wrap up a turn whose stream ended without a pending tool call.
    async fn finish_content_turn(&mut self, content: &str, processed: usize) -> Result<()> {
        let chars: Vec<char> = content.chars().collect();
        let remaining: String = if processed < chars.len() {
            chars[processed..].iter().collect::<String>().trim().to_string()
        } else {
            String::new()
        };

        if !remaining.is_empty() {
            self.ctx
                .state
                .set_last_text_index((self.segment_index + 1) as i64);
            self.dispatch_segment(remaining).await?;
        } else if self.segment_index > 0 {
            self.ctx
                .state
                .set_last_text_index(self.segment_index as i64);
        } else {
            // Nothing speakable in the whole response
            self.finish_without_speech().await;
        }

        if !content.trim().is_empty() {
            tracing::debug!(
                session_id = %self.ctx.state.session_id,
                round = self.round,
                segments = self.segment_index,
                content = %crate::truncate_safe(content, 120),
                "assistant response complete"
            );
            let mut history = self.ctx.history.lock().await;
            history.append(Message::assistant(content));
            history.keep_recent(self.ctx.config.chat.max_history);

            let (emoji, emotion) = emotion_for(content);
            let _ = self
                .ctx
                .conn
                .write_text(
                    OutboundMessage::emotion(&self.ctx.state.session_id, emoji, emotion).to_text(),
                )
                .await;
        }
        Ok(())
    }

    /// Zero-segment turn: the device is waiting on a `tts stop` that the
    /// egress worker will never send, so send it here.
    async fn finish_without_speech(&mut self) {
        let _ = self
            .ctx
            .conn
            .write_text(OutboundMessage::tts_stop(&self.ctx.state.session_id).to_text())
            .await;
        if self.ctx.state.close_after_chat.load(Ordering::Acquire) {
            self.ctx.conn.close().await;
            self.ctx.shutdown.trigger();
            return;
        }
        self.ctx.state.set_last_text_index(-1);
        if let Err(e) = self.ctx.asr.reset().await {
            tracing::warn!(
                session_id = %self.ctx.state.session_id,
                error = %e,
                "asr reset after empty response failed"
            );
        }
    }

    /// Post-stream tool-call resolution and dispatch.
    async fn resolve_tool_call(
        &mut self,
        mut pending: PendingToolCall,
        content_accum: &str,
    ) -> Result<()> {
        if pending.id.is_empty() {
            // Models that answer with inline call JSON give us no id; dig
            // the call out of the content and mint one
            if let Some(obj) = extract_json_object(content_accum) {
                if let Ok(v) = serde_json::from_str::<Value>(obj) {
                    if pending.name.is_empty() {
                        pending.name = v
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string();
                    }
                    if pending.arguments.trim().is_empty() {
                        pending.arguments = match v.get("arguments") {
                            Some(Value::String(s)) => s.clone(),
                            Some(Value::Null) | None => "{}".to_string(),
                            Some(other) => other.to_string(),
                        };
                    }
                }
            }
            pending.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
        if pending.name.is_empty() {
            tracing::warn!(
                session_id = %self.ctx.state.session_id,
                device_id = %self.ctx.state.device_id,
                "tool call detected but no tool name could be recovered"
            );
            return self.finish_content_turn("", 0).await;
        }

        let args: Value = serde_json::from_str(pending.arguments.trim())
            .unwrap_or_else(|_| json!({}));

        tracing::info!(
            session_id = %self.ctx.state.session_id,
            device_id = %self.ctx.state.device_id,
            tool = %pending.name,
            round = self.round,
            "invoking tool"
        );
        let response = self.ctx.registry.execute(&pending.name, args).await;

        match response {
            ActionResponse::DirectReply(text) => {
                self.speak_text(&text).await?;
                let mut history = self.ctx.history.lock().await;
                history.append(Message::assistant(&text));
                Ok(())
            }
            ActionResponse::CallHandler { name, args } => {
                self.dispatch_handler(&name, args).await
            }
            ActionResponse::ReqLlm(result_text) => {
                let tool_call = ToolCall {
                    id: pending.id.clone(),
                    kind: "function".to_string(),
                    index: 0,
                    function: FunctionCall {
                        name: pending.name.clone(),
                        arguments: pending.arguments.clone(),
                    },
                };
                {
                    let mut history = self.ctx.history.lock().await;
                    history.append(Message::assistant_with_tools("", vec![tool_call]));
                    history.append(Message::tool_result(&pending.id, &result_text));
                }
                self.generate_response().await
            }
            ActionResponse::Error(e) => {
                tracing::error!(
                    session_id = %self.ctx.state.session_id,
                    device_id = %self.ctx.state.device_id,
                    tool = %pending.name,
                    error = %e,
                    "tool invocation failed"
                );
                self.finish_content_turn("", 0).await
            }
            ActionResponse::NotFound => {
                tracing::warn!(
                    session_id = %self.ctx.state.session_id,
                    tool = %pending.name,
                    "tool not found"
                );
                self.finish_content_turn("", 0).await
            }
            ActionResponse::None => self.finish_content_turn("", 0).await,
        }
    }

    /// Named in-process side effects behind `CallHandler`.
    async fn dispatch_handler(&mut self, handler: &str, args: Value) -> Result<()> {
        match handler {
            HANDLER_EXIT => {
                self.ctx
                    .state
                    .close_after_chat
                    .store(true, Ordering::Release);
                self.speak_text("好的，再见，期待下次和你聊天。").await
            }
            HANDLER_CHANGE_VOICE => {
                let voice = args.get("voice").and_then(|v| v.as_str()).unwrap_or("");
                match self.ctx.tts.set_voice(voice).await {
                    Ok(()) => self.speak_text("好的，已经换上新的声音了。").await,
                    Err(e) => {
                        tracing::error!(
                            session_id = %self.ctx.state.session_id,
                            voice,
                            error = %e,
                            "voice change failed"
                        );
                        self.speak_text("换声音失败了，还是用原来的声音吧。").await
                    }
                }
            }
            HANDLER_CHANGE_ROLE => {
                let role = args.get("role").and_then(|v| v.as_str()).unwrap_or("助手");
                let prompt = args
                    .get("prompt")
                    .and_then(|v| v.as_str())
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| format!("你现在扮演{role}，请保持这个角色与用户对话。"));
                self.ctx.history.lock().await.set_system(prompt);
                self.speak_text(&format!("好的，我现在是{role}了。")).await
            }
            HANDLER_PLAY_MUSIC => {
                let Some(file) = args.get("file").and_then(|v| v.as_str()) else {
                    tracing::warn!(session_id = %self.ctx.state.session_id, "play_music without file");
                    self.finish_without_speech().await;
                    return Ok(());
                };
                self.segment_index += 1;
                self.ctx
                    .state
                    .set_last_text_index(self.segment_index as i64);
                self.ctx
                    .egress_queue
                    .push(crate::audio::egress::EgressItem {
                        path: Some(file.into()),
                        text: "播放音乐".to_string(),
                        round: self.round,
                        index: self.segment_index,
                        // user media, never ours to delete
                        cached: true,
                    })
                    .await
                    .map_err(|_| anyhow!("egress queue closed"))?;
                Ok(())
            }
            other => {
                tracing::warn!(
                    session_id = %self.ctx.state.session_id,
                    handler = other,
                    "unknown action handler"
                );
                Ok(())
            }
        }
    }
}
