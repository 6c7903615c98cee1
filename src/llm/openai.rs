//! OpenAI-compatible streaming chat provider.
//!
//! Works against any endpoint speaking the `/chat/completions` SSE dialect.
//! The SSE parsing is done by hand over the byte stream; events are split on
//! blank lines and `data:` payloads are decoded per delta.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::LlmProviderConfig;
use crate::dialogue::{Message, Role};
use crate::llm::{LlmProvider, LlmResponse, LlmStream, ToolCallDelta, ToolDefinition};

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

/// Chat-completions message shape. `content` stays present-but-empty for
/// assistant tool-call messages, which some backends require.
#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<crate::llm::ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role,
            content: m.content,
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(m.tool_calls)
            },
            tool_call_id: m.tool_call_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

pub struct OpenAiLlm {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiLlm {
    pub fn new(config: &LlmProviderConfig) -> Self {
        Self {
            client: Arc::new(Client::new()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    async fn stream_with_tools(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> Result<LlmStream> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.into_iter().map(WireMessage::from).collect(),
            stream: true,
            max_tokens: self.max_tokens,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice: None,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("failed to send streaming request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM streaming API error ({status}): {body}");
        }

        tracing::debug!(session_id, model = %self.model, "LLM stream opened");
        Ok(sse_stream(response.bytes_stream().boxed()))
    }
}

/// OpenAI-compatible streaming vision provider: same SSE dialect, with the
/// image attached as a data-URL content part on the final user message.
pub struct OpenAiVision {
    client: Arc<Client>,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiVision {
    pub fn new(config: &crate::config::VllmProviderConfig) -> Self {
        Self {
            client: Arc::new(Client::new()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

/// History plus one multimodal user turn, in chat-completions form.
fn vision_messages(messages: &[Message], image_data: &str, text: &str) -> Vec<Value> {
    let mut wire: Vec<Value> = messages
        .iter()
        .filter(|m| matches!(m.role, Role::System | Role::User | Role::Assistant))
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::Assistant => "assistant",
                _ => "user",
            };
            serde_json::json!({"role": role, "content": m.content})
        })
        .collect();
    wire.push(serde_json::json!({
        "role": "user",
        "content": [
            {"type": "text", "text": text},
            {"type": "image_url",
             "image_url": {"url": format!("data:image/jpeg;base64,{image_data}")}}
        ]
    }));
    wire
}

#[async_trait]
impl crate::vision::VisionProvider for OpenAiVision {
    async fn stream_with_image(
        &self,
        session_id: &str,
        messages: Vec<Message>,
        image_data: &str,
        text: &str,
    ) -> Result<BoxStream<'static, String>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": vision_messages(&messages, image_data, text),
            "stream": true,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("failed to send streaming request to vision provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("vision streaming API error ({status}): {body}");
        }

        tracing::debug!(session_id, model = %self.model, "vision stream opened");
        Ok(sse_stream(response.bytes_stream().boxed())
            .filter_map(|delta| async move { delta.content })
            .boxed())
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
    pending: VecDeque<LlmResponse>,
    done: bool,
}

/// Turn the raw SSE byte stream into a stream of response deltas.
fn sse_stream(bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>) -> LlmStream {
    let state = SseState {
        bytes,
        buffer: String::new(),
        pending: VecDeque::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    // SSE events are separated by a blank line
                    while let Some(pos) = st.buffer.find("\n\n") {
                        let event = st.buffer[..pos].to_string();
                        st.buffer.drain(..pos + 2);
                        for line in event.lines() {
                            if let Some(data) = line.strip_prefix("data: ") {
                                if data == "[DONE]" {
                                    st.done = true;
                                    continue;
                                }
                                if let Some(resp) = parse_data_line(data) {
                                    st.pending.push_back(resp);
                                }
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    st.pending.push_back(LlmResponse {
                        error: Some(format!("stream transport error: {e}")),
                        ..Default::default()
                    });
                }
                None => st.done = true,
            }
        }
    })
    .boxed()
}

fn parse_data_line(data: &str) -> Option<LlmResponse> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparseable SSE data line");
            return None;
        }
    };
    if let Some(err) = chunk.error {
        return Some(LlmResponse {
            error: Some(err.to_string()),
            ..Default::default()
        });
    }
    let choice = chunk.choices.into_iter().next()?;
    if choice.delta.content.is_none() && choice.delta.tool_calls.is_none() {
        return None;
    }
    Some(LlmResponse {
        content: choice.delta.content,
        tool_calls: choice.delta.tool_calls,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_stream(parts: Vec<&'static str>) -> BoxStream<'static, reqwest::Result<bytes::Bytes>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(bytes::Bytes::from(p)))).boxed()
    }

    #[tokio::test]
    async fn test_sse_content_deltas() {
        let stream = sse_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"！\"}}]}\n\ndata: [DONE]\n\n",
        ]));
        let items: Vec<LlmResponse> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content.as_deref(), Some("你好"));
        assert_eq!(items[1].content.as_deref(), Some("！"));
    }

    #[tokio::test]
    async fn test_sse_event_split_across_chunks() {
        let stream = sse_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"con",
            "tent\":\"abc\"}}]}\n\n",
        ]));
        let items: Vec<LlmResponse> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_sse_tool_call_fragments() {
        let stream = sse_stream(byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_9\",\"function\":{\"name\":\"get_time\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{}\"}}]}}]}\n\n",
        ]));
        let items: Vec<LlmResponse> = stream.collect().await;
        assert_eq!(items.len(), 2);
        let first = items[0].tool_calls.as_ref().unwrap();
        assert_eq!(first[0].id.as_deref(), Some("call_9"));
        assert_eq!(first[0].function.name.as_deref(), Some("get_time"));
        let second = items[1].tool_calls.as_ref().unwrap();
        assert_eq!(second[0].function.arguments.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_sse_provider_error_surfaced() {
        let stream = sse_stream(byte_stream(vec![
            "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
        ]));
        let items: Vec<LlmResponse> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].error.as_ref().unwrap().contains("overloaded"));
    }

    #[test]
    fn test_vision_messages_attach_image_last() {
        let history = vec![
            Message::system("你是助手"),
            Message::user("之前的问题"),
            Message::assistant("之前的回答"),
        ];
        let wire = vision_messages(&history, "QUJD", "这是什么？");
        assert_eq!(wire.len(), 4);
        let last = wire.last().unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"][0]["text"], "这是什么？");
        assert_eq!(
            last["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn test_wire_message_keeps_empty_content_for_tool_calls() {
        let msg = Message::assistant_with_tools(
            "",
            vec![crate::llm::ToolCall {
                id: "c1".to_string(),
                kind: "function".to_string(),
                index: 0,
                function: crate::llm::FunctionCall {
                    name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        let wire = WireMessage::from(msg);
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["content"], "");
        assert_eq!(v["tool_calls"][0]["type"], "function");
    }
}
