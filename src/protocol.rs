//! Wire protocol between device and server.
//!
//! Text frames are UTF-8 JSON tagged by a `type` field; binary frames are
//! opaque audio (Opus packets or raw 16-bit LE PCM). This module only
//! defines the message shapes; routing lives in `session::handlers`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// Negotiated audio parameters, mirrored in both hello messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 24000,
            channels: 1,
            frame_duration: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
    Realtime,
}

/// Messages the device sends to the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
        #[serde(default)]
        features: Option<Value>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        #[serde(default)]
        text: Option<String>,
        /// Base64 image payload for single-shot vision turns
        #[serde(default)]
        image: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Chat {
        text: String,
    },
    Iot {
        #[serde(default)]
        descriptors: Option<Value>,
        #[serde(default)]
        states: Option<Value>,
    },
    Vision {
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        payload: Option<Value>,
    },
    Image {
        /// Base64-encoded image data
        image: String,
        #[serde(default)]
        text: Option<String>,
    },
    Mcp {
        payload: Value,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// The frame was not JSON, or had no string `type` field.
    #[error("not a protocol message")]
    NotJson,
    /// Valid JSON with a `type` we do not handle.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// Known type but the payload did not match its schema.
    #[error("bad {kind:?} payload: {source}")]
    BadPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "hello", "listen", "abort", "chat", "iot", "vision", "image", "mcp",
];

/// Parse an inbound text frame, distinguishing garbage (echoed back to the
/// client) from unknown types (logged, connection stays alive).
pub fn parse_inbound(raw: &str) -> Result<InboundMessage, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ParseError::NotJson)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ParseError::NotJson)?
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ParseError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| ParseError::BadPayload { kind, source })
}

/// TTS lifecycle states sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// Messages the server sends to the device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Hello {
        version: u32,
        transport: String,
        session_id: String,
        audio_params: AudioParams,
    },
    Stt {
        text: String,
        session_id: String,
    },
    Tts {
        state: TtsState,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_codec: Option<String>,
    },
    Llm {
        text: String,
        emotion: String,
        session_id: String,
    },
    Mcp {
        session_id: String,
        payload: Value,
    },
}

impl OutboundMessage {
    pub fn hello(session_id: &str, audio_params: AudioParams) -> Self {
        Self::Hello {
            version: PROTOCOL_VERSION,
            transport: "websocket".to_string(),
            session_id: session_id.to_string(),
            audio_params,
        }
    }

    pub fn stt(session_id: &str, text: &str) -> Self {
        Self::Stt {
            text: text.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn tts_start(session_id: &str) -> Self {
        Self::Tts {
            state: TtsState::Start,
            session_id: session_id.to_string(),
            text: None,
            index: None,
            audio_codec: None,
        }
    }

    pub fn tts_stop(session_id: &str) -> Self {
        Self::Tts {
            state: TtsState::Stop,
            session_id: session_id.to_string(),
            text: None,
            index: None,
            audio_codec: None,
        }
    }

    pub fn sentence_start(session_id: &str, text: &str, index: u32, codec: &str) -> Self {
        Self::Tts {
            state: TtsState::SentenceStart,
            session_id: session_id.to_string(),
            text: Some(text.to_string()),
            index: Some(index),
            audio_codec: Some(codec.to_string()),
        }
    }

    pub fn sentence_end(session_id: &str, text: &str, index: u32) -> Self {
        Self::Tts {
            state: TtsState::SentenceEnd,
            session_id: session_id.to_string(),
            text: Some(text.to_string()),
            index: Some(index),
            audio_codec: None,
        }
    }

    pub fn emotion(session_id: &str, emoji: &str, emotion: &str) -> Self {
        Self::Llm {
            text: emoji.to_string(),
            emotion: emotion.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn mcp(session_id: &str, payload: Value) -> Self {
        Self::Mcp {
            session_id: session_id.to_string(),
            payload,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let raw = r#"{"type":"hello","version":1,"transport":"websocket",
            "audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#;
        match parse_inbound(raw).unwrap() {
            InboundMessage::Hello { audio_params, .. } => {
                let p = audio_params.unwrap();
                assert_eq!(p.format, "opus");
                assert_eq!(p.sample_rate, 16000);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_listen_detect_with_text() {
        let raw = r#"{"type":"listen","state":"detect","text":"你好小智"}"#;
        match parse_inbound(raw).unwrap() {
            InboundMessage::Listen { state, text, .. } => {
                assert_eq!(state, ListenState::Detect);
                assert_eq!(text.as_deref(), Some("你好小智"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = parse_inbound(r#"{"type":"telemetry","cpu":42}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnknownType(t) if t == "telemetry"));
    }

    #[test]
    fn test_parse_non_json_frame() {
        assert!(matches!(parse_inbound("hello there"), Err(ParseError::NotJson)));
        // JSON without a type tag is also treated as passthrough text
        assert!(matches!(parse_inbound(r#"{"text":"hi"}"#), Err(ParseError::NotJson)));
    }

    #[test]
    fn test_tts_frame_shape() {
        let msg = OutboundMessage::sentence_start("s1", "你好！", 1, "opus");
        let v: Value = serde_json::from_str(&msg.to_text()).unwrap();
        assert_eq!(v["type"], "tts");
        assert_eq!(v["state"], "sentence_start");
        assert_eq!(v["index"], 1);
        assert_eq!(v["audio_codec"], "opus");
    }

    #[test]
    fn test_tts_stop_omits_optionals() {
        let v: Value = serde_json::from_str(&OutboundMessage::tts_stop("s1").to_text()).unwrap();
        assert_eq!(v["state"], "stop");
        assert!(v.get("text").is_none());
        assert!(v.get("index").is_none());
    }

    #[test]
    fn test_listen_mode_default() {
        assert_eq!(ListenMode::default(), ListenMode::Auto);
    }
}
