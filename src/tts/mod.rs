//! TTS pipeline: speakable text segments in, synthesized audio files out.
//!
//! A single consumer task pops `(text, round, index)` items in FIFO order,
//! so segments reach the egress queue in exactly the order the LLM produced
//! them. Synthesis failures and sanitized-to-empty segments still forward a
//! sentinel item; the index sequence must stay dense for the egress side's
//! terminal-segment bookkeeping.

pub mod cache;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::audio::egress::EgressItem;
use crate::queue::BoundedQueue;
use crate::session::SessionState;
use cache::QuickReplyCache;

/// Synthesis input is capped at this many characters.
pub const MAX_TTS_CHARS: usize = 255;

/// Synthesis work queue capacity.
pub const TTS_QUEUE_SIZE: usize = 100;

/// One segment of work for the synthesis queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsItem {
    pub text: String,
    pub round: u64,
    pub index: u32,
}

/// Voice metadata reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsVoiceInfo {
    pub provider: String,
    pub voice: String,
}

/// Text-to-speech backend: text in, audio file on disk out.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<PathBuf>;

    /// Switch the active voice. Takes effect from the next synthesis.
    async fn set_voice(&self, voice: &str) -> Result<()>;

    fn voice_info(&self) -> TtsVoiceInfo;
}

static MARKDOWN_SYNTAX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\*\*|__|~~|`{1,3}|^#{1,6}\s+|^\s*[-*+]\s+|^\s*\d+\.\s+|>\s+)").unwrap()
});
static MARKDOWN_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());

/// Strip emoji and Markdown decoration so the synthesizer only sees
/// speakable text.
pub fn sanitize_for_speech(text: &str) -> String {
    let no_links = MARKDOWN_LINK.replace_all(text, "$1");
    let no_markdown = MARKDOWN_SYNTAX.replace_all(&no_links, "");
    no_markdown.chars().filter(|c| !is_emoji(*c)).collect::<String>().trim().to_string()
}

fn is_emoji(c: char) -> bool {
    matches!(c,
        '\u{1F000}'..='\u{1FAFF}'   // pictographs, emoticons, symbols
        | '\u{2600}'..='\u{27BF}'   // misc symbols + dingbats
        | '\u{2B00}'..='\u{2BFF}'   // arrows and stars
        | '\u{FE00}'..='\u{FE0F}'   // variation selectors
        | '\u{200D}'                // zero-width joiner
    )
}

/// Cap text at `MAX_TTS_CHARS` characters.
pub fn truncate_for_speech(text: &str) -> String {
    text.chars().take(MAX_TTS_CHARS).collect()
}

/// The single TTS consumer. Exits when the work queue closes.
pub async fn run_tts_worker(
    state: Arc<SessionState>,
    provider: Arc<dyn TtsProvider>,
    queue: Arc<BoundedQueue<TtsItem>>,
    egress: Arc<BoundedQueue<EgressItem>>,
    cache: Option<Arc<QuickReplyCache>>,
    quick_words: Vec<String>,
) {
    while let Some(item) = queue.pop().await {
        let out = process_item(&state, provider.as_ref(), cache.as_deref(), &quick_words, item).await;
        if egress.push(out).await.is_err() {
            break;
        }
    }
    tracing::debug!(session_id = %state.session_id, "tts worker stopped");
}

async fn process_item(
    state: &SessionState,
    provider: &dyn TtsProvider,
    cache: Option<&QuickReplyCache>,
    quick_words: &[String],
    item: TtsItem,
) -> EgressItem {
    let is_quick_reply = quick_words.iter().any(|w| w == &item.text);

    if is_quick_reply {
        if let Some(path) = cache.and_then(|c| c.lookup(&item.text)) {
            tracing::debug!(session_id = %state.session_id, text = %item.text, "quick-reply cache hit");
            return EgressItem {
                path: Some(path),
                text: item.text,
                round: item.round,
                index: item.index,
                cached: true,
            };
        }
    }

    let clean = sanitize_for_speech(&item.text);
    if clean.is_empty() {
        return EgressItem::sentinel(item.text, item.round, item.index);
    }
    let clean = truncate_for_speech(&clean);

    let path = match provider.synthesize(&clean).await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(
                session_id = %state.session_id,
                device_id = %state.device_id,
                error = %e,
                "tts synthesis failed"
            );
            return EgressItem::sentinel(item.text, item.round, item.index);
        }
    };

    if is_quick_reply {
        if let Some(cache) = cache {
            if let Err(e) = cache.store(&item.text, &path) {
                tracing::warn!(session_id = %state.session_id, error = %e, "quick-reply cache store failed");
            }
        }
    }

    if state.server_voice_stop.load(Ordering::Acquire) {
        // the freshly written file is never the shared cache copy
        if cache.map(|c| !c.contains(&path)).unwrap_or(true) {
            let _ = std::fs::remove_file(&path);
        }
        return EgressItem::sentinel(item.text, item.round, item.index);
    }

    EgressItem {
        path: Some(path),
        text: item.text,
        round: item.round,
        index: item.index,
        cached: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_emoji() {
        assert_eq!(sanitize_for_speech("你好😀！"), "你好！");
        assert_eq!(sanitize_for_speech("☀️今天晴天"), "今天晴天");
    }

    #[test]
    fn test_sanitize_strips_markdown() {
        assert_eq!(sanitize_for_speech("**加粗** 和 `代码`"), "加粗 和 代码");
        assert_eq!(sanitize_for_speech("[链接](http://x.cn)文本"), "链接文本");
    }

    #[test]
    fn test_sanitize_emoji_only_is_empty() {
        assert_eq!(sanitize_for_speech("😀🎉"), "");
    }

    #[test]
    fn test_truncate_at_255_chars() {
        let long: String = "啊".repeat(300);
        let truncated = truncate_for_speech(&long);
        assert_eq!(truncated.chars().count(), MAX_TTS_CHARS);
    }

    #[test]
    fn test_short_text_untouched() {
        assert_eq!(truncate_for_speech("短句。"), "短句。");
    }
}
