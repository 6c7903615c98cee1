//! Quick-reply audio cache.
//!
//! Short canned phrases ("我在", "在呢") are synthesized once per
//! `(provider, voice)` pair and replayed from disk afterwards, so wakeword
//! greetings cost no synthesis round-trip. Reads are lockless; writes skip
//! files that already exist, which makes concurrent sessions safe by
//! filename uniqueness.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Default cache directory, relative to the working directory.
pub const CACHE_DIR: &str = "wake_replay";

#[derive(Debug, Clone)]
pub struct QuickReplyCache {
    dir: PathBuf,
    provider: String,
    voice: String,
}

impl QuickReplyCache {
    pub fn new(dir: impl Into<PathBuf>, provider: &str, voice: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create quick-reply cache dir {}", dir.display()))?;
        Ok(Self {
            dir,
            provider: provider.to_string(),
            voice: voice.to_string(),
        })
    }

    /// Cache key: `<sanitized_text>_<provider>_<voice>.mp3`
    fn path_for(&self, text: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.mp3",
            sanitize_filename(text),
            self.provider,
            self.voice
        ))
    }

    /// Full path on hit, `None` on miss.
    pub fn lookup(&self, text: &str) -> Option<PathBuf> {
        let path = self.path_for(text);
        path.exists().then_some(path)
    }

    /// Copy a freshly synthesized file into the cache. Skipped when the
    /// target already exists (another session won the race).
    pub fn store(&self, text: &str, synthesized: &Path) -> Result<PathBuf> {
        let target = self.path_for(text);
        if !target.exists() {
            std::fs::copy(synthesized, &target).with_context(|| {
                format!(
                    "failed to copy {} into quick-reply cache",
                    synthesized.display()
                )
            })?;
        }
        Ok(target)
    }

    /// Whether `path` points into this cache.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
    }
}

/// Keep filenames portable: CJK and alphanumerics pass through, everything
/// path-hostile becomes `_`.
fn sanitize_filename(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c
            } else {
                '_'
            }
        })
        .collect()
}
