//! Resource pool: pre-built provider sets checked out per connection.
//!
//! Providers are resolved by name through process-global factory
//! registries, initialized once at startup. The expensive MCP subprocess
//! clients are started once and shared; a checked-out set only binds them
//! to the live session.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use thiserror::Error;

use crate::asr::AsrProvider;
use crate::config::{
    AsrProviderConfig, Config, LlmProviderConfig, TtsProviderConfig, VllmProviderConfig,
};
use crate::llm::openai::{OpenAiLlm, OpenAiVision};
use crate::llm::LlmProvider;
use crate::mcp::manager::McpManager;
use crate::mcp::stdio::StdioMcpClient;
use crate::tts::TtsProvider;
use crate::vision::VisionProvider;

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every set is checked out; the caller must close the connection.
    #[error("provider pool exhausted")]
    Exhausted,
}

pub type AsrFactory =
    Arc<dyn Fn(&AsrProviderConfig) -> Result<Arc<dyn AsrProvider>> + Send + Sync>;
pub type LlmFactory =
    Arc<dyn Fn(&LlmProviderConfig) -> Result<Arc<dyn LlmProvider>> + Send + Sync>;
pub type TtsFactory =
    Arc<dyn Fn(&TtsProviderConfig) -> Result<Arc<dyn TtsProvider>> + Send + Sync>;
pub type VllmFactory =
    Arc<dyn Fn(&VllmProviderConfig) -> Result<Arc<dyn VisionProvider>> + Send + Sync>;

static ASR_FACTORIES: Lazy<RwLock<HashMap<String, AsrFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static LLM_FACTORIES: Lazy<RwLock<HashMap<String, LlmFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static TTS_FACTORIES: Lazy<RwLock<HashMap<String, TtsFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static VLLM_FACTORIES: Lazy<RwLock<HashMap<String, VllmFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_asr_factory(name: &str, factory: AsrFactory) {
    ASR_FACTORIES
        .write()
        .expect("factory registry poisoned")
        .insert(name.to_string(), factory);
}

pub fn register_llm_factory(name: &str, factory: LlmFactory) {
    LLM_FACTORIES
        .write()
        .expect("factory registry poisoned")
        .insert(name.to_string(), factory);
}

pub fn register_tts_factory(name: &str, factory: TtsFactory) {
    TTS_FACTORIES
        .write()
        .expect("factory registry poisoned")
        .insert(name.to_string(), factory);
}

pub fn register_vllm_factory(name: &str, factory: VllmFactory) {
    VLLM_FACTORIES
        .write()
        .expect("factory registry poisoned")
        .insert(name.to_string(), factory);
}

/// Register the provider implementations that ship with the crate.
/// Vendor ASR/TTS backends register themselves through the factory
/// functions above before `ResourcePool::init` runs.
pub fn register_builtin_factories() {
    register_llm_factory(
        "openai",
        Arc::new(|config| Ok(Arc::new(OpenAiLlm::new(config)) as Arc<dyn LlmProvider>)),
    );
    register_vllm_factory(
        "openai",
        Arc::new(|config| Ok(Arc::new(OpenAiVision::new(config)) as Arc<dyn VisionProvider>)),
    );
}

/// One session's worth of providers.
pub struct ProviderSet {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub vllm: Option<Arc<dyn VisionProvider>>,
    pub mcp: Arc<McpManager>,
}

pub struct ResourcePool {
    sets: StdMutex<Vec<ProviderSet>>,
    shared_mcp: Arc<Vec<Arc<StdioMcpClient>>>,
}

impl ResourcePool {
    /// Build the pool: start the shared MCP subprocesses, then construct
    /// `pool.size` provider sets from the configured factories. Any factory
    /// failure aborts startup.
    pub async fn init(config: &Config) -> Result<Self> {
        let mut shared = Vec::new();
        for server in &config.mcp.servers {
            match StdioMcpClient::connect(&server.name, &server.command, &server.args).await {
                Ok(client) => shared.push(Arc::new(client)),
                Err(e) => {
                    tracing::error!(server = %server.name, error = %e, "mcp server startup failed");
                    return Err(e);
                }
            }
        }
        let shared_mcp = Arc::new(shared);

        let asr_factory = lookup(&ASR_FACTORIES, &config.providers.asr.provider, "asr")?;
        let llm_factory = lookup(&LLM_FACTORIES, &config.providers.llm.provider, "llm")?;
        let tts_factory = lookup(&TTS_FACTORIES, &config.providers.tts.provider, "tts")?;
        let vllm_factory = if config.providers.vllm.enabled {
            Some(lookup(&VLLM_FACTORIES, &config.providers.vllm.provider, "vllm")?)
        } else {
            None
        };

        let mut sets = Vec::with_capacity(config.pool.size);
        for _ in 0..config.pool.size {
            sets.push(ProviderSet {
                asr: asr_factory(&config.providers.asr)
                    .context("asr provider construction failed")?,
                llm: llm_factory(&config.providers.llm)
                    .context("llm provider construction failed")?,
                tts: tts_factory(&config.providers.tts)
                    .context("tts provider construction failed")?,
                vllm: match &vllm_factory {
                    Some(factory) => Some(
                        factory(&config.providers.vllm)
                            .context("vllm provider construction failed")?,
                    ),
                    None => None,
                },
                mcp: Arc::new(McpManager::new(shared_mcp.clone())),
            });
        }
        tracing::info!(size = sets.len(), "provider pool ready");

        Ok(Self {
            sets: StdMutex::new(sets),
            shared_mcp,
        })
    }

    pub fn checkout(&self) -> Result<ProviderSet, PoolError> {
        self.sets
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .ok_or(PoolError::Exhausted)
    }

    /// Return a set. Connection-bound state is reset best-effort; a
    /// provider stuck in an error state must not block the return.
    pub async fn give_back(&self, set: ProviderSet) {
        set.mcp.unbind();
        if let Err(e) = set.asr.reset().await {
            tracing::warn!(error = %e, "asr reset on pool return failed");
        }
        self.sets.lock().expect("pool lock poisoned").push(set);
    }

    pub fn available(&self) -> usize {
        self.sets.lock().expect("pool lock poisoned").len()
    }

    /// Kill the shared subprocess clients. Process shutdown only.
    pub async fn shutdown(&self) {
        for client in self.shared_mcp.iter() {
            client.shutdown().await;
        }
    }
}

fn lookup<F: Clone>(
    registry: &Lazy<RwLock<HashMap<String, F>>>,
    name: &str,
    kind: &str,
) -> Result<F> {
    registry
        .read()
        .expect("factory registry poisoned")
        .get(name)
        .cloned()
        .with_context(|| format!("no {kind} provider factory registered under {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::AsrListener;
    use crate::config::PoolConfig;
    use crate::llm::{LlmStream, ToolDefinition};
    use crate::tts::TtsVoiceInfo;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FakeAsr;

    #[async_trait]
    impl AsrProvider for FakeAsr {
        async fn add_audio(&self, _data: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
        fn set_listener(&self, _listener: Arc<dyn AsrListener>) {}
        async fn finalize(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeLlm;

    #[async_trait]
    impl LlmProvider for FakeLlm {
        async fn stream_with_tools(
            &self,
            _session_id: &str,
            _messages: Vec<crate::dialogue::Message>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<LlmStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    struct FakeTts;

    #[async_trait]
    impl crate::tts::TtsProvider for FakeTts {
        async fn synthesize(&self, _text: &str) -> Result<PathBuf> {
            Ok(PathBuf::from("/dev/null"))
        }
        async fn set_voice(&self, _voice: &str) -> Result<()> {
            Ok(())
        }
        fn voice_info(&self) -> TtsVoiceInfo {
            TtsVoiceInfo {
                provider: "fake".to_string(),
                voice: "v".to_string(),
            }
        }
    }

    fn register_fakes(tag: &str) {
        register_asr_factory(tag, Arc::new(|_| Ok(Arc::new(FakeAsr) as _)));
        register_llm_factory(tag, Arc::new(|_| Ok(Arc::new(FakeLlm) as _)));
        register_tts_factory(tag, Arc::new(|_| Ok(Arc::new(FakeTts) as _)));
    }

    fn pool_config(tag: &str, size: usize) -> Config {
        let mut config = Config::default();
        config.providers.asr.provider = tag.to_string();
        config.providers.llm.provider = tag.to_string();
        config.providers.tts.provider = tag.to_string();
        config.pool = PoolConfig { size };
        config
    }

    #[tokio::test]
    async fn test_checkout_and_give_back() {
        register_fakes("fake-pool-a");
        let pool = ResourcePool::init(&pool_config("fake-pool-a", 2)).await.unwrap();
        assert_eq!(pool.available(), 2);

        let set = pool.checkout().unwrap();
        assert_eq!(pool.available(), 1);
        pool.give_back(set).await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        register_fakes("fake-pool-b");
        let pool = ResourcePool::init(&pool_config("fake-pool-b", 1)).await.unwrap();
        let _held = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(PoolError::Exhausted)));
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_init() {
        register_fakes("fake-pool-c");
        let mut config = pool_config("fake-pool-c", 1);
        config.providers.llm.provider = "no-such-provider".to_string();
        assert!(ResourcePool::init(&config).await.is_err());
    }
}
