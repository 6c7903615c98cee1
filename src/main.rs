//! Voicehub - real-time voice assistant server

use voicehub::config::Config;
use voicehub::{pool, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging (INFO by default, RUST_LOG overrides)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    pool::register_builtin_factories();
    server::start(config).await
}
