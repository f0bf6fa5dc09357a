//! `parley serve` — Start the HTTP gateway.

use anyhow::Context;
use parley_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = AppConfig::load().context("Failed to load config")?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    if !config.has_api_key() {
        eprintln!(
            "  Note: no API key configured. Set PARLEY_API_KEY or OPENAI_API_KEY, or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
    }

    println!("Parley gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {} ({})", config.model, config.provider);
    println!("   Store:     {:?}", config.store.backend);

    parley_gateway::start(config).await?;

    Ok(())
}
