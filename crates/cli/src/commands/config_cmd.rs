//! `parley config` — Show configuration.

use anyhow::Context;
use parley_config::AppConfig;

pub fn run(defaults: bool) -> anyhow::Result<()> {
    if defaults {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let mut config = AppConfig::load().context("Failed to load config")?;
    if config.api_key.is_some() {
        config.api_key = Some("[REDACTED]".into());
    }

    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
