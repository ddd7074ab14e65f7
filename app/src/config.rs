use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub content_api_base: String,
    #[serde(default)]
    pub content_api_key: Option<String>,
    #[serde(default)]
    pub player_fallback_base: Option<String>,
    pub api_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub embed_timeout_secs: u64,
}

impl Config {
    pub fn new() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = ConfigBuilder::builder()
            .set_default("database_url", "sqlite://./streamshelf.db")?
            .set_default("port", 3000u16)?
            .set_default("api_timeout_secs", 30u64)?
            .set_default("stream_timeout_secs", 9u64)?
            .set_default("embed_timeout_secs", 15u64)?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("STREAMSHELF"));

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database_url", url)?;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok()) {
            builder = builder.set_override("port", port)?;
        }

        let config: Config = builder.build()?.try_deserialize().map_err(|err| {
            anyhow::anyhow!(
                "invalid configuration ({}); STREAMSHELF_CONTENT_API_BASE must be set",
                err
            )
        })?;
        config.validate()
    }

    fn validate(mut self) -> anyhow::Result<Self> {
        if self.content_api_base.trim().is_empty() {
            anyhow::bail!("content_api_base must not be empty");
        }
        self.content_api_key = self.content_api_key.filter(|k| !k.trim().is_empty());
        self.player_fallback_base = self.player_fallback_base.filter(|b| !b.trim().is_empty());
        if self.stream_timeout_secs == 0 || self.embed_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        Ok(self)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            port: 3000,
            content_api_base: "https://api.example.org".to_string(),
            content_api_key: Some("  ".to_string()),
            player_fallback_base: Some(String::new()),
            api_timeout_secs: 30,
            stream_timeout_secs: 9,
            embed_timeout_secs: 15,
        }
    }

    #[test]
    fn validation_normalizes_blank_optionals() {
        let config = sample().validate().unwrap();
        assert_eq!(config.content_api_key, None);
        assert_eq!(config.player_fallback_base, None);
        assert_eq!(config.stream_timeout(), Duration::from_secs(9));
    }

    #[test]
    fn validation_rejects_missing_base_and_zero_timeouts() {
        let mut config = sample();
        config.content_api_base = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.embed_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
