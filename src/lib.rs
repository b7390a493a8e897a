pub mod api;
pub mod catalog;
pub mod downloader;
pub mod gallery;
pub mod generator;
pub mod model;
pub mod preview;

use anyhow::{anyhow, Context};
use directories;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{debug, info};

pub use api::{ApiError, Backend};
pub use generator::{Generator, GeneratorForm};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
const ENV_PREFIX: &str = "IMAGEGEN_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub download_dir: PathBuf,
    pub poll_interval_secs: u64,
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.join("imagegen")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            download_dir: default_download_dir(),
            poll_interval_secs: gallery::POLL_INTERVAL.as_secs(),
        }
    }
}

impl Config {
    /// Reads `IMAGEGEN_*` variables, after loading an optional `.env` file.
    #[tracing::instrument]
    pub fn from_env() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {}", path.to_string_lossy()),
            Err(e) => debug!("No .env file loaded: {e}"),
        }
        let config = envy::prefixed(ENV_PREFIX)
            .from_env::<Config>()
            .context("Failed to read configuration from the environment")?;
        let config = config.normalized()?;
        info!("Using backend at {}", config.backend_url);
        Ok(config)
    }

    pub fn with_backend_url(mut self, backend_url: impl Into<String>) -> anyhow::Result<Self> {
        self.backend_url = backend_url.into();
        self.normalized()
    }

    fn normalized(mut self) -> anyhow::Result<Self> {
        let trimmed = self.backend_url.trim().trim_end_matches('/');
        if !trimmed.starts_with("http") {
            return Err(anyhow!(
                "Invalid backend url '{}'; make sure it starts with http",
                self.backend_url
            ));
        }
        self.backend_url = trimmed.to_string();
        if self.poll_interval_secs == 0 {
            self.poll_interval_secs = gallery::POLL_INTERVAL.as_secs();
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Model families the marketplace search and download endpoints understand.
#[derive(
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
    Serialize,
    Deserialize,
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
pub enum MarketplaceType {
    #[default]
    Checkpoint,
    #[strum(to_string = "LoRA", serialize = "Lora", serialize = "lora")]
    #[serde(rename = "LoRA")]
    Lora,
    Embeddings,
    #[strum(to_string = "VAE", serialize = "Vae", serialize = "vae")]
    #[serde(rename = "VAE")]
    Vae,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn marketplace_type_uses_wire_spelling() {
        assert_eq!(MarketplaceType::Lora.as_ref(), "LoRA");
        assert_eq!(MarketplaceType::Vae.to_string(), "VAE");
        assert_eq!(
            MarketplaceType::from_str("lora").unwrap(),
            MarketplaceType::Lora
        );
        assert_eq!(
            serde_json::to_string(&MarketplaceType::Lora).unwrap(),
            "\"LoRA\""
        );
        assert_eq!(MarketplaceType::iter().count(), 4);
    }

    #[test]
    fn backend_url_is_trimmed() {
        let config = Config::default()
            .with_backend_url(" http://127.0.0.1:8000/ ")
            .unwrap();
        assert_eq!(config.backend_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn backend_url_without_scheme_is_rejected() {
        assert!(Config::default().with_backend_url("localhost:8000").is_err());
    }

    #[test]
    fn default_poll_interval_is_three_seconds() {
        assert_eq!(Config::default().poll_interval(), Duration::from_secs(3));
    }
}
