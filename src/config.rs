use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::SyncSettings;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// `unix:///path/to/docker.sock` or `tcp://host:port`; local defaults
    /// (including `DOCKER_HOST`) when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    pub debounce_ms: u64,
    /// Upper bound on how long a continuous event burst can delay a rebuild.
    pub max_debounce_ms: u64,
    pub retry_ms: u64,
    /// Only list running containers that are healthy or have no health check.
    pub filter_health: bool,
    pub cache_addresses: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_host: None,
            debounce_ms: 100,
            max_debounce_ms: 1000,
            retry_ms: 500,
            filter_health: true,
            cache_addresses: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("docker-upstreams.toml"))
                .merge(Json::file("docker-upstreams.json"))
                .merge(Env::prefixed("DOCKER_UPSTREAMS_")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.debounce_ms == 0 {
            anyhow::bail!("debounce_ms must be greater than zero");
        }
        if config.retry_ms == 0 {
            anyhow::bail!("retry_ms must be greater than zero");
        }
        if config.max_debounce_ms < config.debounce_ms {
            anyhow::bail!("max_debounce_ms must be at least debounce_ms");
        }

        Ok(config)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            max_debounce: Duration::from_millis(self.max_debounce_ms),
            retry_interval: Duration::from_millis(self.retry_ms),
            cache_addresses: self.cache_addresses,
        }
    }
}
