use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::warn;

use crate::queue::{QueueConfig, DEFAULT_MAX_CONCURRENT, MAX_CONCURRENT_LIMIT};

/// Service settings, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    pub server_url: String,
    pub token: String,
    pub max_concurrent: usize,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_url = get("EMBY_URL")
            .context("EMBY_URL must be set")?
            .trim_end_matches('/')
            .to_string();
        let token = get("EMBY_TOKEN").context("EMBY_TOKEN must be set")?;

        let max_concurrent = match get("TAG_MAX_CONCURRENT") {
            Some(raw) => {
                let requested: usize = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("TAG_MAX_CONCURRENT must be a number, got {:?}", raw))?;
                let clamped = requested.clamp(1, MAX_CONCURRENT_LIMIT);
                if clamped != requested {
                    warn!("TAG_MAX_CONCURRENT={} out of range, using {}", requested, clamped);
                }
                clamped
            }
            None => DEFAULT_MAX_CONCURRENT,
        };

        let port = get("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .trim()
            .parse()
            .context("PORT must be a number")?;

        Ok(Self {
            server_url,
            token,
            max_concurrent,
            port,
        })
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig::default().with_max_concurrent(self.max_concurrent)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}
