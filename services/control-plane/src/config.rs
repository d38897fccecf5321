use std::time::Duration;

use anyhow::{Context, Result};
use capsched_capacity::Settings;

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub recompute_interval: Duration,
    pub database: DbConfig,
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level =
            std::env::var("CAPSCHED_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let recompute_interval = match std::env::var("CAPSCHED_RECOMPUTE_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("CAPSCHED_RECOMPUTE_INTERVAL_SECS: '{raw}'"))?,
            ),
            Err(_) => Duration::from_secs(60),
        };
        if recompute_interval.is_zero() {
            anyhow::bail!("CAPSCHED_RECOMPUTE_INTERVAL_SECS must be positive");
        }

        let database = DbConfig::from_env();
        let settings = Settings::from_env()?;

        Ok(Self {
            log_level,
            recompute_interval,
            database,
            settings,
        })
    }
}
