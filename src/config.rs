use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_USAGE_WORKERS: usize = 4;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Cost-and-usage gateway; used when no billing file is given.
    pub billing_endpoint: Option<String>,
    /// Metric statistics gateway for usage estimation.
    pub metrics_endpoint: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub usage_workers: Option<usize>,
    #[serde(default)]
    pub strict_prices: bool,
    /// Price key -> unit price, overriding built-in prices.
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn usage_workers(&self) -> usize {
        self.usage_workers.unwrap_or(DEFAULT_USAGE_WORKERS).max(1)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "infratally").map(|d| d.config_dir().join("config.toml"))
}

/// Load config from `path` (or the default location). A missing file gives
/// defaults; an invalid one warns and gives defaults.
pub fn load_config(path: Option<&Path>) -> Config {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return Config::default(),
        },
    };

    let Ok(data) = fs::read_to_string(&path) else {
        return Config::default();
    };

    match toml::from_str(&data) {
        Ok(config) => config,
        Err(e) => {
            warn!("invalid config at {}: {}", path.display(), e);
            Config::default()
        }
    }
}
