use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{nlog_debug, Error, Result};

const DEFAULT_SERVER: &str = "127.0.0.1:5050";
const DEFAULT_EXCHANGE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: String,
    pub username: Option<String>,
    pub token: Option<String>,
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Knobs for the measurements the worker runs on the server's behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_latency_samples")]
    pub latency_samples: u32,
    #[serde(default = "default_throughput_window_ms")]
    pub throughput_window_ms: u64,
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_exchange_timeout_secs() -> u64 {
    DEFAULT_EXCHANGE_TIMEOUT_SECS
}

fn default_latency_samples() -> u32 {
    3
}

fn default_throughput_window_ms() -> u64 {
    2000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            latency_samples: default_latency_samples(),
            throughput_window_ms: default_throughput_window_ms(),
        }
    }
}

impl ProbeConfig {
    pub fn throughput_window(&self) -> Duration {
        Duration::from_millis(self.throughput_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            username: None,
            token: None,
            exchange_timeout_secs: DEFAULT_EXCHANGE_TIMEOUT_SECS,
            probe: ProbeConfig::default(),
        }
    }
}

impl Config {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".netgauge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("netgauge.toml"))
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        nlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            nlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        nlog_debug!(
            "Config loaded: server={} username={:?} timeout={}s",
            config.server,
            config.username,
            config.exchange_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                nlog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        nlog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
