use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_JOBS_PER_PUMP: usize = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Tunables for a bridge session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Default timeout for awaited host-to-script calls. `0` disables it.
    pub call_timeout_ms: u64,
    /// Upper bound on QuickJS jobs run per pump, guarding against runaway promise chains.
    pub max_jobs_per_pump: usize,
    /// Optional QuickJS heap limit in bytes.
    pub memory_limit_bytes: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            max_jobs_per_pump: DEFAULT_MAX_JOBS_PER_PUMP,
            memory_limit_bytes: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `config_path`, then `FRONTIER_BRIDGE_CONFIG`, then the
    /// per-user config directory. A missing file means defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = config_path
            .or_else(|| std::env::var("FRONTIER_BRIDGE_CONFIG").ok().map(PathBuf::from))
            .or_else(default_config_path);

        match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                Self::from_yaml(&contents)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "Frontier", "FrontierBrowser").map(|dirs| {
        let mut path = dirs.config_dir().to_path_buf();
        path.push("bridge.yaml");
        path
    })
}
