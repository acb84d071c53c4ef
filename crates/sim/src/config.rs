//! Configuration persistence for the simulation driver.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/embdist/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use embdist_core::config::PlacementConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STEPS: usize = 10;
pub const DEFAULT_KEY_SPACE: i64 = 1 << 20;
pub const DEFAULT_SEED: u64 = 0;
pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Persistent driver configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Placement file, JSON or TOML by extension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<PathBuf>,

    /// Global batch sizes, cycled over the steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_sizes: Option<Vec<usize>>,

    /// Number of steps to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,

    /// Keys are drawn from `0..key_space`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_space: Option<i64>,

    /// Seed of the synthetic batch generator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Feed the whole batch to every device instead of per-device slices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_batch: Option<bool>,

    /// Collective receive timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_timeout_ms: Option<u64>,

    /// Fallback log level when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl SimConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("embdist").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &SimConfig) {
        if other.placement.is_some() {
            self.placement = other.placement.clone();
        }
        if other.batch_sizes.is_some() {
            self.batch_sizes = other.batch_sizes.clone();
        }
        if other.steps.is_some() {
            self.steps = other.steps;
        }
        if other.key_space.is_some() {
            self.key_space = other.key_space;
        }
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.full_batch.is_some() {
            self.full_batch = other.full_batch;
        }
        if other.recv_timeout_ms.is_some() {
            self.recv_timeout_ms = other.recv_timeout_ms;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
    }

    pub fn steps_or_default(&self) -> usize {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }

    pub fn key_space_or_default(&self) -> i64 {
        self.key_space.unwrap_or(DEFAULT_KEY_SPACE)
    }

    pub fn seed_or_default(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    pub fn recv_timeout_ms_or_default(&self) -> u64 {
        self.recv_timeout_ms.unwrap_or(DEFAULT_RECV_TIMEOUT_MS)
    }

    pub fn log_level_or_default(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Read a placement file. Files ending in `.toml` are parsed as TOML,
/// anything else as JSON.
pub fn load_placement(path: &Path) -> Result<PlacementConfig, ConfigError> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        let placement: PlacementConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        placement.validate().map_err(ConfigError::Placement)?;
        Ok(placement)
    } else {
        PlacementConfig::from_json_file(path).map_err(ConfigError::Placement)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// The placement file is unreadable or inconsistent.
    Placement(embdist_core::config::ConfigError),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Placement(e) => write!(f, "Placement error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Placement(e) => Some(e),
            ConfigError::NoConfigDir => None,
        }
    }
}
