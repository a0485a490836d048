//! Hierarchical configuration loader with precedence
//!
//! Loads configuration from multiple sources with the following precedence (low to high):
//! 1. Built-in defaults
//! 2. Global config (~/.appkeep/config.yaml)
//! 3. Environment variables (APPKEEP_* prefix)
//! 4. CLI flags (handled by caller)

use super::{EngineConfig, CONFIG_FILENAME};
use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::env;
use std::fs;

/// Configuration hierarchy loader
pub struct ConfigLoader {
    /// Directory holding config.yaml
    config_dir: Utf8PathBuf,
}

impl ConfigLoader {
    /// Create a loader rooted at the standard state directory (~/.appkeep)
    pub fn new() -> Result<Self> {
        let state_dir = crate::utils::get_state_dir()
            .map_err(|e| Error::invalid_config(e.to_string()))?;
        let config_dir = Utf8PathBuf::from_path_buf(state_dir)
            .map_err(|p| Error::invalid_config(format!("Non UTF-8 state directory: {:?}", p)))?;
        Ok(Self { config_dir })
    }

    /// Create a loader with a custom config directory
    pub fn with_dir(config_dir: Utf8PathBuf) -> Self {
        Self { config_dir }
    }

    /// Path of the global config file
    pub fn config_file(&self) -> Utf8PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    /// Load engine configuration with hierarchical precedence
    pub fn load(&self) -> Result<EngineConfig> {
        self.load_from(None)
    }

    /// Load configuration, reading `explicit` instead of the global file when given
    pub fn load_from(&self, explicit: Option<&Utf8Path>) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::invalid_config(format!(
                        "Configuration file not found: {}",
                        path
                    )));
                }
                Some(path.to_path_buf())
            }
            None => Some(self.config_file()).filter(|p| p.exists()),
        };

        if let Some(path) = path {
            tracing::debug!("Loading configuration from {}", path);
            config = Self::load_yaml_file(&path)?;
        }

        config = Self::apply_env_overrides(config)?;
        config.compression_level = config.compression_level.clamp(1, 9);

        Ok(config)
    }

    /// Load a YAML file and parse it
    fn load_yaml_file(path: &Utf8Path) -> Result<EngineConfig> {
        let content = fs::read_to_string(path)?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse {}: {}", path, e)))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: EngineConfig) -> Result<EngineConfig> {
        if let Ok(val) = env::var("APPKEEP_BACKUP_ROOT") {
            config.backup_root = Utf8PathBuf::from(val);
        }

        if let Ok(val) = env::var("APPKEEP_CATALOG_PATH") {
            config.catalog_path = Some(Utf8PathBuf::from(val));
        }

        if let Ok(val) = env::var("APPKEEP_DEVICE_ROOT") {
            config.device_root = Utf8PathBuf::from(val);
        }

        if let Ok(val) = env::var("APPKEEP_ARCHIVE_FORMAT") {
            config.archive_format = val;
        }

        if let Ok(val) = env::var("APPKEEP_COMPRESSION_LEVEL") {
            config.compression_level = val.parse().map_err(|_| {
                Error::invalid_config("APPKEEP_COMPRESSION_LEVEL must be a valid number")
            })?;
        }

        if let Ok(val) = env::var("APPKEEP_CRYPTO_MODE") {
            config.crypto_mode = val;
        }

        if let Ok(val) = env::var("APPKEEP_SHOW_PROGRESS") {
            config.show_progress = val.parse().map_err(|_| {
                Error::invalid_config("APPKEEP_SHOW_PROGRESS must be true or false")
            })?;
        }

        if let Ok(val) = env::var("APPKEEP_INVENTORY") {
            config.inventory_path = Some(Utf8PathBuf::from(val));
        }

        Ok(config)
    }
}
