//! Engine configuration types
//!
//! Values here control where backups live and how new archives are produced.
//! Stored backups always carry their own format and crypto tags, so changing
//! these settings never affects how existing instances are read.

mod loader;

pub use loader::ConfigLoader;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Name of the configuration file inside the state directory
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Name of the catalog file created under the backup root by default
pub const DEFAULT_CATALOG_FILENAME: &str = ".catalog.json";

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Directory holding one subdirectory per application
    #[serde(default = "default_backup_root")]
    pub backup_root: Utf8PathBuf,

    /// Catalog location (defaults to `<backup-root>/.catalog.json`)
    #[serde(default)]
    pub catalog_path: Option<Utf8PathBuf>,

    /// Host directory that device paths are resolved against
    #[serde(default = "default_device_root")]
    pub device_root: Utf8PathBuf,

    /// Archive format tag for new backups ("z" or "zst")
    #[serde(default = "default_archive_format")]
    pub archive_format: String,

    /// Compression level (1-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Crypto mode tag for new backups
    #[serde(default = "default_crypto_mode")]
    pub crypto_mode: String,

    /// Whether to draw progress bars
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,

    /// Installed-package inventory used by the command-line front end
    #[serde(default)]
    pub inventory_path: Option<Utf8PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            catalog_path: None,
            device_root: default_device_root(),
            archive_format: default_archive_format(),
            compression_level: default_compression_level(),
            crypto_mode: default_crypto_mode(),
            show_progress: default_show_progress(),
            inventory_path: None,
        }
    }
}

impl EngineConfig {
    /// Resolved catalog location
    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.backup_root.join(DEFAULT_CATALOG_FILENAME))
    }

    /// Sets the compression level, clamped to 1-9.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.clamp(1, 9);
        self
    }

    /// Sets the backup root.
    pub fn with_backup_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.backup_root = root.into();
        self
    }
}

fn default_backup_root() -> Utf8PathBuf {
    crate::utils::get_state_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir.join("backups")).ok())
        .unwrap_or_else(|| Utf8PathBuf::from(".appkeep/backups"))
}
fn default_device_root() -> Utf8PathBuf {
    Utf8PathBuf::from("/")
}
fn default_archive_format() -> String {
    "z".to_string()
}
fn default_compression_level() -> u32 {
    6
}
fn default_crypto_mode() -> String {
    "none".to_string()
}
fn default_show_progress() -> bool {
    true
}
