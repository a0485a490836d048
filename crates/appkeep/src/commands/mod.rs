//! Command implementations and the engine setup they share.

pub mod backup;
pub mod catalog;
pub mod delete;
pub mod import;
pub mod key;
pub mod list;
pub mod migrate;
pub mod restore;
pub mod verify;

use anyhow::{anyhow, Context, Result};
use appkeep_backup::{
    ArchiveKey, BackupEngine, BackupLayout, BatchReport, InventoryPackageManager, RootedStorage,
    SelectionFlags, StaticKeyProvider,
};
use appkeep_core::{ConfigLoader, EngineConfig};
use camino::Utf8PathBuf;
use std::sync::Arc;

use crate::cli::GlobalArgs;
use crate::output;

/// Loads the configuration and applies command-line overrides.
pub fn load_config(global: &GlobalArgs) -> Result<EngineConfig> {
    let loader = ConfigLoader::new()?;
    let mut config = loader.load_from(global.config.as_deref())?;
    if let Some(root) = &global.backup_root {
        config = config.with_backup_root(root.clone());
    }
    Ok(config)
}

/// Engine together with the inventory it installs into.
pub struct EngineContext {
    pub config: EngineConfig,
    pub engine: BackupEngine,
    pub packages: Arc<InventoryPackageManager>,
    inventory_path: Utf8PathBuf,
}

impl EngineContext {
    /// Builds the engine described by the configuration.
    ///
    /// Ctrl-C sets the engine's cancel flag so the current instance is
    /// abandoned cleanly instead of killing the process mid-write.
    pub fn open(global: &GlobalArgs) -> Result<Self> {
        let config = load_config(global)?;
        let inventory_path = config.inventory_path.clone().ok_or_else(|| {
            anyhow!("No package inventory configured (set inventory-path or APPKEEP_INVENTORY)")
        })?;

        let storage = RootedStorage::new(config.device_root.as_std_path());
        let packages = Arc::new(
            InventoryPackageManager::from_file(inventory_path.as_std_path(), storage.clone())
                .with_context(|| format!("Failed to load inventory {}", inventory_path))?,
        );

        let mut engine = BackupEngine::from_config(&config, packages.clone(), Arc::new(storage))?;
        let keys = key_provider(global)?;
        if !keys.is_empty() {
            engine = engine.with_key_provider(Arc::new(keys));
        }

        let cancel = engine.cancel_flag().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::caution("Interrupted, stopping after the current archive");
                cancel.cancel();
            }
        });

        Ok(Self {
            config,
            engine,
            packages,
            inventory_path,
        })
    }

    /// Persists installs and rule imports back to the inventory file.
    pub fn save_inventory(&self) -> Result<()> {
        self.packages.save(self.inventory_path.as_std_path())?;
        Ok(())
    }
}

/// Environment variable holding the passphrase of `aes` instances
pub const PASSPHRASE_ENV: &str = "APPKEEP_PASSPHRASE";

/// Keys from the identity file and the passphrase environment variable.
fn key_provider(global: &GlobalArgs) -> Result<StaticKeyProvider> {
    let mut keys = StaticKeyProvider::new();
    if let Some(key_file) = &global.key_file {
        let identity = ArchiveKey::from_key_file(key_file.as_std_path())
            .with_context(|| format!("Failed to load identity {}", key_file))?;
        keys = keys.with_key(identity);
    }
    if let Some(passphrase) = std::env::var(PASSPHRASE_ENV).ok().filter(|p| !p.is_empty()) {
        keys = keys.with_key(ArchiveKey::passphrase(passphrase));
    }
    Ok(keys)
}

/// Layout of the configured backup root, for commands that never touch packages
pub fn open_layout(config: &EngineConfig) -> BackupLayout {
    BackupLayout::new(config.backup_root.as_std_path())
}

/// Parses a comma separated list of flag names.
pub fn parse_flags(value: &str) -> Result<SelectionFlags> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(SelectionFlags::empty(), |flags, name| {
            SelectionFlags::from_cli_name(name)
                .map(|flag| flags | flag)
                .ok_or_else(|| anyhow!("Unknown selection flag '{}'", name))
        })
}

/// Prints one line per instance and fails when any instance failed.
pub fn finish_report<T>(report: &BatchReport<T>, describe: impl Fn(&T) -> String) -> Result<()> {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(value) => output::instance_done(&outcome.instance.to_string(), &describe(value)),
            Err(e) => output::instance_failed(
                &outcome.instance.to_string(),
                &e.to_string(),
                e.kind(),
            ),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        return Err(anyhow!(
            "{} of {} instance(s) of {} failed",
            failed,
            report.outcomes.len(),
            report.application
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let flags = parse_flags("binaries, internal-data,exclude-cache").unwrap();
        assert_eq!(
            flags,
            SelectionFlags::BINARIES | SelectionFlags::INTERNAL_DATA | SelectionFlags::EXCLUDE_CACHE
        );
        assert_eq!(parse_flags("").unwrap(), SelectionFlags::empty());
    }

    #[test]
    fn test_parse_flags_rejects_unknown() {
        let err = parse_flags("binaries,everything").unwrap_err();
        assert!(err.to_string().contains("everything"));
    }
}
