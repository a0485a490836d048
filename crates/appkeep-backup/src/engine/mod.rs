//! Backup engine: backup, restore, verify and delete per application.
//!
//! Every operation takes an [`ApplicationRef`] plus instance selectors and
//! returns one outcome per instance. Malformed selectors fail the whole
//! call before any I/O; everything else is reported per instance, and a
//! failed instance never leaves partial state behind.

mod backup;
mod convert;
mod delete;
mod restore;
mod verify;

pub use backup::BackupSummary;
pub use convert::OANDBACKUP_INSTANCE;
pub use delete::DeleteSummary;
pub use restore::{RestoreOptions, RestoreSummary};
pub use verify::VerifySummary;

use crate::archive::{ArchiveCodec, ArchiveConfig};
use crate::catalog::BackupCatalog;
use crate::compression::{ArchiveFormat, DEFAULT_COMPRESSION_LEVEL};
use crate::crypto::{CryptoCodec, CryptoMode, KeyProvider};
use crate::filters::ExclusionConfig;
use crate::layout::{parse_selectors, BackupInstanceId, BackupLayout};
use crate::lock::{InstanceLock, LockRegistry};
use crate::metadata::{BackupMetadata, MetadataStore};
use crate::package::{DeviceStorage, PackageManager};
use appkeep_core::{ApplicationRef, EngineConfig, Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// How new archives are produced.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub archive_format: ArchiveFormat,
    pub compression_level: u32,
    pub crypto_mode: CryptoMode,
    pub show_progress: bool,

    /// Extra glob patterns skipped in every data directory
    pub extra_exclusions: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            archive_format: ArchiveFormat::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            crypto_mode: CryptoMode::None,
            show_progress: false,
            extra_exclusions: Vec::new(),
        }
    }
}

impl EngineOptions {
    /// Parses the tags of a loaded configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            archive_format: ArchiveFormat::from_tag(&config.archive_format)?,
            compression_level: config.compression_level.clamp(1, 9),
            crypto_mode: CryptoMode::from_tag(&config.crypto_mode)?,
            show_progress: config.show_progress,
            extra_exclusions: Vec::new(),
        })
    }

    pub fn with_archive_format(mut self, format: ArchiveFormat) -> Self {
        self.archive_format = format;
        self
    }

    pub fn with_crypto_mode(mut self, mode: CryptoMode) -> Self {
        self.crypto_mode = mode;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

/// Shared flag that stops an operation before its next archive entry.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Result for one instance of a batch operation.
#[derive(Debug)]
pub struct InstanceOutcome<T> {
    pub instance: BackupInstanceId,
    pub result: Result<T>,
}

/// Per-instance results of one engine call, in request order.
#[derive(Debug)]
pub struct BatchReport<T> {
    pub application: ApplicationRef,
    pub outcomes: Vec<InstanceOutcome<T>>,
}

impl<T> BatchReport<T> {
    fn new(application: &ApplicationRef) -> Self {
        Self {
            application: application.clone(),
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, instance: BackupInstanceId, result: Result<T>) {
        if let Err(e) = &result {
            warn!("{} instance {} failed: {}", self.application, instance, e);
        }
        self.outcomes.push(InstanceOutcome { instance, result });
    }

    /// True when every instance succeeded
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn successes(&self) -> impl Iterator<Item = (&BackupInstanceId, &T)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|v| (&o.instance, v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&BackupInstanceId, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.instance, e)))
    }

    /// The first failure, if any
    pub fn first_error(&self) -> Option<&Error> {
        self.failures().next().map(|(_, e)| e)
    }
}

/// Orchestrates layout, codecs, metadata and catalog.
pub struct BackupEngine {
    layout: BackupLayout,
    catalog: Option<BackupCatalog>,
    packages: Arc<dyn PackageManager>,
    storage: Arc<dyn DeviceStorage>,
    keys: Option<Arc<dyn KeyProvider>>,
    options: EngineOptions,
    cancel: CancelFlag,
    locks: LockRegistry,
}

impl fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupEngine")
            .field("layout", &self.layout)
            .field("catalog", &self.catalog)
            .field("options", &self.options)
            .field("has_key_provider", &self.keys.is_some())
            .finish()
    }
}

impl BackupEngine {
    pub fn new(
        layout: BackupLayout,
        packages: Arc<dyn PackageManager>,
        storage: Arc<dyn DeviceStorage>,
    ) -> Self {
        Self {
            layout,
            catalog: None,
            packages,
            storage,
            keys: None,
            options: EngineOptions::default(),
            cancel: CancelFlag::new(),
            locks: LockRegistry::new(),
        }
    }

    /// Builds an engine from a loaded configuration.
    pub fn from_config(
        config: &EngineConfig,
        packages: Arc<dyn PackageManager>,
        storage: Arc<dyn DeviceStorage>,
    ) -> Result<Self> {
        Ok(Self::new(
            BackupLayout::new(config.backup_root.as_std_path()),
            packages,
            storage,
        )
        .with_catalog(BackupCatalog::new(config.catalog_path().as_std_path()))
        .with_options(EngineOptions::from_config(config)?))
    }

    pub fn with_catalog(mut self, catalog: BackupCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub fn catalog(&self) -> Option<&BackupCatalog> {
        self.catalog.as_ref()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Waits for exclusive use of one instance of `app`.
    async fn lock_instance(&self, app: &ApplicationRef, id: &BackupInstanceId) -> Result<InstanceLock> {
        self.locks.acquire(&self.layout, &app.application_id, id).await
    }

    /// Parses caller selectors, defaulting to the base instance of the application's user.
    fn resolve_selectors(app: &ApplicationRef, selectors: &[String]) -> Result<Vec<BackupInstanceId>> {
        if selectors.is_empty() {
            return Ok(vec![BackupInstanceId::base(app.user)]);
        }
        let mut ids = parse_selectors(selectors)?;
        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        Ok(ids)
    }

    /// Locates and reads the metadata of one instance of `app`.
    fn read_metadata(
        &self,
        app: &ApplicationRef,
        id: &BackupInstanceId,
    ) -> Result<(PathBuf, BackupMetadata)> {
        let dir = self.layout.instance_dir(&app.application_id, id)?;
        if !dir.is_dir() {
            return Err(Error::instance_not_found(format!(
                "{}/{}",
                app.application_id, id
            )));
        }
        let metadata = MetadataStore::read_instance(&dir, id)?;
        if metadata.descriptor.application_id != app.application_id {
            return Err(Error::metadata_corrupt(
                dir.display().to_string(),
                format!(
                    "record belongs to {}",
                    metadata.descriptor.application_id
                ),
            ));
        }
        Ok((dir, metadata))
    }

    /// Codec for an instance's stored tags.
    fn codec_for_tags(&self, format_tag: &str, crypto_tag: &str, exclusions: ExclusionConfig) -> Result<ArchiveCodec> {
        let format = ArchiveFormat::from_tag(format_tag)?;
        let crypto = CryptoCodec::for_tag(crypto_tag, self.keys.as_deref())?;
        let config = ArchiveConfig::new(format)?
            .with_exclusions(exclusions)
            .with_compression_level(self.options.compression_level);
        Ok(ArchiveCodec::new(config, crypto))
    }

    /// Best-effort catalog refresh after a mutation.
    fn refresh_catalog(&self, application_id: &str) {
        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.refresh(&self.layout, application_id) {
                warn!("Failed to refresh catalog for {}: {}", application_id, e);
            }
        }
    }
}
