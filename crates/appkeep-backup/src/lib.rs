//! AppKeep backup engine
//!
//! Captures and restores installed applications per user: the installed
//! binaries, each class of data directory, keystore entries, rules and
//! icon. Instances live under `<root>/<application id>/<user>[_<name>]`
//! and carry a versioned metadata record with SHA-256 checksums of
//! every payload.
//!
//! # Features
//!
//! - **Directory classification**: internal, device-protected, external,
//!   media, OBB and custom locations, each selectable by flag
//! - **Cross-user restore**: stored paths are remapped to the target user
//! - **All-or-nothing instances**: captures are staged and renamed into
//!   place; restores run inside a transaction that rolls back on failure
//! - **Legacy records**: older metadata schemas are upgraded on read and
//!   can be rewritten in place
//! - **Archive codecs**: tar with gzip or zstd, optionally sealed with
//!   age (passphrase or X25519 identity)
//! - **Device settings**: permission grants, app ops and similar settings
//!   travel in a sealed misc payload
//!
//! # Examples
//!
//! ```no_run
//! use appkeep_backup::{
//!     BackupEngine, BackupLayout, InventoryPackageManager, RootedStorage, SelectionFlags,
//! };
//! use appkeep_core::ApplicationRef;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = RootedStorage::new("/");
//!     let packages = InventoryPackageManager::from_file(
//!         Path::new("inventory.yaml"),
//!         storage.clone(),
//!     )?;
//!     let engine = BackupEngine::new(
//!         BackupLayout::new("/backups"),
//!         Arc::new(packages),
//!         Arc::new(storage),
//!     );
//!
//!     let app = ApplicationRef::new("com.example.notes", 0)?;
//!     let report = engine.backup(&app, &[], SelectionFlags::LEGACY_DEFAULT).await?;
//!     for (instance, summary) in report.successes() {
//!         println!("{}: {} bytes", instance, summary.total_bytes());
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod catalog;
pub mod classifier;
pub mod compression;
pub mod crypto;
pub mod engine;
pub mod filters;
pub mod flags;
pub mod layout;
pub mod lock;
pub mod metadata;
pub mod misc;
pub mod package;
pub mod progress;
pub mod remap;
pub mod transaction;

// Re-export commonly used types
pub use archive::{ArchiveCodec, ArchiveConfig, ArchivePart, PackedArchive};
pub use catalog::{BackupCatalog, CatalogEntry};
pub use classifier::{classify, Classification, DirectoryClass};
pub use compression::{calculate_checksum, ArchiveFormat, DEFAULT_COMPRESSION_LEVEL};
pub use crypto::{ArchiveKey, CryptoCodec, CryptoMode, KeyProvider, StaticKeyProvider};
pub use engine::{
    BackupEngine, BackupSummary, BatchReport, CancelFlag, DeleteSummary, EngineOptions,
    InstanceOutcome, RestoreOptions, RestoreSummary, VerifySummary, OANDBACKUP_INSTANCE,
};
pub use filters::ExclusionConfig;
pub use flags::SelectionFlags;
pub use layout::{parse_selectors, sanitize_backup_name, BackupInstanceId, BackupLayout};
pub use metadata::{BackupMetadata, MetadataRecord, MetadataStore, CURRENT_BACKUP_META_VERSION};
pub use misc::{parse_misc, render_misc, MiscEntry, MiscKind};
pub use package::{
    DeviceStorage, InstalledPackage, Inventory, InventoryPackageManager, PackageManager,
    RootedStorage,
};
pub use remap::{remap, remap_keystore};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
