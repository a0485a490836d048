//! Versioned metadata records describing one backup instance.
//!
//! The current schema splits the record into two files:
//! - `info.json` ([`BackupInfo`]): how the instance was produced
//! - `meta.json` ([`BackupDescriptor`]): what was captured
//!
//! Schema versions 2 to 4 stored one flat record (`meta.am.v1`) next to a
//! `checksums.txt` file; [`legacy`] reads those and upgrades them step by step.

pub mod checksums;
pub mod legacy;
mod store;

pub use legacy::LegacyMetadata;
pub use store::MetadataStore;

use crate::archive::ArchivePart;
use crate::classifier::DirectoryClass;
use crate::compression::{ArchiveFormat, CHECKSUM_ALGORITHM};
use crate::crypto::CryptoMode;
use crate::flags::SelectionFlags;
use crate::layout::BackupInstanceId;
use crate::misc::MISC_FILENAME;
use appkeep_core::{Error, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Schema version written by this engine.
pub const CURRENT_BACKUP_META_VERSION: u32 = 5;

/// Oldest schema version that can still be read.
pub const MIN_SUPPORTED_META_VERSION: u32 = 2;

pub const INFO_FILENAME: &str = "info.json";
pub const META_FILENAME: &str = "meta.json";
pub const LEGACY_META_FILENAME: &str = "meta.am.v1";
pub const CHECKSUMS_FILENAME: &str = "checksums.txt";
pub const ICON_FILENAME: &str = "icon.png";
pub const RULES_FILENAME: &str = "rules.am.tsv";

pub const SOURCE_PREFIX: &str = "source";
pub const DATA_PREFIX: &str = "data";
pub const KEYSTORE_PREFIX: &str = "keystore";

/// Key prefix of signing certificate entries in a legacy `checksums.txt`
pub const CERT_CHECKSUM_PREFIX: &str = "cert_";

/// File name of an archive: `<prefix><format ext><crypto ext>`.
pub fn archive_file_name(prefix: &str, format: ArchiveFormat, crypto: CryptoMode) -> String {
    format!("{}{}{}", prefix, format.extension(), crypto.extension())
}

/// File name of the misc payload: `misc.am.tsv<crypto ext>`.
pub fn misc_file_name(crypto: CryptoMode) -> String {
    format!("{}{}", MISC_FILENAME, crypto.extension())
}

/// How an instance was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Schema version
    pub version: u32,

    /// Owning user the instance was captured from
    pub owning_user: UserId,

    /// Directory name under the application root
    pub relative_dir: String,

    /// Crypto-mode tag, kept verbatim so unknown tags survive a read
    pub crypto: String,

    /// Archive-format tag, kept verbatim for the same reason
    pub archive_format: String,

    /// Checksum algorithm (sha256)
    pub checksum_algorithm: String,

    /// When the capture finished
    pub created_at: DateTime<Utc>,

    /// Raw selection bitmask, unknown bits included
    pub flags: u32,
}

impl BackupInfo {
    pub fn selection_flags(&self) -> SelectionFlags {
        SelectionFlags::from_stored(self.flags)
    }

    pub fn crypto_mode(&self) -> Result<CryptoMode> {
        CryptoMode::from_tag(&self.crypto)
    }

    pub fn format(&self) -> Result<ArchiveFormat> {
        ArchiveFormat::from_tag(&self.archive_format)
    }
}

/// One captured data directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDirectoryDescriptor {
    /// Path as recorded on the device at capture time
    pub original_path: String,

    pub classification: DirectoryClass,

    pub directly_reachable: bool,

    /// Archive file holding the directory contents
    pub archive: String,

    /// Number of archive entries; `Some(0)` means there was nothing to capture.
    /// Legacy records do not know the count.
    #[serde(default)]
    pub entries: Option<u64>,
}

impl DataDirectoryDescriptor {
    /// True when the capture recorded an empty directory
    pub fn is_empty_capture(&self) -> bool {
        self.entries == Some(0)
    }
}

/// What an instance captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub version: u32,
    pub application_id: String,
    pub display_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub is_system_app: bool,
    pub is_split_apk: bool,
    #[serde(default)]
    pub split_configs: Vec<String>,
    pub has_rules_payload: bool,
    pub has_keystore_payload: bool,
    #[serde(default)]
    pub has_misc_payload: bool,
    #[serde(default)]
    pub installer_id: Option<String>,

    /// `None` for the base instance
    #[serde(default)]
    pub instance_name: Option<String>,

    /// Archive holding the binaries, when they were captured
    #[serde(default)]
    pub binary_archive: Option<String>,

    pub apk_name: String,
    #[serde(default)]
    pub instruction_set: Option<String>,
    pub data_directories: Vec<DataDirectoryDescriptor>,

    /// Stored file name -> hex checksum
    pub checksums: BTreeMap<String, String>,

    /// sha256 of each signing certificate of the captured APK
    #[serde(default)]
    pub certificate_checksums: Vec<String>,
}

/// Current-shape metadata: Info plus Descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupMetadata {
    pub info: BackupInfo,
    pub descriptor: BackupDescriptor,
}

impl BackupMetadata {
    /// Instance id encoded by this record
    pub fn instance_id(&self) -> BackupInstanceId {
        BackupInstanceId {
            user: self.info.owning_user,
            name: self.descriptor.instance_name.clone(),
        }
    }

    /// Name of the keystore archive, when one was captured
    pub fn keystore_archive(&self) -> Result<Option<String>> {
        if !self.descriptor.has_keystore_payload {
            return Ok(None);
        }
        Ok(Some(archive_file_name(
            KEYSTORE_PREFIX,
            self.info.format()?,
            self.info.crypto_mode()?,
        )))
    }

    /// Name of the sealed misc payload, when one was captured
    pub fn misc_payload(&self) -> Result<Option<String>> {
        if !self.descriptor.has_misc_payload {
            return Ok(None);
        }
        Ok(Some(misc_file_name(self.info.crypto_mode()?)))
    }

    /// Every archive file the record refers to.
    pub fn archive_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        if let Some(binary) = &self.descriptor.binary_archive {
            files.push(binary.clone());
        }
        files.extend(
            self.descriptor
                .data_directories
                .iter()
                .map(|dir| dir.archive.clone()),
        );
        if let Some(keystore) = self.keystore_archive()? {
            files.push(keystore);
        }
        Ok(files)
    }

    /// Stored files of `archive` under `dir` with their recorded checksums.
    ///
    /// A file named exactly `archive` is the only part. Otherwise the
    /// numbered parts `<stem>.0<ext>`, `<stem>.1<ext>`, ... are collected up
    /// to the first gap, `<stem>` being `archive` without the crypto suffix.
    pub fn archive_parts(&self, dir: &Path, archive: &str) -> Result<Vec<ArchivePart>> {
        let instance = self.info.relative_dir.as_str();
        let names = if dir.join(archive).is_file() {
            vec![archive.to_string()]
        } else {
            let suffix = self.info.crypto_mode()?.extension();
            let stem = archive.strip_suffix(suffix).unwrap_or(archive);
            let mut names = Vec::new();
            loop {
                let name = format!("{}.{}{}", stem, names.len(), suffix);
                if !dir.join(&name).is_file() {
                    break;
                }
                names.push(name);
            }
            names
        };
        if names.is_empty() {
            return Err(Error::integrity_violation(
                instance,
                format!("archive {} is missing", archive),
            ));
        }

        names
            .into_iter()
            .map(|name| {
                let checksum = self.descriptor.checksums.get(&name).ok_or_else(|| {
                    Error::integrity_violation(instance, format!("no checksum recorded for {}", name))
                })?;
                Ok(ArchivePart::new(dir.join(&name), checksum.as_str()))
            })
            .collect()
    }

    /// Checks the record is internally consistent.
    ///
    /// Format and crypto tags are not checked here; unknown tags are a
    /// restore/verify-time failure rather than corruption.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |message: String| Error::metadata_corrupt(&self.info.relative_dir, message);

        if self.info.version != self.descriptor.version {
            return Err(corrupt(format!(
                "info version {} does not match descriptor version {}",
                self.info.version, self.descriptor.version
            )));
        }
        if self.info.checksum_algorithm != CHECKSUM_ALGORITHM {
            return Err(corrupt(format!(
                "unsupported checksum algorithm {}",
                self.info.checksum_algorithm
            )));
        }
        let expected_dir = self.instance_id().relative_dir();
        if self.info.relative_dir != expected_dir {
            return Err(corrupt(format!(
                "relative dir {} does not match instance {}",
                self.info.relative_dir, expected_dir
            )));
        }
        for dir in &self.descriptor.data_directories {
            if dir.archive.contains(['/', '\\']) {
                return Err(corrupt(format!("invalid archive name {}", dir.archive)));
            }
        }
        Ok(())
    }
}

/// A record as found on disk, before normalization.
#[derive(Debug, Clone)]
pub enum MetadataRecord {
    /// Flat record of schema 2-4 together with its checksums.txt content
    Legacy {
        record: LegacyMetadata,
        checksums: BTreeMap<String, String>,
    },
    /// Split Info/Descriptor record
    Current(BackupMetadata),
}

impl MetadataRecord {
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::Legacy { record, .. } => record.version,
            Self::Current(metadata) => metadata.info.version,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy { .. })
    }

    /// Normalizes to the current shape.
    ///
    /// `fallback_user` is used for legacy records that never stored their owning user.
    pub fn into_current(self, fallback_user: UserId) -> BackupMetadata {
        match self {
            Self::Legacy { record, checksums } => record.upgrade(fallback_user, checksums),
            Self::Current(metadata) => metadata,
        }
    }
}
