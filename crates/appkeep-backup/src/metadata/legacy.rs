//! Flat metadata records of schema versions 2 to 4 (`meta.am.v1`).
//!
//! Each version step is a separate function so a record is normalized by
//! replaying the steps it missed:
//!
//! - 2 -> 3: crypto tag and keystore presence became explicit
//! - 3 -> 4: installer package recorded
//! - 4 -> 5: split into Info and Descriptor, data directories classified

use super::{
    archive_file_name, misc_file_name, BackupDescriptor, BackupInfo, BackupMetadata, DataDirectoryDescriptor,
    CERT_CHECKSUM_PREFIX, CURRENT_BACKUP_META_VERSION, DATA_PREFIX, SOURCE_PREFIX,
};
use crate::classifier::classify;
use crate::compression::{ArchiveFormat, CHECKSUM_ALGORITHM};
use crate::crypto::CryptoMode;
use crate::flags::SelectionFlags;
use crate::layout::BackupLayout;
use appkeep_core::UserId;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_APK_NAME: &str = "base.apk";

/// One flat legacy record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyMetadata {
    pub version: u32,
    pub label: String,
    pub package_name: String,
    pub version_name: String,
    pub version_code: i64,
    #[serde(default)]
    pub source_dir: Option<String>,
    #[serde(default)]
    pub data_dirs: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub is_split_apk: bool,
    #[serde(default)]
    pub split_names: Vec<String>,
    #[serde(default)]
    pub has_rules: bool,

    /// Milliseconds since the epoch
    pub backup_time: i64,

    /// Schema 2 kept the binary checksum inline
    #[serde(default)]
    pub source_dir_sha256_checksum: Option<String>,

    /// Schema 2 kept per-directory checksums inline, in data directory order
    #[serde(default)]
    pub data_dirs_sha256_checksum: Vec<String>,

    /// Signing certificate checksums, inline until schema 3
    #[serde(default)]
    pub cert_sha256_checksum: Vec<String>,

    #[serde(default)]
    pub apk_name: Option<String>,
    #[serde(default)]
    pub instruction_set: Option<String>,
    #[serde(default)]
    pub flags: Option<u32>,
    #[serde(default)]
    pub user_handle: Option<UserId>,
    #[serde(default)]
    pub tar_type: Option<String>,

    /// Added in schema 3
    #[serde(default)]
    pub crypto: Option<String>,

    /// Added in schema 3
    #[serde(default)]
    pub key_store: Option<bool>,

    /// Added in schema 4
    #[serde(default)]
    pub installer: Option<String>,
}

impl LegacyMetadata {
    fn selection_flags(&self) -> SelectionFlags {
        self.flags
            .map(SelectionFlags::from_stored)
            .unwrap_or(SelectionFlags::LEGACY_DEFAULT)
    }

    /// Schema 2 -> 3: schema 2 never encrypted and never captured keystores.
    pub fn upgrade_v2_to_v3(mut self) -> Self {
        self.crypto.get_or_insert_with(|| CryptoMode::None.tag().to_string());
        self.key_store.get_or_insert(false);
        self.version = 3;
        self
    }

    /// Schema 3 -> 4: the installer stays unknown.
    pub fn upgrade_v3_to_v4(mut self) -> Self {
        self.version = 4;
        self
    }

    /// Schema 4 -> 5: builds the split record.
    ///
    /// Checksums are merged from `checksums.txt` and, for older records, the
    /// inline fields. Certificate entries (`cert_<n>`) move out of the file
    /// checksums into their own list. The instance name is left unset; callers that know the
    /// directory the record was read from fill it in.
    pub fn upgrade_v4_to_v5(
        self,
        fallback_user: UserId,
        mut checksums: BTreeMap<String, String>,
    ) -> BackupMetadata {
        let owning_user = self.user_handle.unwrap_or(fallback_user);
        let flags = self.selection_flags();
        let format_tag = self
            .tar_type
            .clone()
            .unwrap_or_else(|| ArchiveFormat::Gzip.tag().to_string());
        let crypto_tag = self
            .crypto
            .clone()
            .unwrap_or_else(|| CryptoMode::None.tag().to_string());

        // Archive names are only derivable for tags this engine understands;
        // unknown tags keep a best-effort name and fail at restore/verify.
        let format = ArchiveFormat::from_tag(&format_tag).unwrap_or_default();
        let crypto = CryptoMode::from_tag(&crypto_tag).unwrap_or_default();

        let binary_archive = flags
            .contains(SelectionFlags::BINARIES)
            .then(|| archive_file_name(SOURCE_PREFIX, format, crypto));
        if let (Some(name), Some(sum)) = (&binary_archive, &self.source_dir_sha256_checksum) {
            checksums.entry(name.clone()).or_insert_with(|| sum.clone());
        }

        let data_directories: Vec<DataDirectoryDescriptor> = self
            .data_dirs
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let classification = classify(path, owning_user);
                let archive = archive_file_name(&format!("{}{}", DATA_PREFIX, index), format, crypto);
                if let Some(sum) = self.data_dirs_sha256_checksum.get(index) {
                    checksums.entry(archive.clone()).or_insert_with(|| sum.clone());
                }
                DataDirectoryDescriptor {
                    original_path: path.clone(),
                    classification: classification.class,
                    directly_reachable: classification.directly_reachable,
                    archive,
                    entries: None,
                }
            })
            .collect();

        let certificate_checksums = take_certificate_checksums(&mut checksums, self.cert_sha256_checksum);
        let has_misc_payload = checksums.contains_key(&misc_file_name(crypto));

        let created_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(self.backup_time)
            .single()
            .unwrap_or_default();

        BackupMetadata {
            info: BackupInfo {
                version: CURRENT_BACKUP_META_VERSION,
                owning_user,
                relative_dir: BackupLayout::legacy_relative_dir(owning_user, None, &self.package_name),
                crypto: crypto_tag,
                archive_format: format_tag,
                checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
                created_at,
                flags: flags.bits(),
            },
            descriptor: BackupDescriptor {
                version: CURRENT_BACKUP_META_VERSION,
                application_id: self.package_name,
                display_name: self.label,
                version_name: self.version_name,
                version_code: self.version_code,
                is_system_app: self.is_system,
                is_split_apk: self.is_split_apk,
                split_configs: self.split_names,
                has_rules_payload: self.has_rules,
                has_keystore_payload: self.key_store.unwrap_or(false),
                has_misc_payload,
                installer_id: self.installer,
                instance_name: None,
                binary_archive,
                apk_name: self.apk_name.unwrap_or_else(|| DEFAULT_APK_NAME.to_string()),
                instruction_set: self.instruction_set,
                data_directories,
                checksums,
                certificate_checksums,
            },
        }
    }

    /// Replays every missing step up to the current schema.
    pub fn upgrade(self, fallback_user: UserId, checksums: BTreeMap<String, String>) -> BackupMetadata {
        let mut record = self;
        if record.version < 3 {
            record = record.upgrade_v2_to_v3();
        }
        if record.version < 4 {
            record = record.upgrade_v3_to_v4();
        }
        record.upgrade_v4_to_v5(fallback_user, checksums)
    }
}

/// Removes `cert_<n>` entries from `checksums`, ordered by index, falling
/// back to the inline list when the file had none.
fn take_certificate_checksums(checksums: &mut BTreeMap<String, String>, inline: Vec<String>) -> Vec<String> {
    let mut indexed: Vec<(usize, String)> = Vec::new();
    checksums.retain(|name, sum| {
        match name
            .strip_prefix(CERT_CHECKSUM_PREFIX)
            .and_then(|index| index.parse::<usize>().ok())
        {
            Some(index) => {
                indexed.push((index, sum.clone()));
                false
            }
            None => true,
        }
    });
    if indexed.is_empty() {
        return inline;
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, sum)| sum).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classifier::DirectoryClass;

    pub(crate) fn legacy_v2_json() -> &'static str {
        r#"{
            "label": "Sample",
            "package_name": "sample.app",
            "version_name": "1.2",
            "version_code": 12,
            "source_dir": "/data/app/sample.app-1",
            "data_dirs": ["/data/user/0/sample.app", "/storage/emulated/0/Android/data/sample.app"],
            "is_system": false,
            "is_split_apk": false,
            "split_names": [],
            "split_sources": [],
            "has_rules": false,
            "backup_time": 1600000000000,
            "cert_sha256_checksum": [],
            "source_dir_sha256_checksum": "aaaa",
            "data_dirs_sha256_checksum": ["bbbb", "cccc"],
            "mode": 0,
            "version": 2
        }"#
    }

    #[test]
    fn test_parse_v2_ignores_unknown_fields() {
        let record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.package_name, "sample.app");
        assert!(record.crypto.is_none());
    }

    #[test]
    fn test_v2_to_v3_defaults() {
        let record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        let record = record.upgrade_v2_to_v3();
        assert_eq!(record.version, 3);
        assert_eq!(record.crypto.as_deref(), Some("none"));
        assert_eq!(record.key_store, Some(false));
    }

    #[test]
    fn test_full_upgrade() {
        let record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        let metadata = record.upgrade(0, BTreeMap::new());

        assert_eq!(metadata.info.version, CURRENT_BACKUP_META_VERSION);
        assert_eq!(metadata.info.owning_user, 0);
        assert_eq!(metadata.info.relative_dir, "0");
        assert_eq!(metadata.info.archive_format, "z");
        assert_eq!(metadata.info.flags, SelectionFlags::LEGACY_DEFAULT.bits());
        assert_eq!(metadata.descriptor.instance_name, None);
        assert_eq!(metadata.descriptor.apk_name, "base.apk");
        assert_eq!(metadata.descriptor.installer_id, None);
        assert_eq!(metadata.descriptor.binary_archive.as_deref(), Some("source.tar.gz"));

        let dirs = &metadata.descriptor.data_directories;
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[0].classification, DirectoryClass::InternalCredentialProtected);
        assert!(dirs[0].directly_reachable);
        assert_eq!(dirs[1].classification, DirectoryClass::ExternalAppPrivate);
        assert!(!dirs[1].directly_reachable);
        assert_eq!(dirs[1].entries, None);

        assert_eq!(metadata.descriptor.checksums["source.tar.gz"], "aaaa");
        assert_eq!(metadata.descriptor.checksums["data1.tar.gz"], "cccc");
        metadata.validate().unwrap();
    }

    #[test]
    fn test_checksums_file_takes_precedence() {
        let record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        let mut checksums = BTreeMap::new();
        checksums.insert("data0.tar.gz".to_string(), "ffff".to_string());
        let metadata = record.upgrade(0, checksums);
        assert_eq!(metadata.descriptor.checksums["data0.tar.gz"], "ffff");
    }

    #[test]
    fn test_certificate_checksums_leave_file_checksums() {
        let mut record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        record.cert_sha256_checksum = vec!["inline".to_string()];
        let metadata = record.clone().upgrade(0, BTreeMap::new());
        assert_eq!(metadata.descriptor.certificate_checksums, vec!["inline"]);

        let mut checksums = BTreeMap::new();
        checksums.insert("cert_1".to_string(), "second".to_string());
        checksums.insert("cert_0".to_string(), "first".to_string());
        checksums.insert("data0.tar.gz".to_string(), "ffff".to_string());
        let metadata = record.upgrade(0, checksums);
        assert_eq!(metadata.descriptor.certificate_checksums, vec!["first", "second"]);
        assert!(!metadata.descriptor.checksums.keys().any(|name| name.starts_with("cert_")));
        assert_eq!(metadata.descriptor.checksums["data0.tar.gz"], "ffff");
        assert!(!metadata.descriptor.has_misc_payload);
    }

    #[test]
    fn test_misc_payload_detected_from_checksums() {
        let mut record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        record.version = 4;
        record.crypto = Some("aes".to_string());
        let mut checksums = BTreeMap::new();
        checksums.insert("misc.am.tsv.aes".to_string(), "dddd".to_string());
        let metadata = record.upgrade(0, checksums);
        assert!(metadata.descriptor.has_misc_payload);
        assert_eq!(metadata.misc_payload().unwrap().as_deref(), Some("misc.am.tsv.aes"));
    }

    #[test]
    fn test_user_handle_and_fallback() {
        let mut record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        assert_eq!(record.clone().upgrade(10, BTreeMap::new()).info.owning_user, 10);

        record.user_handle = Some(11);
        let metadata = record.upgrade(10, BTreeMap::new());
        assert_eq!(metadata.info.owning_user, 11);
        assert_eq!(metadata.info.relative_dir, "11");
    }

    #[test]
    fn test_v4_keeps_installer_and_crypto() {
        let mut record: LegacyMetadata = serde_json::from_str(legacy_v2_json()).unwrap();
        record.version = 4;
        record.crypto = Some("aes".to_string());
        record.key_store = Some(true);
        record.installer = Some("store.app".to_string());
        record.tar_type = Some("zst".to_string());

        let metadata = record.upgrade(0, BTreeMap::new());
        assert_eq!(metadata.info.crypto, "aes");
        assert!(metadata.descriptor.has_keystore_payload);
        assert_eq!(metadata.descriptor.installer_id.as_deref(), Some("store.app"));
        assert_eq!(
            metadata.descriptor.data_directories[0].archive,
            "data0.tar.zst.aes"
        );
    }
}
