//! Reading, writing and migrating metadata records in an instance directory.

use super::{
    checksums, BackupInfo, BackupDescriptor, BackupMetadata, LegacyMetadata, MetadataRecord,
    CHECKSUMS_FILENAME, CURRENT_BACKUP_META_VERSION, INFO_FILENAME, LEGACY_META_FILENAME,
    META_FILENAME, MIN_SUPPORTED_META_VERSION,
};
use crate::layout::BackupInstanceId;
use appkeep_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Metadata persistence for instance directories.
pub struct MetadataStore;

impl MetadataStore {
    /// True when `dir` holds a record of either shape
    pub fn exists(dir: &Path) -> bool {
        dir.join(INFO_FILENAME).is_file() || dir.join(LEGACY_META_FILENAME).is_file()
    }

    /// Reads the record in `dir` without normalizing it.
    pub fn read(dir: &Path) -> Result<MetadataRecord> {
        if !dir.is_dir() {
            return Err(Error::instance_not_found(dir.display().to_string()));
        }

        let info_path = dir.join(INFO_FILENAME);
        if info_path.is_file() {
            let version = read_json::<VersionHeader>(&info_path)?.version;
            if version != CURRENT_BACKUP_META_VERSION {
                return Err(Error::metadata_corrupt(
                    path_str(&info_path),
                    format!("unsupported schema version {}", version),
                ));
            }
            let meta_path = dir.join(META_FILENAME);
            if !meta_path.is_file() {
                return Err(Error::metadata_corrupt(
                    path_str(&meta_path),
                    "descriptor missing",
                ));
            }
            let metadata = BackupMetadata {
                info: read_json::<BackupInfo>(&info_path)?,
                descriptor: read_json::<BackupDescriptor>(&meta_path)?,
            };
            return Ok(MetadataRecord::Current(metadata));
        }

        let legacy_path = dir.join(LEGACY_META_FILENAME);
        if legacy_path.is_file() {
            let version = read_json::<VersionHeader>(&legacy_path)?.version;
            if version < MIN_SUPPORTED_META_VERSION {
                return Err(Error::metadata_corrupt(
                    path_str(&legacy_path),
                    format!("schema version {} is no longer supported", version),
                ));
            }
            if version >= CURRENT_BACKUP_META_VERSION {
                return Err(Error::metadata_corrupt(
                    path_str(&legacy_path),
                    format!("flat record claims schema version {}", version),
                ));
            }
            let record = read_json::<LegacyMetadata>(&legacy_path)?;

            let checksums_path = dir.join(CHECKSUMS_FILENAME);
            let checksums = if checksums_path.is_file() {
                checksums::parse(&fs::read_to_string(&checksums_path)?, &path_str(&checksums_path))?
            } else {
                BTreeMap::new()
            };
            return Ok(MetadataRecord::Legacy { record, checksums });
        }

        Err(Error::metadata_corrupt(path_str(dir), "no metadata record"))
    }

    /// Reads and normalizes the record of instance `id` stored in `dir`.
    ///
    /// Legacy records take their instance name and relative directory from `id`.
    pub fn read_instance(dir: &Path, id: &BackupInstanceId) -> Result<BackupMetadata> {
        let record = Self::read(dir)?;
        let legacy = record.is_legacy();
        let mut metadata = record.into_current(id.user);

        if legacy {
            debug!("Upgraded legacy record in {}", dir.display());
            metadata.descriptor.instance_name = id.name.clone();
            metadata.info.relative_dir = id.relative_dir();
        }
        metadata.validate()?;

        if metadata.instance_id() != *id {
            return Err(Error::metadata_corrupt(
                path_str(dir),
                format!(
                    "record describes instance {} but is stored as {}",
                    metadata.instance_id(),
                    id
                ),
            ));
        }
        Ok(metadata)
    }

    /// Writes a current-shape record.
    ///
    /// Each file is written to a temporary sibling and renamed into place;
    /// the Info file goes last since its presence marks the record current.
    pub fn write(dir: &Path, metadata: &BackupMetadata) -> Result<()> {
        metadata.validate()?;
        write_json_atomic(dir, META_FILENAME, &metadata.descriptor)?;
        write_json_atomic(dir, INFO_FILENAME, &metadata.info)?;
        Ok(())
    }

    /// Rewrites a legacy record in the current shape.
    ///
    /// Returns `false` when the record was already current.
    pub fn migrate(dir: &Path, id: &BackupInstanceId) -> Result<bool> {
        if !Self::read(dir)?.is_legacy() {
            return Ok(false);
        }
        let metadata = Self::read_instance(dir, id)?;
        Self::write(dir, &metadata)?;

        fs::remove_file(dir.join(LEGACY_META_FILENAME))?;
        let checksums_path = dir.join(CHECKSUMS_FILENAME);
        if checksums_path.is_file() {
            fs::remove_file(checksums_path)?;
        }
        info!("Migrated {} to schema {}", dir.display(), CURRENT_BACKUP_META_VERSION);
        Ok(true)
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Err(Error::metadata_corrupt(path_str(path), "empty record"));
    }
    serde_json::from_str(&content).map_err(|e| Error::metadata_corrupt(path_str(path), e.to_string()))
}

fn write_json_atomic<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(&json)?;
    temp.as_file().sync_all()?;
    temp.persist(dir.join(file_name)).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::legacy::tests::legacy_v2_json;
    use crate::metadata::tests::sample_metadata;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_current() {
        let temp = TempDir::new().unwrap();
        let metadata = sample_metadata();
        MetadataStore::write(temp.path(), &metadata).unwrap();

        assert!(temp.path().join(INFO_FILENAME).is_file());
        assert!(temp.path().join(META_FILENAME).is_file());
        let read = MetadataStore::read_instance(temp.path(), &BackupInstanceId::base(0)).unwrap();
        assert_eq!(read, metadata);
    }

    #[test]
    fn test_missing_dir_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = MetadataStore::read(&temp.path().join("0")).unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound { .. }));
    }

    #[test]
    fn test_empty_dir_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let err = MetadataStore::read(temp.path()).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_empty_info_is_corrupt() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(INFO_FILENAME), "").unwrap();
        let err = MetadataStore::read(temp.path()).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_missing_descriptor_is_corrupt() {
        let temp = TempDir::new().unwrap();
        MetadataStore::write(temp.path(), &sample_metadata()).unwrap();
        fs::remove_file(temp.path().join(META_FILENAME)).unwrap();
        let err = MetadataStore::read(temp.path()).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_alpha_schema_rejected() {
        let temp = TempDir::new().unwrap();
        let json = legacy_v2_json().replace("\"version\": 2", "\"version\": 1");
        fs::write(temp.path().join(LEGACY_META_FILENAME), json).unwrap();
        let err = MetadataStore::read(temp.path()).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_legacy_named_instance_takes_name_from_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(LEGACY_META_FILENAME), legacy_v2_json()).unwrap();

        let id = BackupInstanceId::named(0, "weekly");
        let metadata = MetadataStore::read_instance(temp.path(), &id).unwrap();
        assert_eq!(metadata.descriptor.instance_name.as_deref(), Some("weekly"));
        assert_eq!(metadata.info.relative_dir, "0_weekly");
    }

    #[test]
    fn test_stored_under_wrong_dir_is_corrupt() {
        let temp = TempDir::new().unwrap();
        MetadataStore::write(temp.path(), &sample_metadata()).unwrap();
        let err = MetadataStore::read_instance(temp.path(), &BackupInstanceId::base(10)).unwrap_err();
        assert!(matches!(err, Error::MetadataCorrupt { .. }));
    }

    #[test]
    fn test_migrate_legacy() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(LEGACY_META_FILENAME), legacy_v2_json()).unwrap();
        fs::write(temp.path().join(CHECKSUMS_FILENAME), "ffff\tdata0.tar.gz\n").unwrap();

        let id = BackupInstanceId::base(0);
        assert!(MetadataStore::migrate(temp.path(), &id).unwrap());
        assert!(!temp.path().join(LEGACY_META_FILENAME).exists());
        assert!(!temp.path().join(CHECKSUMS_FILENAME).exists());

        let record = MetadataStore::read(temp.path()).unwrap();
        assert!(!record.is_legacy());
        let metadata = record.into_current(0);
        assert_eq!(metadata.descriptor.checksums["data0.tar.gz"], "ffff");

        assert!(!MetadataStore::migrate(temp.path(), &id).unwrap());
    }
}
