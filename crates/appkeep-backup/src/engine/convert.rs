//! Importing backups written by OAndBackup.
//!
//! An OAndBackup directory is named after the package and holds:
//!
//! ```text
//! <package>.log                      JSON description
//! <apk name>                         base APK, when binaries were saved
//! <package>.zip                      internal data, entries under `<package>/`
//! external_files/<package>.zip       app-private shared storage
//! ```
//!
//! The import becomes a named instance `OAndBackup` of the current layout,
//! packed with the engine's own format and crypto mode.

use super::backup::{discard_dir, BackupSummary};
use super::BackupEngine;
use crate::archive::{ArchiveCodec, ArchiveConfig, PackedArchive};
use crate::classifier::classify;
use crate::compression::CHECKSUM_ALGORITHM;
use crate::crypto::{CryptoCodec, CryptoMode};
use crate::filters::ExclusionConfig;
use crate::flags::SelectionFlags;
use crate::layout::BackupInstanceId;
use crate::metadata::{
    BackupDescriptor, BackupInfo, BackupMetadata, DataDirectoryDescriptor, MetadataStore,
    CURRENT_BACKUP_META_VERSION, DATA_PREFIX, SOURCE_PREFIX,
};
use appkeep_core::{ApplicationRef, Error, Result, UserId};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Instance name given to imported backups
pub const OANDBACKUP_INSTANCE: &str = "OAndBackup";

const EXTERNAL_FILES_DIR: &str = "external_files";

/// Device-wide backups OAndBackup keeps next to the per-app ones
const SPECIAL_BACKUPS: &[&str] = &[
    "accounts",
    "appwidgets",
    "bluetooth",
    "data.usage.policy",
    "wallpaper",
    "wifi.access.points",
];

const MODE_APK: u32 = 1;
const MODE_DATA: u32 = 2;
const MODE_BOTH: u32 = 3;

/// The `<package>.log` record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OandbackupLog {
    label: String,
    package_name: String,
    version_name: String,
    version_code: i64,
    #[serde(default)]
    is_system: bool,
    last_backup_millis: i64,
    #[serde(default)]
    is_encrypted: bool,
    source_dir: String,
    #[serde(default)]
    backup_mode: u32,
}

/// What an OAndBackup directory offers.
struct OandbackupSource {
    location: PathBuf,
    log: OandbackupLog,
    apk_name: String,
    flags: SelectionFlags,
}

impl OandbackupSource {
    fn open(location: &Path) -> Result<Self> {
        let application_id = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::invalid_selector(location.display().to_string(), "not a package directory")
            })?;
        if SPECIAL_BACKUPS.contains(&application_id.as_str()) {
            return Err(Error::invalid_selector(
                application_id,
                "device-wide backups cannot be imported",
            ));
        }

        let log_path = location.join(format!("{}.log", application_id));
        let content = fs::read_to_string(&log_path)?;
        let log: OandbackupLog = serde_json::from_str(&content)
            .map_err(|e| Error::metadata_corrupt(log_path.display().to_string(), e.to_string()))?;
        if log.package_name != application_id {
            return Err(Error::metadata_corrupt(
                log_path.display().to_string(),
                format!("record belongs to {}", log.package_name),
            ));
        }
        if log.is_encrypted {
            // OAndBackup seals with OpenPGP
            return Err(Error::unsupported_crypto_mode(CryptoMode::OpenPgp.tag()));
        }

        let apk_name = Path::new(&log.source_dir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "base.apk".to_string());
        let missing =
            |what: &str| Error::integrity_violation(location.display().to_string(), what);

        if !matches!(log.backup_mode, MODE_APK | MODE_DATA | MODE_BOTH) {
            return Err(missing("backup holds neither binaries nor data"));
        }
        let mut source = Self {
            location: location.to_path_buf(),
            log,
            apk_name,
            flags: SelectionFlags::MULTIPLE,
        };
        if matches!(source.log.backup_mode, MODE_APK | MODE_BOTH) {
            if !location.join(&source.apk_name).is_file() {
                return Err(missing("binaries were recorded but the APK is missing"));
            }
            source.flags |= SelectionFlags::BINARIES;
        }
        if matches!(source.log.backup_mode, MODE_DATA | MODE_BOTH) {
            if source.internal_zip().is_file() {
                source.flags |= SelectionFlags::INTERNAL_DATA;
            }
            if source.external_zip().is_file() {
                source.flags |= SelectionFlags::EXTERNAL_DATA;
            }
            if !source
                .flags
                .intersects(SelectionFlags::INTERNAL_DATA | SelectionFlags::EXTERNAL_DATA)
            {
                return Err(missing("data was recorded but no data archive exists"));
            }
            source.flags |= SelectionFlags::EXCLUDE_CACHE;
        }
        Ok(source)
    }

    fn internal_zip(&self) -> PathBuf {
        self.location.join(format!("{}.zip", self.log.package_name))
    }

    fn external_zip(&self) -> PathBuf {
        self.location
            .join(EXTERNAL_FILES_DIR)
            .join(format!("{}.zip", self.log.package_name))
    }

    /// Data zips with the device directory each one came from
    fn data_zips(&self, user: UserId) -> Vec<(PathBuf, String)> {
        let package = &self.log.package_name;
        let mut zips = Vec::new();
        if self.flags.contains(SelectionFlags::INTERNAL_DATA) {
            zips.push((self.internal_zip(), format!("/data/user/{}/{}", user, package)));
        }
        if self.flags.contains(SelectionFlags::EXTERNAL_DATA) {
            zips.push((
                self.external_zip(),
                format!("/storage/emulated/{}/Android/data/{}", user, package),
            ));
        }
        zips
    }
}

/// Extracts a data zip into `dest`, dropping the leading `<package>/` directory.
fn extract_data_zip(zip_path: &Path, package: &str, dest: &Path) -> Result<u64> {
    let file = BufReader::new(File::open(zip_path)?);
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        Error::integrity_violation(zip_path.display().to_string(), format!("invalid zip: {}", e))
    })?;
    fs::create_dir_all(dest)?;

    let mut count = 0u64;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| {
            Error::integrity_violation(
                zip_path.display().to_string(),
                format!("entry {}: {}", index, e),
            )
        })?;
        let Some(name) = entry.enclosed_name() else {
            debug!("Skipped zip entry outside destination: {}", entry.name());
            continue;
        };
        let relative = name.strip_prefix(package).unwrap_or(name.as_path()).to_path_buf();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}

impl BackupEngine {
    /// Imports the OAndBackup directory at `location` as an instance owned by `user`.
    ///
    /// An earlier import of the same package is replaced. Signing
    /// certificates are not recorded since OAndBackup never stored them.
    pub async fn import_oandbackup(&self, location: &Path, user: UserId) -> Result<BackupSummary> {
        let start_time = Instant::now();
        let source = OandbackupSource::open(location)?;
        let app = ApplicationRef::new(&source.log.package_name, user)?;
        let id = BackupInstanceId::named(user, OANDBACKUP_INSTANCE);

        let _lock = self.lock_instance(&app, &id).await?;
        self.cancel.check()?;
        info!("Importing {} from {} ({})", app, location.display(), source.flags);

        let crypto = CryptoCodec::for_mode(self.options.crypto_mode, self.keys.as_deref())?;
        let temp_dir = self.layout.create_temp_instance_dir(&app.application_id, &id)?;
        let scratch = self
            .layout
            .app_root(&app.application_id)?
            .join(format!(".import-{}", Uuid::new_v4().simple()));

        let converted = self
            .convert_oandbackup(&source, user, &crypto, &temp_dir, &scratch)
            .and_then(|(metadata, archives)| {
                MetadataStore::write(&temp_dir, &metadata)?;
                Ok((metadata, archives))
            });
        if scratch.exists() {
            discard_dir(&scratch);
        }
        let (metadata, archives) = match converted {
            Ok(done) => done,
            Err(e) => {
                discard_dir(&temp_dir);
                return Err(e);
            }
        };

        let instance_dir = match self.commit_instance(&app.application_id, &id, &temp_dir) {
            Ok(dir) => dir,
            Err(e) => {
                discard_dir(&temp_dir);
                return Err(e);
            }
        };
        self.refresh_catalog(&app.application_id);

        info!("Imported {} into {}", app, instance_dir.display());
        Ok(BackupSummary {
            instance_dir,
            archives,
            metadata,
            duration_seconds: start_time.elapsed().as_secs_f64(),
        })
    }

    fn convert_oandbackup(
        &self,
        source: &OandbackupSource,
        user: UserId,
        crypto: &CryptoCodec,
        temp_dir: &Path,
        scratch: &Path,
    ) -> Result<(BackupMetadata, Vec<PackedArchive>)> {
        let config = ArchiveConfig::new(self.options.archive_format)?
            .with_compression_level(self.options.compression_level);
        let mut archives = Vec::new();
        let mut checksums = BTreeMap::new();

        let mut binary_archive = None;
        if source.flags.contains(SelectionFlags::BINARIES) {
            self.cancel.check()?;
            let apk = source.location.join(&source.apk_name);
            let packed = ArchiveCodec::new(config.clone(), crypto.clone()).pack_files(
                &[(apk, source.apk_name.clone())],
                temp_dir,
                SOURCE_PREFIX,
            )?;
            binary_archive = Some(packed.file_name.clone());
            checksums.insert(packed.file_name.clone(), packed.checksum.clone());
            archives.push(packed);
        }

        let data_codec = ArchiveCodec::new(
            config.with_exclusions(ExclusionConfig::new(true, &self.options.extra_exclusions)?),
            crypto.clone(),
        );
        let mut data_directories = Vec::new();
        for (index, (zip_path, device_path)) in source.data_zips(user).into_iter().enumerate() {
            self.cancel.check()?;
            let unpacked = scratch.join(index.to_string());
            let files = extract_data_zip(&zip_path, &source.log.package_name, &unpacked)?;
            let packed =
                data_codec.pack_directory(&unpacked, temp_dir, &format!("{}{}", DATA_PREFIX, index))?;
            debug!("{} -> {} ({} files)", zip_path.display(), packed.file_name, files);

            let classification = classify(&device_path, user);
            data_directories.push(DataDirectoryDescriptor {
                original_path: device_path,
                classification: classification.class,
                directly_reachable: classification.directly_reachable,
                archive: packed.file_name.clone(),
                entries: Some(packed.entries),
            });
            checksums.insert(packed.file_name.clone(), packed.checksum.clone());
            archives.push(packed);
        }

        let id = BackupInstanceId::named(user, OANDBACKUP_INSTANCE);
        let log = &source.log;
        let metadata = BackupMetadata {
            info: BackupInfo {
                version: CURRENT_BACKUP_META_VERSION,
                owning_user: user,
                relative_dir: id.relative_dir(),
                crypto: crypto.mode().tag().to_string(),
                archive_format: self.options.archive_format.tag().to_string(),
                checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
                created_at: Utc
                    .timestamp_millis_opt(log.last_backup_millis)
                    .single()
                    .unwrap_or_default(),
                flags: source.flags.bits(),
            },
            descriptor: BackupDescriptor {
                version: CURRENT_BACKUP_META_VERSION,
                application_id: log.package_name.clone(),
                display_name: log.label.clone(),
                version_name: log.version_name.clone(),
                version_code: log.version_code,
                is_system_app: log.is_system,
                is_split_apk: false,
                split_configs: Vec::new(),
                has_rules_payload: false,
                has_keystore_payload: false,
                has_misc_payload: false,
                installer_id: None,
                instance_name: id.name.clone(),
                binary_archive,
                apk_name: source.apk_name.clone(),
                instruction_set: None,
                data_directories,
                checksums,
                certificate_checksums: Vec::new(),
            },
        };
        Ok((metadata, archives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_json(mode: u32) -> String {
        format!(
            r#"{{"label":"Sample","packageName":"sample.app","versionName":"1.0","versionCode":3,
                "lastBackupMillis":1600000000000,"sourceDir":"/data/app/sample.app-1/base.apk",
                "backupMode":{}}}"#,
            mode
        )
    }

    fn source_dir(mode: u32) -> TempDir {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sample.app");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("sample.app.log"), log_json(mode)).unwrap();
        temp
    }

    #[test]
    fn test_apk_only_source() {
        let temp = source_dir(MODE_APK);
        let location = temp.path().join("sample.app");
        fs::write(location.join("base.apk"), b"apk").unwrap();

        let source = OandbackupSource::open(&location).unwrap();
        assert_eq!(source.flags, SelectionFlags::MULTIPLE | SelectionFlags::BINARIES);
        assert_eq!(source.apk_name, "base.apk");
        assert!(source.data_zips(0).is_empty());
    }

    #[test]
    fn test_missing_payloads_rejected() {
        let temp = source_dir(MODE_BOTH);
        let location = temp.path().join("sample.app");
        assert!(matches!(
            OandbackupSource::open(&location),
            Err(Error::IntegrityViolation { .. })
        ));

        let temp = source_dir(0);
        assert!(OandbackupSource::open(&temp.path().join("sample.app")).is_err());
    }

    #[test]
    fn test_special_and_encrypted_backups_rejected() {
        let temp = TempDir::new().unwrap();
        let wallpaper = temp.path().join("wallpaper");
        fs::create_dir_all(&wallpaper).unwrap();
        assert!(matches!(
            OandbackupSource::open(&wallpaper),
            Err(Error::InvalidSelector { .. })
        ));

        let temp = source_dir(MODE_APK);
        let location = temp.path().join("sample.app");
        let encrypted = log_json(MODE_APK).replace("\"backupMode\"", "\"isEncrypted\":true,\"backupMode\"");
        fs::write(location.join("sample.app.log"), encrypted).unwrap();
        assert!(matches!(
            OandbackupSource::open(&location),
            Err(Error::UnsupportedCryptoMode { .. })
        ));
    }
}
