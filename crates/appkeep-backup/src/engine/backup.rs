//! Capturing new backup instances.

use super::{BackupEngine, BatchReport};
use crate::archive::{write_payload, ArchiveCodec, ArchiveConfig, PackedArchive};
use crate::classifier::classify;
use crate::compression::CHECKSUM_ALGORITHM;
use crate::crypto::CryptoCodec;
use crate::filters::ExclusionConfig;
use crate::flags::SelectionFlags;
use crate::layout::{sanitize_backup_name, BackupInstanceId};
use crate::metadata::{
    misc_file_name, BackupDescriptor, BackupInfo, BackupMetadata, DataDirectoryDescriptor,
    MetadataStore, CURRENT_BACKUP_META_VERSION, DATA_PREFIX, ICON_FILENAME, KEYSTORE_PREFIX,
    RULES_FILENAME, SOURCE_PREFIX,
};
use crate::misc::render_misc;
use crate::package::InstalledPackage;
use crate::progress::BackupProgress;
use appkeep_core::{ApplicationRef, Error, Result};
use chrono::{Local, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timestamp format of generated instance names
const GENERATED_NAME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Result of capturing one instance.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    /// Final instance directory
    pub instance_dir: PathBuf,

    /// Archives written, in capture order
    pub archives: Vec<PackedArchive>,

    pub metadata: BackupMetadata,

    pub duration_seconds: f64,
}

impl BackupSummary {
    pub fn total_bytes(&self) -> u64 {
        self.archives.iter().map(|a| a.size_bytes).sum()
    }
}

/// Everything captured for one instance
#[derive(Default)]
struct Capture {
    archives: Vec<PackedArchive>,
    checksums: BTreeMap<String, String>,
    data_directories: Vec<DataDirectoryDescriptor>,
    binary_archive: Option<String>,
    has_keystore: bool,
    has_rules: bool,
    has_misc: bool,
}

impl Capture {
    fn add(&mut self, archive: PackedArchive, progress: Option<&BackupProgress>) {
        if let Some(progress) = progress {
            progress.inc_archive(&archive.file_name);
        }
        self.checksums
            .insert(archive.file_name.clone(), archive.checksum.clone());
        self.archives.push(archive);
    }
}

impl BackupEngine {
    /// Instances a backup call writes.
    ///
    /// Names are only honored with [`SelectionFlags::MULTIPLE`]; without any
    /// name a timestamp name is generated. Without MULTIPLE the base
    /// instance is written.
    pub fn backup_targets(
        app: &ApplicationRef,
        names: &[String],
        flags: SelectionFlags,
    ) -> Result<Vec<BackupInstanceId>> {
        if !flags.contains(SelectionFlags::MULTIPLE) {
            if !names.is_empty() {
                debug!("Ignoring {} instance names without the multiple flag", names.len());
            }
            return Ok(vec![BackupInstanceId::base(app.user)]);
        }

        if names.is_empty() {
            let name = Local::now().format(GENERATED_NAME_FORMAT).to_string();
            return Ok(vec![BackupInstanceId::named(app.user, name)]);
        }

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for name in names {
            let id = BackupInstanceId::named(app.user, sanitize_backup_name(name)?);
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Captures `app` into each requested instance.
    pub async fn backup(
        &self,
        app: &ApplicationRef,
        names: &[String],
        flags: SelectionFlags,
    ) -> Result<BatchReport<BackupSummary>> {
        self.layout.app_root(&app.application_id)?;
        if flags.selects_nothing() {
            return Err(Error::invalid_selector(
                flags.to_string(),
                "selection does not include anything to back up",
            ));
        }
        let targets = Self::backup_targets(app, names, flags)?;

        info!(
            "Backing up {} into {} instance(s) ({})",
            app,
            targets.len(),
            flags
        );

        let mut progress = self.options.show_progress.then(BackupProgress::new);
        let mut report = BatchReport::new(app);
        for id in targets {
            let result = self
                .backup_instance(app, &id, flags, progress.as_mut())
                .await;
            if let Some(progress) = progress.as_mut() {
                let message = match &result {
                    Ok(_) => format!("{} -> {}", app, id),
                    Err(e) => format!("{} -> {} failed: {}", app, id, e),
                };
                progress.finish_instance(&message);
            }
            report.push(id, result);
        }

        if report.successes().next().is_some() {
            self.refresh_catalog(&app.application_id);
        }
        Ok(report)
    }

    async fn backup_instance(
        &self,
        app: &ApplicationRef,
        id: &BackupInstanceId,
        flags: SelectionFlags,
        mut progress: Option<&mut BackupProgress>,
    ) -> Result<BackupSummary> {
        let start_time = Instant::now();
        let _lock = self.lock_instance(app, id).await?;
        self.cancel.check()?;

        if let Some(progress) = progress.as_deref_mut() {
            progress.start_instance(&format!("Backing up {} -> {}", app, id));
        }

        info!("Stage 1/4: Reading package state for {}", app);
        let package = self.packages.snapshot(app).await?;
        let crypto = CryptoCodec::for_mode(self.options.crypto_mode, self.keys.as_deref())?;

        let temp_dir = self
            .layout
            .create_temp_instance_dir(&app.application_id, id)?;
        debug!("Capturing into {}", temp_dir.display());

        let captured = self
            .capture(app, flags, &package, &crypto, &temp_dir, progress)
            .await;
        let capture = match captured {
            Ok(capture) => capture,
            Err(e) => {
                discard_dir(&temp_dir);
                return Err(e);
            }
        };

        info!("Stage 4/4: Writing metadata");
        let metadata = self.build_metadata(app, id, flags, &package, &crypto, &capture);
        let written = MetadataStore::write(&temp_dir, &metadata)
            .and_then(|_| self.commit_instance(&app.application_id, id, &temp_dir));
        let instance_dir = match written {
            Ok(dir) => dir,
            Err(e) => {
                discard_dir(&temp_dir);
                return Err(e);
            }
        };

        let duration_seconds = start_time.elapsed().as_secs_f64();
        info!(
            "Backed up {} to {} ({} archives) in {:.2}s",
            app,
            instance_dir.display(),
            capture.archives.len(),
            duration_seconds
        );

        Ok(BackupSummary {
            instance_dir,
            archives: capture.archives,
            metadata,
            duration_seconds,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn capture(
        &self,
        app: &ApplicationRef,
        flags: SelectionFlags,
        package: &InstalledPackage,
        crypto: &CryptoCodec,
        temp_dir: &Path,
        mut progress: Option<&mut BackupProgress>,
    ) -> Result<Capture> {
        let base_config = ArchiveConfig::new(self.options.archive_format)?
            .with_compression_level(self.options.compression_level);
        let exclusions = ExclusionConfig::new(
            flags.contains(SelectionFlags::EXCLUDE_CACHE),
            &self.options.extra_exclusions,
        )?;
        let data_codec = ArchiveCodec::new(
            base_config.clone().with_exclusions(exclusions),
            crypto.clone(),
        );

        let selected_dirs: Vec<(&String, _)> = package
            .data_dirs
            .iter()
            .map(|path| (path, classify(path, app.user)))
            .filter(|(path, classification)| {
                let selected = flags.contains(classification.class.selection_flag());
                if !selected {
                    debug!("Not selected: {} ({})", path, classification.class);
                }
                selected
            })
            .collect();
        let with_keystore =
            flags.contains(SelectionFlags::INTERNAL_DATA) && !package.keystore_files.is_empty();

        if let Some(progress) = progress.as_deref_mut() {
            let total = u64::from(flags.contains(SelectionFlags::BINARIES))
                + selected_dirs.len() as u64
                + u64::from(with_keystore);
            progress.start_archives(total, "Packing");
        }

        let mut capture = Capture::default();

        info!("Stage 2/4: Packing binaries and data directories");
        if flags.contains(SelectionFlags::BINARIES) {
            self.cancel.check()?;
            let source_dir = self.storage.resolve(&package.source_dir)?;
            if !source_dir.is_dir() {
                return Err(Error::partial_capture(
                    SOURCE_PREFIX,
                    format!("binary directory {} is missing", package.source_dir),
                ));
            }
            let mut config = base_config.clone();
            if flags.contains(SelectionFlags::BINARIES_APK_ONLY) {
                config = config.with_only_extension("apk");
            }
            let packed = ArchiveCodec::new(config, crypto.clone()).pack_directory(
                &source_dir,
                temp_dir,
                SOURCE_PREFIX,
            )?;
            if packed.entries == 0 {
                return Err(Error::partial_capture(
                    SOURCE_PREFIX,
                    format!("no binaries found in {}", package.source_dir),
                ));
            }
            capture.binary_archive = Some(packed.file_name.clone());
            capture.add(packed, progress.as_deref());
        }

        for (index, (path, classification)) in selected_dirs.into_iter().enumerate() {
            self.cancel.check()?;
            let host_path = self.storage.resolve(path)?;
            let prefix = format!("{}{}", DATA_PREFIX, index);
            let packed = data_codec.pack_directory(&host_path, temp_dir, &prefix)?;
            debug!("{} -> {} ({} entries)", path, packed.file_name, packed.entries);

            capture.data_directories.push(DataDirectoryDescriptor {
                original_path: path.clone(),
                classification: classification.class,
                directly_reachable: classification.directly_reachable,
                archive: packed.file_name.clone(),
                entries: Some(packed.entries),
            });
            capture.add(packed, progress.as_deref());
        }

        info!("Stage 3/4: Capturing keystore, rules, settings and icon");
        if with_keystore {
            self.cancel.check()?;
            let mut files = Vec::with_capacity(package.keystore_files.len());
            for device_path in &package.keystore_files {
                let host_path = self.storage.resolve(device_path)?;
                if !host_path.is_file() {
                    return Err(Error::partial_capture(
                        device_path.as_str(),
                        "keystore entry is missing",
                    ));
                }
                files.push((host_path, device_path.trim_start_matches('/').to_string()));
            }
            let packed = ArchiveCodec::new(base_config, crypto.clone()).pack_files(
                &files,
                temp_dir,
                KEYSTORE_PREFIX,
            )?;
            capture.has_keystore = true;
            capture.add(packed, progress.as_deref());
        }

        if flags.contains(SelectionFlags::RULES) {
            if let Some(rules) = self.packages.export_rules(app).await? {
                let checksum = write_payload(temp_dir, RULES_FILENAME, rules.as_bytes())?;
                capture.checksums.insert(RULES_FILENAME.to_string(), checksum);
                capture.has_rules = true;
            }
        }

        if flags.contains(SelectionFlags::EXTRAS) {
            let misc = self.packages.export_misc(app).await?;
            if !misc.is_empty() {
                let name = misc_file_name(crypto.mode());
                let checksum =
                    data_codec.write_sealed_payload(temp_dir, &name, render_misc(&misc).as_bytes())?;
                debug!("{} -> {} ({} settings)", app, name, misc.len());
                capture.checksums.insert(name, checksum);
                capture.has_misc = true;
            }

            match self.packages.icon(app).await {
                Ok(Some(icon)) => {
                    let checksum = write_payload(temp_dir, ICON_FILENAME, &icon)?;
                    capture.checksums.insert(ICON_FILENAME.to_string(), checksum);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping icon of {}: {}", app, e),
            }
        }

        Ok(capture)
    }

    fn build_metadata(
        &self,
        app: &ApplicationRef,
        id: &BackupInstanceId,
        flags: SelectionFlags,
        package: &InstalledPackage,
        crypto: &CryptoCodec,
        capture: &Capture,
    ) -> BackupMetadata {
        BackupMetadata {
            info: BackupInfo {
                version: CURRENT_BACKUP_META_VERSION,
                owning_user: id.user,
                relative_dir: id.relative_dir(),
                crypto: crypto.mode().tag().to_string(),
                archive_format: self.options.archive_format.tag().to_string(),
                checksum_algorithm: CHECKSUM_ALGORITHM.to_string(),
                created_at: Utc::now(),
                flags: flags.bits(),
            },
            descriptor: BackupDescriptor {
                version: CURRENT_BACKUP_META_VERSION,
                application_id: app.application_id.clone(),
                display_name: package.display_name.clone(),
                version_name: package.version_name.clone(),
                version_code: package.version_code,
                is_system_app: package.is_system,
                is_split_apk: package.is_split_apk(),
                split_configs: package.split_configs.clone(),
                has_rules_payload: capture.has_rules,
                has_keystore_payload: capture.has_keystore,
                has_misc_payload: capture.has_misc,
                installer_id: package.installer_id.clone(),
                instance_name: id.name.clone(),
                binary_archive: capture.binary_archive.clone(),
                apk_name: package.apk_name.clone(),
                instruction_set: package.instruction_set.clone(),
                data_directories: capture.data_directories.clone(),
                checksums: capture.checksums.clone(),
                certificate_checksums: package.certificate_checksums.clone(),
            },
        }
    }

    /// Moves a finished capture into place, replacing an older instance of the same id.
    pub(super) fn commit_instance(
        &self,
        application_id: &str,
        id: &BackupInstanceId,
        temp_dir: &Path,
    ) -> Result<PathBuf> {
        let final_dir = self.layout.instance_dir(application_id, id)?;
        if !final_dir.exists() {
            fs::rename(temp_dir, &final_dir)?;
            return Ok(final_dir);
        }

        let displaced = final_dir.with_file_name(format!(
            ".{}.old-{}",
            id.relative_dir(),
            Uuid::new_v4().simple()
        ));
        fs::rename(&final_dir, &displaced)?;
        if let Err(e) = fs::rename(temp_dir, &final_dir) {
            if let Err(restore_err) = fs::rename(&displaced, &final_dir) {
                warn!(
                    "Failed to put back previous instance {}: {}",
                    final_dir.display(),
                    restore_err
                );
            }
            return Err(e.into());
        }
        if let Err(e) = fs::remove_dir_all(&displaced) {
            warn!("Failed to remove replaced instance {}: {}", displaced.display(), e);
        }
        Ok(final_dir)
    }
}

/// Removes a scratch directory after a failed capture.
pub(super) fn discard_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to discard {}: {}", dir.display(), e);
    } else {
        debug!("Discarded {}", dir.display());
    }
}
