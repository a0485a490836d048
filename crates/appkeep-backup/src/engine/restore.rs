//! Restoring instances onto the live filesystem.
//!
//! A restore runs in four stages:
//! 1. read and plan: metadata, codec, remapped target paths, signing certificates
//! 2. stage: unpack every archive into scratch space, checking checksums
//! 3. install binaries through the package manager
//! 4. apply: swap data directories, write keystore entries, import rules
//!    and misc settings
//!
//! Nothing on the live filesystem changes before stage 3, and stage 4 runs
//! inside a [`RestoreTransaction`] that is rolled back on failure.

use super::{BackupEngine, BatchReport};
use crate::archive::{ArchiveCodec, ArchivePart};
use crate::compression::calculate_checksum;
use crate::filters::ExclusionConfig;
use crate::flags::SelectionFlags;
use crate::layout::BackupInstanceId;
use crate::metadata::{BackupMetadata, RULES_FILENAME};
use crate::misc::{parse_misc, MiscEntry};
use crate::progress::RestoreProgress;
use crate::remap::{remap, remap_keystore};
use crate::transaction::RestoreTransaction;
use appkeep_core::{ApplicationRef, Error, Result, UserId};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Caller choices for a restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// User to restore into; defaults to the instance's owning user
    pub target_user: Option<UserId>,

    /// Parts to restore; defaults to what the instance captured
    pub flags: Option<SelectionFlags>,
}

impl RestoreOptions {
    pub fn with_target_user(mut self, user: UserId) -> Self {
        self.target_user = Some(user);
        self
    }

    pub fn with_flags(mut self, flags: SelectionFlags) -> Self {
        self.flags = Some(flags);
        self
    }
}

/// Result of restoring one instance.
#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub target_user: UserId,
    pub binaries_installed: bool,

    /// Device paths whose contents were replaced
    pub restored_dirs: Vec<String>,

    /// Device paths left alone (not selected, or captured empty)
    pub skipped_dirs: Vec<String>,

    pub keystore_entries: usize,
    pub rules_imported: bool,

    /// Misc settings the package manager accepted
    pub settings_applied: usize,
}

/// A data directory ready to be swapped in
struct StagedDir {
    device_path: String,
    target: PathBuf,
    staged: PathBuf,
}

/// Everything prepared before the live filesystem is touched
#[derive(Default)]
struct Staging {
    /// The installed package is signed differently and must go first
    replace_installed: bool,
    scratch: Vec<PathBuf>,
    apk_files: Vec<PathBuf>,
    dirs: Vec<StagedDir>,
    keystore: Vec<(PathBuf, Vec<u8>)>,
    rules: Option<String>,
    misc: Vec<MiscEntry>,
}

impl Staging {
    fn cleanup(&self) {
        for path in self.scratch.iter().chain(self.dirs.iter().map(|d| &d.staged)) {
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(path) {
                    warn!("Failed to remove scratch {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn scratch_sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.appkeep-{}-{}", name, tag, Uuid::new_v4().simple()))
}

impl BackupEngine {
    /// Restores each selected instance of `app`.
    ///
    /// Every selector is parsed before any I/O; a malformed one fails the
    /// whole call with [`Error::InvalidSelector`].
    pub async fn restore(
        &self,
        app: &ApplicationRef,
        selectors: &[String],
        options: &RestoreOptions,
    ) -> Result<BatchReport<RestoreSummary>> {
        let ids = Self::resolve_selectors(app, selectors)?;
        self.layout.app_root(&app.application_id)?;

        let mut report = BatchReport::new(app);
        for id in ids {
            let result = self.restore_instance(app, &id, options).await;
            report.push(id, result);
        }
        Ok(report)
    }

    async fn restore_instance(
        &self,
        app: &ApplicationRef,
        id: &BackupInstanceId,
        options: &RestoreOptions,
    ) -> Result<RestoreSummary> {
        let _lock = self.lock_instance(app, id).await?;
        self.cancel.check()?;

        info!("Stage 1/4: Reading metadata of {}/{}", app.application_id, id);
        let (dir, metadata) = self.read_metadata(app, id)?;
        let source_user = metadata.info.owning_user;
        let target_user = options.target_user.unwrap_or(source_user);
        let flags = options.flags.unwrap_or_else(|| metadata.info.selection_flags());

        let exclusions = ExclusionConfig::new(
            flags.contains(SelectionFlags::EXCLUDE_CACHE),
            &self.options.extra_exclusions,
        )?;
        let codec = self.codec_for_tags(
            &metadata.info.archive_format,
            &metadata.info.crypto,
            exclusions,
        )?;
        let plain_codec = self.codec_for_tags(
            &metadata.info.archive_format,
            &metadata.info.crypto,
            ExclusionConfig::new(false, &[])?,
        )?;

        let mut summary = RestoreSummary {
            target_user,
            ..Default::default()
        };
        let plan = self.plan_data_dirs(&metadata, flags, source_user, target_user, &mut summary)?;
        let replace_installed = self.check_signatures(&metadata, flags, target_user).await?;

        info!("Stage 2/4: Unpacking archives");
        let mut staging = Staging {
            replace_installed,
            ..Default::default()
        };
        if let Err(e) = self.stage(
            &dir, &metadata, flags, &codec, &plain_codec, plan, source_user, target_user,
            &mut staging,
        ) {
            staging.cleanup();
            return Err(e);
        }

        let result = self
            .apply(app, &metadata, flags, target_user, &mut staging, &mut summary)
            .await;
        staging.cleanup();
        result?;

        info!(
            "Restored {}/{} into user {} ({} directories)",
            app.application_id,
            id,
            target_user,
            summary.restored_dirs.len()
        );
        Ok(summary)
    }

    /// Computes target paths for the selected data directories.
    ///
    /// Runs before any I/O so a path that cannot be remapped aborts the
    /// instance without touching anything.
    fn plan_data_dirs(
        &self,
        metadata: &BackupMetadata,
        flags: SelectionFlags,
        source_user: UserId,
        target_user: UserId,
        summary: &mut RestoreSummary,
    ) -> Result<Vec<(usize, String, PathBuf)>> {
        let mut plan = Vec::new();
        for (index, dir) in metadata.descriptor.data_directories.iter().enumerate() {
            if !flags.contains(dir.classification.selection_flag()) {
                debug!("Not selected for restore: {}", dir.original_path);
                summary.skipped_dirs.push(dir.original_path.clone());
                continue;
            }
            if dir.is_empty_capture() {
                debug!("Nothing captured for {}", dir.original_path);
                summary.skipped_dirs.push(dir.original_path.clone());
                continue;
            }
            let device_path = remap(&dir.original_path, source_user, target_user)?;
            let target = self.storage.resolve(&device_path)?;
            plan.push((index, device_path, target));
        }
        Ok(plan)
    }

    /// Compares the captured signing certificates with the installed package.
    ///
    /// Returns true when the installed package has to be removed before the
    /// captured binaries can go in. Every captured certificate must be among
    /// the installed ones; a mismatch fails unless
    /// [`SelectionFlags::NO_SIGNATURE_CHECK`] is set.
    async fn check_signatures(
        &self,
        metadata: &BackupMetadata,
        flags: SelectionFlags,
        target_user: UserId,
    ) -> Result<bool> {
        let descriptor = &metadata.descriptor;
        if !flags.contains(SelectionFlags::BINARIES) || descriptor.binary_archive.is_none() {
            return Ok(false);
        }
        let target_app = ApplicationRef {
            application_id: descriptor.application_id.clone(),
            user: target_user,
        };
        let Ok(installed) = self.packages.snapshot(&target_app).await else {
            return Ok(false);
        };

        let signed_alike = descriptor.certificate_checksums.iter().all(|captured| {
            installed
                .certificate_checksums
                .iter()
                .any(|current| current.eq_ignore_ascii_case(captured))
        });
        if signed_alike {
            return Ok(false);
        }
        if flags.contains(SelectionFlags::NO_SIGNATURE_CHECK) {
            warn!(
                "Signing certificates of {} differ from the backup, reinstalling",
                target_app
            );
            return Ok(true);
        }
        Err(Error::integrity_violation(
            &metadata.info.relative_dir,
            format!("signing certificates differ from installed {}", target_app),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn stage(
        &self,
        dir: &Path,
        metadata: &BackupMetadata,
        flags: SelectionFlags,
        codec: &ArchiveCodec,
        plain_codec: &ArchiveCodec,
        plan: Vec<(usize, String, PathBuf)>,
        source_user: UserId,
        target_user: UserId,
        staging: &mut Staging,
    ) -> Result<()> {
        let descriptor = &metadata.descriptor;
        let instance = metadata.info.relative_dir.as_str();
        let checksum_of = |file: &str| -> Result<&String> {
            descriptor.checksums.get(file).ok_or_else(|| {
                Error::integrity_violation(instance, format!("no checksum recorded for {}", file))
            })
        };

        let keystore_archive = metadata
            .keystore_archive()?
            .filter(|_| flags.contains(SelectionFlags::INTERNAL_DATA));
        let binary_archive = descriptor
            .binary_archive
            .as_ref()
            .filter(|_| flags.contains(SelectionFlags::BINARIES));

        let mut progress = self.options.show_progress.then(RestoreProgress::new);
        if let Some(progress) = progress.as_mut() {
            let total = plan.len()
                + usize::from(binary_archive.is_some())
                + usize::from(keystore_archive.is_some());
            progress.start_extract(total as u64, "Unpacking");
        }

        let scratch_root = self.layout.app_root(&descriptor.application_id)?;

        if let Some(archive) = binary_archive {
            self.cancel.check()?;
            let scratch = scratch_root.join(format!(".restore-{}", Uuid::new_v4().simple()));
            staging.scratch.push(scratch.clone());
            plain_codec.unpack(&metadata.archive_parts(dir, archive)?, &scratch)?;
            staging.apk_files = WalkDir::new(&scratch)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("apk"))
                .map(|e| e.into_path())
                .collect();
            if let Some(progress) = &progress {
                progress.inc_extract(archive);
            }
        }

        for (index, device_path, target) in plan {
            self.cancel.check()?;
            let archive = &descriptor.data_directories[index].archive;
            let staged = scratch_sibling(&target, "stage");
            if let Some(parent) = staged.parent() {
                fs::create_dir_all(parent)?;
            }
            staging.dirs.push(StagedDir {
                device_path,
                target,
                staged: staged.clone(),
            });
            let entries = codec.unpack(&metadata.archive_parts(dir, archive)?, &staged)?;
            debug!("Staged {} ({} entries)", archive, entries);
            if let Some(progress) = &progress {
                progress.inc_extract(archive);
            }
        }

        if let Some(archive) = keystore_archive {
            self.cancel.check()?;
            let scratch = scratch_root.join(format!(".keystore-{}", Uuid::new_v4().simple()));
            staging.scratch.push(scratch.clone());
            plain_codec.unpack(&metadata.archive_parts(dir, &archive)?, &scratch)?;
            for entry in WalkDir::new(&scratch).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&scratch) else {
                    continue;
                };
                let device_path = format!("/{}", relative.to_string_lossy());
                let remapped = remap_keystore(&device_path, source_user, target_user);
                let target = self.storage.resolve(&remapped)?;
                staging.keystore.push((target, fs::read(entry.path())?));
            }
            if let Some(progress) = &progress {
                progress.inc_extract(&archive);
            }
        }

        if flags.contains(SelectionFlags::RULES) && descriptor.has_rules_payload {
            let path = dir.join(RULES_FILENAME);
            if !path.is_file() {
                return Err(Error::integrity_violation(instance, "rules payload is missing"));
            }
            let expected = checksum_of(RULES_FILENAME)?;
            let actual = calculate_checksum(&path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::checksum_mismatch(RULES_FILENAME, expected.as_str(), actual));
            }
            staging.rules = Some(fs::read_to_string(&path)?);
        }

        let misc_payload = metadata
            .misc_payload()?
            .filter(|_| flags.contains(SelectionFlags::EXTRAS));
        if let Some(name) = misc_payload {
            let path = dir.join(&name);
            if !path.is_file() {
                return Err(Error::integrity_violation(instance, "misc payload is missing"));
            }
            let part = ArchivePart::new(path, checksum_of(&name)?.as_str());
            let content = plain_codec.read_sealed_payload(&part)?;
            staging.misc = parse_misc(&String::from_utf8_lossy(&content));
            debug!("Staged {} settings from {}", staging.misc.len(), name);
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish_extract("Archives unpacked");
        }
        Ok(())
    }

    async fn apply(
        &self,
        app: &ApplicationRef,
        metadata: &BackupMetadata,
        flags: SelectionFlags,
        target_user: UserId,
        staging: &mut Staging,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        let application_id = metadata.descriptor.application_id.as_str();
        self.cancel.check()?;

        if !staging.apk_files.is_empty() {
            info!("Stage 3/4: Installing binaries for user {}", target_user);
            if staging.replace_installed {
                let installed = ApplicationRef {
                    application_id: application_id.to_string(),
                    user: target_user,
                };
                self.packages.uninstall(&installed).await?;
            }
            self.packages
                .install(
                    application_id,
                    target_user,
                    &staging.apk_files,
                    &metadata.descriptor.certificate_checksums,
                    flags,
                )
                .await?;
            summary.binaries_installed = true;
        }

        info!("Stage 4/4: Applying data");
        let mut tx = RestoreTransaction::begin(format!("{}@{}", application_id, target_user));
        let applied = self.apply_in_transaction(app, target_user, staging, summary, &mut tx).await;
        match applied {
            Ok(()) => tx.commit().await,
            Err(e) => {
                summary.restored_dirs.clear();
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn apply_in_transaction(
        &self,
        app: &ApplicationRef,
        target_user: UserId,
        staging: &mut Staging,
        summary: &mut RestoreSummary,
        tx: &mut RestoreTransaction,
    ) -> Result<()> {
        for dir in &staging.dirs {
            self.cancel.check()?;
            tx.replace_directory(&dir.staged, &dir.target).await?;
            summary.restored_dirs.push(dir.device_path.clone());
        }

        for (target, content) in &staging.keystore {
            tx.write_file(target, content).await?;
            summary.keystore_entries += 1;
        }

        if let Some(rules) = staging.rules.take() {
            let target_app = ApplicationRef {
                application_id: app.application_id.clone(),
                user: target_user,
            };
            self.packages.import_rules(&target_app, &rules).await?;
            summary.rules_imported = true;
        }

        if !staging.misc.is_empty() {
            let target_app = ApplicationRef {
                application_id: app.application_id.clone(),
                user: target_user,
            };
            summary.settings_applied = self.packages.import_misc(&target_app, &staging.misc).await?;
        }
        Ok(())
    }
}
