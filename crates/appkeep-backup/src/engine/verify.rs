//! Read-only integrity checks of stored instances.

use super::{BackupEngine, BatchReport};
use crate::archive::ArchivePart;
use crate::compression::calculate_checksum;
use crate::filters::ExclusionConfig;
use crate::layout::BackupInstanceId;
use crate::metadata::{BackupMetadata, KEYSTORE_PREFIX, RULES_FILENAME};
use crate::misc::MISC_FILENAME;
use crate::progress::RestoreProgress;
use appkeep_core::{ApplicationRef, Error, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Result of verifying one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifySummary {
    /// Archives whose checksum matched and that decoded completely
    pub archives_checked: usize,

    /// Payload files (rules, icon, misc) whose checksum matched
    pub payloads_checked: usize,

    /// Total archive entries decoded
    pub entries: u64,
}

impl BackupEngine {
    /// Verifies each selected instance of `app` without writing anything.
    ///
    /// The first problem found in an instance is reported for it.
    pub async fn verify(
        &self,
        app: &ApplicationRef,
        selectors: &[String],
    ) -> Result<BatchReport<VerifySummary>> {
        let ids = Self::resolve_selectors(app, selectors)?;
        self.layout.app_root(&app.application_id)?;

        let mut report = BatchReport::new(app);
        for id in ids {
            let result = self.verify_instance(app, &id).await;
            report.push(id, result);
        }
        Ok(report)
    }

    async fn verify_instance(&self, app: &ApplicationRef, id: &BackupInstanceId) -> Result<VerifySummary> {
        let _lock = self.lock_instance(app, id).await?;
        self.cancel.check()?;

        let (dir, metadata) = self.read_metadata(app, id)?;
        let codec = self.codec_for_tags(
            &metadata.info.archive_format,
            &metadata.info.crypto,
            ExclusionConfig::new(false, &[])?,
        )?;

        check_payload_presence(&dir, &metadata)?;

        let instance = format!("{}/{}", app.application_id, id);
        let mut stored = Vec::new();
        for archive in metadata.archive_files()? {
            let parts = metadata.archive_parts(&dir, &archive)?;
            stored.push((archive, parts));
        }
        let part_paths: HashSet<PathBuf> = stored
            .iter()
            .flat_map(|(_, parts)| parts.iter().map(|p| p.path.clone()))
            .collect();

        let mut progress = self.options.show_progress.then(RestoreProgress::new);
        if let Some(progress) = progress.as_mut() {
            progress.start_extract(stored.len() as u64, "Verifying");
        }

        let misc_payload = metadata.misc_payload()?;
        let mut summary = VerifySummary::default();
        for (file, expected) in &metadata.descriptor.checksums {
            let path = dir.join(file);
            if part_paths.contains(&path) {
                continue;
            }
            if !path.is_file() {
                return Err(Error::integrity_violation(
                    &instance,
                    format!("{} has a checksum but is missing", file),
                ));
            }
            if misc_payload.as_deref() == Some(file.as_str()) {
                // Sealed like the archives, so it is opened as well
                codec.read_sealed_payload(&ArchivePart::new(path, expected.as_str()))?;
            } else {
                let actual = calculate_checksum(&path)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(Error::checksum_mismatch(file.as_str(), expected.as_str(), actual));
                }
            }
            summary.payloads_checked += 1;
            debug!("Verified {}", file);
        }

        for (archive, parts) in &stored {
            self.cancel.check()?;
            summary.entries += codec.verify(parts)?;
            summary.archives_checked += 1;
            if let Some(progress) = &progress {
                progress.inc_extract(archive);
            }
            debug!("Verified {} ({} part(s))", archive, parts.len());
        }

        if let Some(progress) = progress.as_mut() {
            progress.finish_extract("Verified");
        }
        info!(
            "Verified {} ({} archives, {} entries)",
            instance, summary.archives_checked, summary.entries
        );
        Ok(summary)
    }
}

/// Declared payloads must match the files present.
fn check_payload_presence(dir: &Path, metadata: &BackupMetadata) -> Result<()> {
    let instance = metadata.info.relative_dir.as_str();
    let descriptor = &metadata.descriptor;

    let rules_present = dir.join(RULES_FILENAME).is_file();
    if descriptor.has_rules_payload != rules_present {
        return Err(Error::integrity_violation(
            instance,
            if rules_present {
                "rules payload present but not declared"
            } else {
                "declared rules payload is missing"
            },
        ));
    }

    let keystore_present = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with(KEYSTORE_PREFIX));
    if descriptor.has_keystore_payload != keystore_present {
        return Err(Error::integrity_violation(
            instance,
            if keystore_present {
                "keystore payload present but not declared"
            } else {
                "declared keystore payload is missing"
            },
        ));
    }

    let misc_present = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with(MISC_FILENAME));
    if descriptor.has_misc_payload != misc_present {
        return Err(Error::integrity_violation(
            instance,
            if misc_present {
                "misc payload present but not declared"
            } else {
                "declared misc payload is missing"
            },
        ));
    }
    Ok(())
}
