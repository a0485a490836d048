//! Removing instances and migrating legacy ones.

use super::{BackupEngine, BatchReport};
use crate::layout::BackupInstanceId;
use crate::metadata::MetadataStore;
use appkeep_core::{ApplicationRef, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of deleting one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    /// False when there was nothing to delete
    pub removed: bool,

    /// True when the application directory became empty and was removed
    pub removed_app_root: bool,
}

impl BackupEngine {
    /// Deletes each selected instance of `app`.
    ///
    /// Deleting an instance that does not exist succeeds; a malformed
    /// selector still fails the whole call.
    pub async fn delete_backup(
        &self,
        app: &ApplicationRef,
        selectors: &[String],
    ) -> Result<BatchReport<DeleteSummary>> {
        let ids = Self::resolve_selectors(app, selectors)?;
        self.layout.app_root(&app.application_id)?;

        let mut report = BatchReport::new(app);
        for id in ids {
            let result = self.delete_instance(app, &id).await;
            report.push(id, result);
        }
        Ok(report)
    }

    async fn delete_instance(&self, app: &ApplicationRef, id: &BackupInstanceId) -> Result<DeleteSummary> {
        let _lock = self.lock_instance(app, id).await?;

        let dir = self.layout.instance_dir(&app.application_id, id)?;
        let mut summary = DeleteSummary::default();
        if dir.exists() {
            // Once renamed the instance no longer lists, whatever the removal does
            let doomed = dir.with_file_name(format!(
                ".{}.del-{}",
                id.relative_dir(),
                Uuid::new_v4().simple()
            ));
            fs::rename(&dir, &doomed)?;
            remove_doomed(&doomed);
            summary.removed = true;
            info!("Deleted {}/{}", app.application_id, id);
        } else {
            debug!("Nothing to delete for {}/{}", app.application_id, id);
        }

        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.remove(&app.application_id, id) {
                warn!("Failed to update catalog for {}: {}", app.application_id, e);
            }
        }

        summary.removed_app_root = self.layout.remove_app_root_if_empty(&app.application_id)?;
        Ok(summary)
    }

    /// Rewrites every legacy instance of `application_id` in the current schema.
    ///
    /// Each outcome is `true` when that instance was rewritten.
    pub async fn migrate(&self, app: &ApplicationRef) -> Result<BatchReport<bool>> {
        let mut report = BatchReport::new(app);
        for id in self.layout.list_instances(&app.application_id)? {
            let result = match self.lock_instance(app, &id).await {
                Ok(_lock) => self
                    .layout
                    .instance_dir(&app.application_id, &id)
                    .and_then(|dir| MetadataStore::migrate(&dir, &id)),
                Err(e) => Err(e),
            };
            report.push(id, result);
        }
        if report.successes().any(|(_, migrated)| *migrated) {
            self.refresh_catalog(&app.application_id);
        }
        Ok(report)
    }
}

/// Removes a renamed instance; leftovers are hidden and skipped by listings.
fn remove_doomed(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Left partially removed instance at {}: {}", dir.display(), e);
    }
}
