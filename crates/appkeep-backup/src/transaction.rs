//! Restore transaction with rollback.
//!
//! Every filesystem change a restore makes is recorded. Replaced data is
//! moved aside rather than deleted, so rollback can put it back and commit
//! only has to drop the displaced copies.

use appkeep_core::Result;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum RestoreChange {
    /// A new file was written where none existed
    FileCreated { path: PathBuf },
    /// An existing file was moved to `backup` before being overwritten
    FileModified { path: PathBuf, backup: PathBuf },
    /// A directory was created where none existed
    DirectoryCreated { path: PathBuf },
    /// An existing directory was moved to `displaced` and a restored one put in its place
    DirectoryReplaced { path: PathBuf, displaced: PathBuf },
}

pub struct RestoreTransaction {
    pub id: String,
    pub label: String,
    pub changes: Vec<RestoreChange>,
    committed: bool,
}

impl RestoreTransaction {
    pub fn begin(label: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        let label = label.into();
        debug!("Beginning restore transaction {} for {}", id, label);
        Self {
            id,
            label,
            changes: Vec::new(),
            committed: false,
        }
    }

    /// Sibling path used to park an existing file or directory
    pub fn displaced_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let short_id = self.id.split('-').next().unwrap_or(&self.id);
        path.with_file_name(format!(".{}.appkeep-{}", name, short_id))
    }

    pub fn record_file_created(&mut self, path: PathBuf) {
        self.changes.push(RestoreChange::FileCreated { path });
    }

    pub fn record_file_modified(&mut self, path: PathBuf, backup: PathBuf) {
        self.changes.push(RestoreChange::FileModified { path, backup });
    }

    pub fn record_directory_created(&mut self, path: PathBuf) {
        self.changes.push(RestoreChange::DirectoryCreated { path });
    }

    pub fn record_directory_replaced(&mut self, path: PathBuf, displaced: PathBuf) {
        self.changes
            .push(RestoreChange::DirectoryReplaced { path, displaced });
    }

    /// Moves `staged` into `target`, parking whatever was there first.
    pub async fn replace_directory(&mut self, staged: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            if !parent.exists() {
                async_fs::create_dir_all(parent).await?;
            }
        }

        if async_fs::symlink_metadata(target).await.is_ok() {
            let displaced = self.displaced_path(target);
            async_fs::rename(target, &displaced).await?;
            self.record_directory_replaced(target.to_path_buf(), displaced);
        } else {
            self.record_directory_created(target.to_path_buf());
        }
        async_fs::rename(staged, target).await?;
        Ok(())
    }

    /// Writes `content` to `target`, parking an existing file first.
    pub async fn write_file(&mut self, target: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        if async_fs::symlink_metadata(target).await.is_ok() {
            let backup = self.displaced_path(target);
            async_fs::rename(target, &backup).await?;
            self.record_file_modified(target.to_path_buf(), backup);
        } else {
            self.record_file_created(target.to_path_buf());
        }
        async_fs::write(target, content).await?;
        Ok(())
    }

    /// Drops every parked copy.
    pub async fn commit(mut self) -> Result<()> {
        info!(
            "Committing restore transaction {} ({} changes)",
            self.id,
            self.changes.len()
        );
        for change in &self.changes {
            let parked = match change {
                RestoreChange::FileModified { backup, .. } => backup,
                RestoreChange::DirectoryReplaced { displaced, .. } => displaced,
                _ => continue,
            };
            if let Err(e) = remove_any(parked).await {
                warn!("Failed to remove displaced copy {}: {}", parked.display(), e);
            }
        }
        self.committed = true;
        Ok(())
    }

    /// Undoes every recorded change in reverse order.
    pub async fn rollback(mut self) -> Result<()> {
        warn!("Rolling back restore transaction {} for {}", self.id, self.label);

        for change in self.changes.iter().rev() {
            if let Err(e) = Self::rollback_change(change).await {
                warn!("Failed to rollback change {:?}: {}", change, e);
            }
        }

        self.committed = true;
        Ok(())
    }

    async fn rollback_change(change: &RestoreChange) -> Result<()> {
        match change {
            RestoreChange::FileCreated { path } => {
                if path.exists() {
                    async_fs::remove_file(path).await?;
                }
            }
            RestoreChange::FileModified { path, backup } => {
                if backup.exists() {
                    async_fs::rename(backup, path).await?;
                }
            }
            RestoreChange::DirectoryCreated { path } => {
                if path.exists() {
                    async_fs::remove_dir_all(path).await?;
                }
            }
            RestoreChange::DirectoryReplaced { path, displaced } => {
                if async_fs::symlink_metadata(displaced).await.is_ok() {
                    remove_any(path).await?;
                    async_fs::rename(displaced, path).await?;
                }
            }
        }
        Ok(())
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

async fn remove_any(path: &Path) -> std::io::Result<()> {
    match async_fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => async_fs::remove_dir_all(path).await,
        Ok(_) => async_fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
