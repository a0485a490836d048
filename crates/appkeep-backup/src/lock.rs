//! Per-instance locks.
//!
//! Operations on the same (application, instance) pair are serialized in two
//! layers. Inside one process an async mutex per pair queues waiters without
//! blocking a runtime worker. Across processes the holder of that mutex also
//! takes an advisory lock on `<root>/.locks/<app>@<dir>.lock`, polled with
//! `try_lock_exclusive` so a busy file never parks the executor thread.

use crate::layout::{BackupInstanceId, BackupLayout};
use appkeep_core::Result;
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

pub const LOCK_DIR_NAME: &str = ".locks";

const FILE_LOCK_POLL: Duration = Duration::from_millis(50);

/// In-process queue of lock holders, shared by every clone of an engine.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    slots: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop slots nobody holds or waits on so the map tracks live work only
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Waits until the lock for `id` of `application_id` is held.
    pub async fn acquire(
        &self,
        layout: &BackupLayout,
        application_id: &str,
        id: &BackupInstanceId,
    ) -> Result<InstanceLock> {
        // Validates the application id before it becomes part of a file name.
        layout.app_root(application_id)?;

        let name = format!("{}@{}", application_id, id.relative_dir());
        let guard = self.slot(&name).lock_owned().await;

        let dir = layout.root().join(LOCK_DIR_NAME);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let mut waited = false;
        while !file.try_lock_exclusive()? {
            if !waited {
                debug!("Waiting for another process holding {}", path.display());
                waited = true;
            }
            tokio::time::sleep(FILE_LOCK_POLL).await;
        }
        trace!("Acquired lock {}", path.display());

        Ok(InstanceLock {
            _file: file,
            _guard: guard,
            path,
        })
    }
}

/// Held for the duration of one instance operation; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    _guard: OwnedMutexGuard<()>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}
