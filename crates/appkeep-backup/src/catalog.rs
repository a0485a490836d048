//! Denormalized listing cache of every backup instance.
//!
//! The catalog is a JSON file with one row per application and instance. It
//! is rebuilt from the metadata records at any time and never consulted for
//! integrity decisions.

use crate::layout::{BackupInstanceId, BackupLayout};
use crate::metadata::MetadataStore;
use appkeep_core::{Result, UserId};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CATALOG_VERSION: u32 = 1;

/// One row of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub application_id: String,
    pub relative_dir: String,
    pub owning_user: UserId,
    pub instance_name: Option<String>,
    pub display_name: String,
    pub version_name: String,
    pub version_code: i64,
    pub created_at: DateTime<Utc>,
    pub flags: u32,
    pub crypto: String,
    pub archive_format: String,

    /// Schema version found on disk (lower than current for unmigrated records)
    pub schema_version: u32,

    pub is_system_app: bool,
    pub has_rules: bool,
    pub has_keystore: bool,
    pub data_dir_count: usize,
}

impl CatalogEntry {
    pub fn instance_id(&self) -> BackupInstanceId {
        BackupInstanceId {
            user: self.owning_user,
            name: self.instance_name.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    entries: Vec<CatalogEntry>,
}

/// Catalog stored at a fixed path.
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    path: PathBuf,
}

impl BackupCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one instance directory into a row.
    fn scan_instance(
        layout: &BackupLayout,
        application_id: &str,
        id: &BackupInstanceId,
    ) -> Result<CatalogEntry> {
        let dir = layout.instance_dir(application_id, id)?;
        let schema_version = MetadataStore::read(&dir)?.schema_version();
        let metadata = MetadataStore::read_instance(&dir, id)?;
        Ok(CatalogEntry {
            application_id: metadata.descriptor.application_id.clone(),
            relative_dir: metadata.info.relative_dir.clone(),
            owning_user: metadata.info.owning_user,
            instance_name: metadata.descriptor.instance_name.clone(),
            display_name: metadata.descriptor.display_name.clone(),
            version_name: metadata.descriptor.version_name.clone(),
            version_code: metadata.descriptor.version_code,
            created_at: metadata.info.created_at,
            flags: metadata.info.flags,
            crypto: metadata.info.crypto.clone(),
            archive_format: metadata.info.archive_format.clone(),
            schema_version,
            is_system_app: metadata.descriptor.is_system_app,
            has_rules: metadata.descriptor.has_rules_payload,
            has_keystore: metadata.descriptor.has_keystore_payload,
            data_dir_count: metadata.descriptor.data_directories.len(),
        })
    }

    /// Rows for every readable instance of `application_id`.
    ///
    /// Unreadable instances are logged and left out.
    fn scan_application(layout: &BackupLayout, application_id: &str) -> Result<Vec<CatalogEntry>> {
        let mut rows = Vec::new();
        for id in layout.list_instances(application_id)? {
            match Self::scan_instance(layout, application_id, &id) {
                Ok(row) => rows.push(row),
                Err(e) => warn!("Skipping {}/{} in catalog: {}", application_id, id, e),
            }
        }
        Ok(rows)
    }

    /// Replaces the rows of `application_id` with what is on disk now.
    pub fn refresh(&self, layout: &BackupLayout, application_id: &str) -> Result<usize> {
        let rows = Self::scan_application(layout, application_id)?;
        let count = rows.len();
        self.update(|file| {
            file.entries.retain(|e| e.application_id != application_id);
            file.entries.extend(rows);
        })?;
        debug!("Catalog refreshed for {} ({} rows)", application_id, count);
        Ok(count)
    }

    /// Rebuilds the whole catalog from the backup root.
    pub fn rebuild(&self, layout: &BackupLayout) -> Result<usize> {
        let mut rows = Vec::new();
        for application_id in layout.list_applications()? {
            rows.extend(Self::scan_application(layout, &application_id)?);
        }
        let count = rows.len();
        self.update(|file| file.entries = rows)?;
        Ok(count)
    }

    /// Drops the row of one instance.
    pub fn remove(&self, application_id: &str, id: &BackupInstanceId) -> Result<()> {
        let relative_dir = id.relative_dir();
        self.update(|file| {
            file.entries
                .retain(|e| !(e.application_id == application_id && e.relative_dir == relative_dir));
        })
    }

    /// Every row, sorted by application then instance.
    pub fn list(&self) -> Result<Vec<CatalogEntry>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let file = parse_catalog(&content, &self.path);
        Ok(file.entries)
    }

    /// Rows of one application.
    pub fn list_for(&self, application_id: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.application_id == application_id)
            .collect())
    }

    /// Locked read-modify-write of the catalog file.
    fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogFile),
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;

        // Released when `file` is dropped
        file.lock_exclusive()?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let mut catalog = parse_catalog(&content, &self.path);

        apply(&mut catalog);
        catalog.version = CATALOG_VERSION;
        catalog.entries.sort_by(|a, b| {
            (a.application_id.as_str(), a.instance_id()).cmp(&(b.application_id.as_str(), b.instance_id()))
        });

        let json = serde_json::to_vec_pretty(&catalog)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }
}

/// A catalog that cannot be parsed is treated as empty; it is only a cache.
fn parse_catalog(content: &str, path: &Path) -> CatalogFile {
    if content.trim().is_empty() {
        return CatalogFile::default();
    }
    match serde_json::from_str(content) {
        Ok(file) => file,
        Err(e) => {
            warn!("Discarding unreadable catalog {}: {}", path.display(), e);
            CatalogFile::default()
        }
    }
}
