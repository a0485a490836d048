//! Collaborators the engine talks to: the package manager and device storage.
//!
//! The engine never inspects installed packages itself. It asks a
//! [`PackageManager`] for a snapshot and for install/rules operations, and
//! maps device paths onto the host filesystem through [`DeviceStorage`].

use crate::flags::SelectionFlags;
use crate::misc::MiscEntry;
use appkeep_core::{ApplicationRef, Error, Result, UserId};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// What the package manager knows about an installed application for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstalledPackage {
    pub application_id: String,
    pub user: UserId,
    pub display_name: String,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub split_configs: Vec<String>,
    #[serde(default)]
    pub installer_id: Option<String>,

    /// Device directory holding the installed APK files
    pub source_dir: String,

    #[serde(default = "default_apk_name")]
    pub apk_name: String,
    #[serde(default)]
    pub instruction_set: Option<String>,

    /// Device paths of every data directory, in capture order
    #[serde(default)]
    pub data_dirs: Vec<String>,

    /// Device paths of keystore entries owned by the application
    #[serde(default)]
    pub keystore_files: Vec<String>,

    /// Exported rules, tab separated
    #[serde(default)]
    pub rules: Option<String>,

    #[serde(default)]
    pub icon_base64: Option<String>,

    /// sha256 of each signing certificate, lowercase hex
    #[serde(default)]
    pub certificate_checksums: Vec<String>,

    /// Permission grants and similar device settings
    #[serde(default)]
    pub misc: Vec<MiscEntry>,
}

fn default_apk_name() -> String {
    "base.apk".to_string()
}

impl InstalledPackage {
    pub fn is_split_apk(&self) -> bool {
        !self.split_configs.is_empty()
    }
}

/// Package manager operations needed by backup and restore
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Current state of `app`
    async fn snapshot(&self, app: &ApplicationRef) -> Result<InstalledPackage>;

    /// Installs the given APK files for `user`.
    ///
    /// `certificate_checksums` are the signing certificates recorded when the
    /// files were captured.
    async fn install(
        &self,
        application_id: &str,
        user: UserId,
        apk_files: &[PathBuf],
        certificate_checksums: &[String],
        flags: SelectionFlags,
    ) -> Result<()>;

    /// Removes `app` for its user, keeping other users' installs
    async fn uninstall(&self, app: &ApplicationRef) -> Result<()>;

    /// Exports the rules applied to `app`, if any
    async fn export_rules(&self, app: &ApplicationRef) -> Result<Option<String>>;

    /// Applies previously exported rules to `app`
    async fn import_rules(&self, app: &ApplicationRef, rules: &str) -> Result<()>;

    /// Launcher icon of `app`
    async fn icon(&self, app: &ApplicationRef) -> Result<Option<Vec<u8>>> {
        let _ = app;
        Ok(None)
    }

    /// Device settings of `app` that a reinstall would lose
    async fn export_misc(&self, app: &ApplicationRef) -> Result<Vec<MiscEntry>> {
        let _ = app;
        Ok(Vec::new())
    }

    /// Applies captured settings to `app`, returning how many took effect
    async fn import_misc(&self, app: &ApplicationRef, entries: &[MiscEntry]) -> Result<usize> {
        let _ = (app, entries);
        Ok(0)
    }
}

/// Maps device paths onto the host filesystem
pub trait DeviceStorage: Send + Sync {
    fn resolve(&self, device_path: &str) -> Result<PathBuf>;
}

/// Device filesystem mounted under a host directory (`/` for a live device)
#[derive(Debug, Clone)]
pub struct RootedStorage {
    root: PathBuf,
}

impl RootedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl DeviceStorage for RootedStorage {
    fn resolve(&self, device_path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(device_path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::invalid_selector(
                        device_path,
                        "device path must not leave the device root",
                    ));
                }
            }
        }
        Ok(resolved)
    }
}

/// Installed-package inventory loaded from YAML
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Inventory {
    #[serde(default)]
    pub packages: Vec<InstalledPackage>,
}

/// Package manager backed by an [`Inventory`].
///
/// Installs copy the APK files into the package's source directory under
/// the device root and register the package for the target user.
pub struct InventoryPackageManager {
    packages: Mutex<HashMap<(String, UserId), InstalledPackage>>,
    storage: RootedStorage,
}

impl InventoryPackageManager {
    pub fn new(inventory: Inventory, storage: RootedStorage) -> Self {
        let packages = inventory
            .packages
            .into_iter()
            .map(|p| ((p.application_id.clone(), p.user), p))
            .collect();
        Self {
            packages: Mutex::new(packages),
            storage,
        }
    }

    /// Loads an inventory file
    pub fn from_file(path: &Path, storage: RootedStorage) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let inventory: Inventory = serde_yaml_ng::from_str(&content)?;
        debug!("Loaded {} packages from {}", inventory.packages.len(), path.display());
        Ok(Self::new(inventory, storage))
    }

    /// Adds or replaces a package
    pub fn insert(&self, package: InstalledPackage) {
        let mut packages = self.lock();
        packages.insert((package.application_id.clone(), package.user), package);
    }

    /// Looks up a package without going through the async trait
    pub fn get(&self, application_id: &str, user: UserId) -> Option<InstalledPackage> {
        self.lock().get(&(application_id.to_string(), user)).cloned()
    }

    /// Current state of every package, sorted by application then user
    pub fn to_inventory(&self) -> Inventory {
        let mut packages: Vec<InstalledPackage> = self.lock().values().cloned().collect();
        packages.sort_by(|a, b| (&a.application_id, a.user).cmp(&(&b.application_id, b.user)));
        Inventory { packages }
    }

    /// Writes the current state back to an inventory file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(&self.to_inventory())?;
        fs::write(path, content)?;
        debug!("Saved inventory to {}", path.display());
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, UserId), InstalledPackage>> {
        self.packages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn installed_in_any_user(&self, application_id: &str) -> Option<InstalledPackage> {
        self.lock()
            .values()
            .filter(|p| p.application_id == application_id)
            .min_by_key(|p| p.user)
            .cloned()
    }
}

#[async_trait]
impl PackageManager for InventoryPackageManager {
    async fn snapshot(&self, app: &ApplicationRef) -> Result<InstalledPackage> {
        self.get(&app.application_id, app.user)
            .ok_or_else(|| Error::collaborator("package manager", format!("{} is not installed", app)))
    }

    async fn install(
        &self,
        application_id: &str,
        user: UserId,
        apk_files: &[PathBuf],
        certificate_checksums: &[String],
        flags: SelectionFlags,
    ) -> Result<()> {
        if apk_files.is_empty() {
            return Err(Error::collaborator("installer", "no APK files to install"));
        }

        let existing = self
            .get(application_id, user)
            .or_else(|| self.installed_in_any_user(application_id));
        let mut package = match existing {
            Some(package) => package,
            None => InstalledPackage {
                application_id: application_id.to_string(),
                user,
                display_name: application_id.to_string(),
                version_name: String::new(),
                version_code: 0,
                is_system: false,
                split_configs: Vec::new(),
                installer_id: None,
                source_dir: format!("/data/app/{}", application_id),
                apk_name: default_apk_name(),
                instruction_set: None,
                data_dirs: vec![
                    format!("/data/user/{}/{}", user, application_id),
                    format!("/data/user_de/{}/{}", user, application_id),
                ],
                keystore_files: Vec::new(),
                rules: None,
                icon_base64: None,
                certificate_checksums: Vec::new(),
                misc: Vec::new(),
            },
        };
        if !certificate_checksums.is_empty() {
            package.certificate_checksums = certificate_checksums.to_vec();
        }

        let source_dir = self.storage.resolve(&package.source_dir)?;
        fs::create_dir_all(&source_dir)?;
        for apk in apk_files {
            let file_name = apk
                .file_name()
                .ok_or_else(|| Error::collaborator("installer", format!("invalid APK path {}", apk.display())))?;
            fs::copy(apk, source_dir.join(file_name))?;
        }

        if package.user != user {
            let from = package.user;
            package.data_dirs = package
                .data_dirs
                .iter()
                .map(|dir| crate::remap::remap(dir, from, user).unwrap_or_else(|_| dir.clone()))
                .collect();
            package.keystore_files.clear();
            package.rules = None;
            package.misc.clear();
            package.user = user;
        }

        info!(
            "Installed {} for user {} ({} files, flags: {})",
            application_id,
            user,
            apk_files.len(),
            flags
        );
        self.insert(package);
        Ok(())
    }

    async fn uninstall(&self, app: &ApplicationRef) -> Result<()> {
        let removed = self.lock().remove(&(app.application_id.clone(), app.user));
        if removed.is_none() {
            return Err(Error::collaborator("package manager", format!("{} is not installed", app)));
        }
        info!("Uninstalled {}", app);
        Ok(())
    }

    async fn export_rules(&self, app: &ApplicationRef) -> Result<Option<String>> {
        Ok(self
            .get(&app.application_id, app.user)
            .and_then(|p| p.rules)
            .filter(|rules| !rules.trim().is_empty()))
    }

    async fn import_rules(&self, app: &ApplicationRef, rules: &str) -> Result<()> {
        let mut packages = self.lock();
        let package = packages
            .get_mut(&(app.application_id.clone(), app.user))
            .ok_or_else(|| Error::collaborator("package manager", format!("{} is not installed", app)))?;
        package.rules = Some(rules.to_string());
        Ok(())
    }

    async fn export_misc(&self, app: &ApplicationRef) -> Result<Vec<MiscEntry>> {
        Ok(self
            .get(&app.application_id, app.user)
            .map(|p| p.misc)
            .unwrap_or_default())
    }

    async fn import_misc(&self, app: &ApplicationRef, entries: &[MiscEntry]) -> Result<usize> {
        let mut packages = self.lock();
        let package = packages
            .get_mut(&(app.application_id.clone(), app.user))
            .ok_or_else(|| Error::collaborator("package manager", format!("{} is not installed", app)))?;
        for entry in entries {
            package
                .misc
                .retain(|current| (current.kind, &current.name) != (entry.kind, &entry.name));
            package.misc.push(entry.clone());
        }
        Ok(entries.len())
    }

    async fn icon(&self, app: &ApplicationRef) -> Result<Option<Vec<u8>>> {
        let Some(encoded) = self.get(&app.application_id, app.user).and_then(|p| p.icon_base64) else {
            return Ok(None);
        };
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map(Some)
            .map_err(|e| Error::collaborator("package manager", format!("invalid icon: {}", e)))
    }
}
