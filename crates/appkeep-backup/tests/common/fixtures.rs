//! Simulated device with one installed application.

use appkeep_backup::{
    BackupCatalog, BackupEngine, BackupLayout, InstalledPackage, Inventory,
    InventoryPackageManager, MiscEntry, MiscKind, RootedStorage, SelectionFlags,
};
use appkeep_core::{ApplicationRef, UserId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const APP_ID: &str = "sample.app";
pub const SOURCE_DIR: &str = "/data/app/sample.app-1";
pub const KEYSTORE_ENTRY: &str = "/data/misc/keystore/user_0/10123_USRPKEY_sample";
pub const RULES: &str = "sample.app\tACTIVITY\tMainActivity\tfalse\n";
/// sha256 of the certificate `sample.app` is signed with
pub const SIGNING_CERT: &str = "5f3c1e0a9b7d2468ace013579bdf2468ace013579bdf2468ace013579bdf2468";

/// Internal credential-protected directory of `user`
pub fn ce_dir(user: UserId) -> String {
    format!("/data/user/{}/{}", user, APP_ID)
}

/// Internal device-protected directory of `user`
pub fn de_dir(user: UserId) -> String {
    format!("/data/user_de/{}/{}", user, APP_ID)
}

/// App-private directory on shared storage of `user`
pub fn external_dir(user: UserId) -> String {
    format!("/storage/emulated/{}/Android/data/{}", user, APP_ID)
}

pub fn sample_package(user: UserId) -> InstalledPackage {
    InstalledPackage {
        application_id: APP_ID.to_string(),
        user,
        display_name: "Sample".to_string(),
        version_name: "2.1".to_string(),
        version_code: 21,
        is_system: false,
        split_configs: vec!["config.en".to_string()],
        installer_id: Some("store.app".to_string()),
        source_dir: SOURCE_DIR.to_string(),
        apk_name: "base.apk".to_string(),
        instruction_set: Some("arm64".to_string()),
        data_dirs: vec![ce_dir(user), de_dir(user), external_dir(user)],
        keystore_files: vec![KEYSTORE_ENTRY.to_string()],
        rules: Some(RULES.to_string()),
        icon_base64: Some("iVBORw0KGgo=".to_string()),
        certificate_checksums: vec![SIGNING_CERT.to_string()],
        misc: vec![
            MiscEntry::permission("android.permission.CAMERA", true),
            MiscEntry::new(MiscKind::AppOp, "63", "1"),
        ],
    }
}

/// A device root and a backup root in temporary directories.
pub struct TestDevice {
    pub device: TempDir,
    pub backups: TempDir,
    pub storage: RootedStorage,
    pub packages: Arc<InventoryPackageManager>,
}

impl TestDevice {
    /// Device with `sample.app` installed for user 0 and populated data.
    pub fn new() -> Self {
        let device = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let storage = RootedStorage::new(device.path());
        let inventory = Inventory {
            packages: vec![sample_package(0)],
        };
        let packages = Arc::new(InventoryPackageManager::new(inventory, storage.clone()));

        let test_device = Self {
            device,
            backups,
            storage,
            packages,
        };
        test_device.populate();
        test_device
    }

    fn populate(&self) {
        self.write(&format!("{}/base.apk", SOURCE_DIR), "base apk");
        self.write(&format!("{}/split_config.en.apk", SOURCE_DIR), "split apk");
        self.write(&format!("{}/lib/arm64/libsample.so", SOURCE_DIR), "native");

        self.write(&format!("{}/files/notes.txt", ce_dir(0)), "internal notes");
        self.write(&format!("{}/shared_prefs/prefs.xml", ce_dir(0)), "<map/>");
        self.write(&format!("{}/cache/thumb.bin", ce_dir(0)), "cached");
        self.write(&format!("{}/files/boot.txt", de_dir(0)), "device protected");
        self.write(&format!("{}/files/external.txt", external_dir(0)), "external");

        self.write(KEYSTORE_ENTRY, "key material");
    }

    /// Host path of a device path
    pub fn path(&self, device_path: &str) -> PathBuf {
        self.device.path().join(device_path.trim_start_matches('/'))
    }

    pub fn write(&self, device_path: &str, content: &str) {
        let path = self.path(device_path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, device_path: &str) -> String {
        fs::read_to_string(self.path(device_path)).unwrap()
    }

    pub fn exists(&self, device_path: &str) -> bool {
        self.path(device_path).exists()
    }

    pub fn backup_root(&self) -> &Path {
        self.backups.path()
    }

    pub fn layout(&self) -> BackupLayout {
        BackupLayout::new(self.backups.path())
    }

    pub fn catalog(&self) -> BackupCatalog {
        BackupCatalog::new(self.backups.path().join(".catalog.json"))
    }

    /// Engine with a catalog, no key provider and default options.
    pub fn engine(&self) -> BackupEngine {
        BackupEngine::new(
            self.layout(),
            self.packages.clone(),
            Arc::new(self.storage.clone()),
        )
        .with_catalog(self.catalog())
    }

    /// Host directory of an instance
    pub fn instance_dir(&self, relative_dir: &str) -> PathBuf {
        self.backups.path().join(APP_ID).join(relative_dir)
    }
}

pub fn app(user: UserId) -> ApplicationRef {
    ApplicationRef::new(APP_ID, user).unwrap()
}

/// Everything except the multiple-instance and custom-user bits
pub fn full_flags() -> SelectionFlags {
    SelectionFlags::BINARIES
        | SelectionFlags::INTERNAL_DATA
        | SelectionFlags::EXTERNAL_DATA
        | SelectionFlags::EXCLUDE_CACHE
        | SelectionFlags::RULES
        | SelectionFlags::EXTRAS
}

pub fn selectors(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Names of every entry directly under `dir`, sorted
pub fn dir_entries(dir: &Path) -> Vec<String> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
