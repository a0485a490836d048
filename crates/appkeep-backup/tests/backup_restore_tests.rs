//! Backup and restore round trips against a simulated device.

mod common;

use appkeep_backup::{
    DirectoryClass, MetadataStore, MiscEntry, MiscKind, PackageManager, RestoreOptions,
    SelectionFlags, CURRENT_BACKUP_META_VERSION,
};
use appkeep_core::Error;
use common::*;

#[tokio::test]
async fn test_backup_creates_base_instance() {
    let device = TestDevice::new();
    let engine = device.engine();

    let report = engine.backup(&app(0), &[], full_flags()).await.unwrap();
    let summary = single_success(&report);

    assert_eq!(summary.instance_dir, device.instance_dir("0"));
    assert_eq!(
        dir_entries(&summary.instance_dir),
        vec![
            "data0.tar.gz",
            "data1.tar.gz",
            "data2.tar.gz",
            "icon.png",
            "info.json",
            "keystore.tar.gz",
            "meta.json",
            "misc.am.tsv",
            "rules.am.tsv",
            "source.tar.gz",
        ]
    );
    assert_eq!(dir_entries(&device.backup_root().join(APP_ID)), vec!["0"]);
    assert!(summary.total_bytes() > 0);
}

#[tokio::test]
async fn test_backup_metadata_records_capture() {
    let device = TestDevice::new();
    let engine = device.engine();

    engine.backup(&app(0), &[], full_flags()).await.unwrap();
    let metadata = MetadataStore::read_instance(
        &device.instance_dir("0"),
        &appkeep_backup::BackupInstanceId::base(0),
    )
    .unwrap();

    assert_eq!(metadata.info.version, CURRENT_BACKUP_META_VERSION);
    assert_eq!(metadata.info.owning_user, 0);
    assert_eq!(metadata.info.relative_dir, "0");
    assert_eq!(metadata.info.crypto, "none");
    assert_eq!(metadata.info.archive_format, "z");
    assert_eq!(metadata.info.flags, full_flags().bits());

    let descriptor = &metadata.descriptor;
    assert_eq!(descriptor.application_id, APP_ID);
    assert_eq!(descriptor.version_code, 21);
    assert!(descriptor.is_split_apk);
    assert!(descriptor.has_rules_payload);
    assert!(descriptor.has_keystore_payload);
    assert_eq!(descriptor.instance_name, None);
    assert_eq!(descriptor.binary_archive.as_deref(), Some("source.tar.gz"));
    assert_eq!(descriptor.installer_id.as_deref(), Some("store.app"));

    let classes: Vec<DirectoryClass> = descriptor
        .data_directories
        .iter()
        .map(|d| d.classification)
        .collect();
    assert_eq!(
        classes,
        vec![
            DirectoryClass::InternalCredentialProtected,
            DirectoryClass::InternalDeviceProtected,
            DirectoryClass::ExternalAppPrivate,
        ]
    );
    assert!(descriptor.data_directories[0].directly_reachable);
    assert!(!descriptor.data_directories[2].directly_reachable);

    // files/, files/notes.txt, shared_prefs/, shared_prefs/prefs.xml; cache excluded
    assert_eq!(descriptor.data_directories[0].entries, Some(4));
    assert_eq!(descriptor.checksums.len(), 7);
}

#[tokio::test]
async fn test_backup_updates_catalog() {
    let device = TestDevice::new();
    let engine = device.engine();

    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    let entries = device.catalog().list_for(APP_ID).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].relative_dir, "0");
    assert_eq!(entries[0].display_name, "Sample");
    assert_eq!(entries[0].data_dir_count, 3);
    assert!(entries[0].has_rules);
}

#[tokio::test]
async fn test_backup_apk_only_skips_native_libraries() {
    let device = TestDevice::new();
    let engine = device.engine();

    let flags = SelectionFlags::BINARIES | SelectionFlags::BINARIES_APK_ONLY;
    let report = engine.backup(&app(0), &[], flags).await.unwrap();
    let summary = single_success(&report);

    let source = summary
        .archives
        .iter()
        .find(|a| a.file_name == "source.tar.gz")
        .unwrap();
    assert_eq!(source.entries, 2);
    assert!(summary.metadata.descriptor.data_directories.is_empty());
}

#[tokio::test]
async fn test_restore_same_user_replaces_data() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    device.write(&format!("{}/files/notes.txt", ce_dir(0)), "changed");
    device.write(&format!("{}/files/added.txt", ce_dir(0)), "added after backup");

    let report = engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    let summary = single_success(&report);

    assert_eq!(summary.target_user, 0);
    assert!(summary.binaries_installed);
    assert_eq!(summary.restored_dirs.len(), 3);
    assert_eq!(summary.keystore_entries, 1);
    assert!(summary.rules_imported);

    assert_eq!(
        device.read(&format!("{}/files/notes.txt", ce_dir(0))),
        "internal notes"
    );
    assert!(!device.exists(&format!("{}/files/added.txt", ce_dir(0))));
    assert_eq!(
        device.read(&format!("{}/files/boot.txt", de_dir(0))),
        "device protected"
    );

    // No staging or parked copies left behind
    assert_eq!(dir_entries(&device.path("/data/user/0")), vec![APP_ID]);
    assert_eq!(dir_entries(&device.backup_root().join(APP_ID)), vec!["0"]);
}

#[tokio::test]
async fn test_restore_to_other_user_remaps_paths() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    let options = RestoreOptions::default()
        .with_target_user(10)
        .with_flags(SelectionFlags::BINARIES | SelectionFlags::INTERNAL_DATA | SelectionFlags::RULES);
    let report = engine.restore(&app(0), &selectors(&["0"]), &options).await.unwrap();
    let summary = single_success(&report);

    assert_eq!(summary.target_user, 10);
    assert_eq!(summary.restored_dirs, vec![ce_dir(10), de_dir(10)]);
    assert_eq!(summary.skipped_dirs, vec![external_dir(0)]);

    assert_eq!(
        device.read(&format!("{}/files/notes.txt", ce_dir(10))),
        "internal notes"
    );
    assert_eq!(
        device.read(&format!("{}/files/boot.txt", de_dir(10))),
        "device protected"
    );
    assert_eq!(
        device.read("/data/misc/keystore/user_10/10123_USRPKEY_sample"),
        "key material"
    );

    let installed = device.packages.get(APP_ID, 10).unwrap();
    assert_eq!(installed.rules.as_deref(), Some(RULES));

    // The source user's data is untouched
    assert_eq!(
        device.read(&format!("{}/files/notes.txt", ce_dir(0))),
        "internal notes"
    );
}

#[tokio::test]
async fn test_restore_shared_storage_to_other_user_is_rejected() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    let options = RestoreOptions::default().with_target_user(10);
    let report = engine.restore(&app(0), &[], &options).await.unwrap();

    assert!(matches!(single_error(&report), Error::NotImplemented { .. }));
    assert!(!device.exists(&ce_dir(10)));
    assert!(device.packages.get(APP_ID, 10).is_none());
}

#[tokio::test]
async fn test_restore_honors_stored_flags() {
    let device = TestDevice::new();
    let engine = device.engine();
    let flags = SelectionFlags::BINARIES | SelectionFlags::INTERNAL_DATA;
    let report = engine.backup(&app(0), &[], flags).await.unwrap();
    let summary = single_success(&report);

    assert_eq!(summary.metadata.info.selection_flags(), flags);
    assert_eq!(summary.metadata.descriptor.data_directories.len(), 2);
    assert!(!summary.metadata.descriptor.has_rules_payload);
    assert!(!device.instance_dir("0").join("icon.png").exists());

    device.write(&format!("{}/files/external.txt", external_dir(0)), "newer");
    let report = engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    let restored = single_success(&report);

    assert!(!restored.rules_imported);
    assert_eq!(restored.restored_dirs.len(), 2);
    assert_eq!(
        device.read(&format!("{}/files/external.txt", external_dir(0))),
        "newer"
    );
}

#[tokio::test]
async fn test_restore_missing_instance() {
    let device = TestDevice::new();
    let engine = device.engine();

    let report = engine
        .restore(&app(0), &selectors(&["0_nightly"]), &RestoreOptions::default())
        .await
        .unwrap();
    assert!(matches!(single_error(&report), Error::InstanceNotFound { .. }));
}

#[tokio::test]
async fn test_backup_replaces_existing_instance() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    device.write(&format!("{}/files/notes.txt", ce_dir(0)), "second capture");
    engine.backup(&app(0), &[], full_flags()).await.unwrap();
    assert_eq!(dir_entries(&device.backup_root().join(APP_ID)), vec!["0"]);

    device.write(&format!("{}/files/notes.txt", ce_dir(0)), "third");
    engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(
        device.read(&format!("{}/files/notes.txt", ce_dir(0))),
        "second capture"
    );
}

#[tokio::test]
async fn test_round_trip_for_every_flag_combination() {
    let bits = [
        SelectionFlags::BINARIES,
        SelectionFlags::INTERNAL_DATA,
        SelectionFlags::EXTERNAL_DATA,
        SelectionFlags::EXCLUDE_CACHE,
        SelectionFlags::RULES,
    ];

    for mask in 1u32..(1 << bits.len()) {
        let flags = bits
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .fold(SelectionFlags::empty(), |acc, (_, flag)| acc | *flag);
        if flags.selects_nothing() {
            continue;
        }

        let device = TestDevice::new();
        let engine = device.engine();
        let report = engine.backup(&app(0), &[], flags).await.unwrap();
        assert_all_succeeded(&report);

        for dir in [SOURCE_DIR.to_string(), ce_dir(0), de_dir(0), external_dir(0)] {
            std::fs::remove_dir_all(device.path(&dir)).unwrap();
        }

        let report = engine
            .restore(&app(0), &[], &RestoreOptions::default())
            .await
            .unwrap();
        assert_all_succeeded(&report);

        let has = |flag| flags.contains(flag);
        assert_eq!(
            device.exists(&format!("{}/base.apk", SOURCE_DIR)),
            has(SelectionFlags::BINARIES),
            "binaries with {}",
            flags
        );
        if has(SelectionFlags::INTERNAL_DATA) {
            assert_eq!(
                device.read(&format!("{}/files/notes.txt", ce_dir(0))),
                "internal notes"
            );
            assert_eq!(
                device.read(&format!("{}/shared_prefs/prefs.xml", ce_dir(0))),
                "<map/>"
            );
            assert_eq!(
                device.read(&format!("{}/files/boot.txt", de_dir(0))),
                "device protected"
            );
            assert_eq!(
                device.exists(&format!("{}/cache/thumb.bin", ce_dir(0))),
                !has(SelectionFlags::EXCLUDE_CACHE),
                "cache with {}",
                flags
            );
        } else {
            assert!(!device.exists(&ce_dir(0)), "internal data with {}", flags);
        }
        if has(SelectionFlags::EXTERNAL_DATA) {
            assert_eq!(
                device.read(&format!("{}/files/external.txt", external_dir(0))),
                "external"
            );
        } else {
            assert!(!device.exists(&external_dir(0)), "external data with {}", flags);
        }
    }
}

#[tokio::test]
async fn test_concurrent_restores_of_one_instance_serialize() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();
    device.write(&format!("{}/files/notes.txt", ce_dir(0)), "changed");

    // Both calls share the single test runtime thread; the second waits for the first
    let options = RestoreOptions::default();
    let (first, second) = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let (app_a, app_b) = (app(0), app(0));
        tokio::join!(
            engine.restore(&app_a, &[], &options),
            engine.restore(&app_b, &[], &options)
        )
    })
    .await
    .expect("restores of one instance must not deadlock");

    assert_all_succeeded(&first.unwrap());
    assert_all_succeeded(&second.unwrap());
    assert_eq!(
        device.read(&format!("{}/files/notes.txt", ce_dir(0))),
        "internal notes"
    );
}

#[tokio::test]
async fn test_backup_and_verify_of_one_instance_interleave_safely() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    let (backup, verify) = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let (app_a, app_b) = (app(0), app(0));
        tokio::join!(
            engine.backup(&app_a, &[], full_flags()),
            engine.verify(&app_b, &[])
        )
    })
    .await
    .expect("operations on one instance must not deadlock");

    assert_all_succeeded(&backup.unwrap());
    assert_all_succeeded(&verify.unwrap());
}

/// Replaces the installed sample package with one signed by `certificate`
fn resign_installed(device: &TestDevice, certificate: &str) {
    let mut package = device.packages.get(APP_ID, 0).unwrap();
    package.certificate_checksums = vec![certificate.to_string()];
    device.packages.insert(package);
}

#[tokio::test]
async fn test_backup_records_signing_certificates() {
    let device = TestDevice::new();
    let report = device.engine().backup(&app(0), &[], full_flags()).await.unwrap();
    assert_eq!(
        single_success(&report).metadata.descriptor.certificate_checksums,
        vec![SIGNING_CERT]
    );
}

#[tokio::test]
async fn test_restore_refuses_differently_signed_install() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    resign_installed(&device, &"ee".repeat(32));
    let notes = format!("{}/files/notes.txt", ce_dir(0));
    device.write(&notes, "local change");

    let report = engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    assert!(matches!(single_error(&report), Error::IntegrityViolation { .. }));
    assert_eq!(device.read(&notes), "local change");

    // Data alone does not need matching binaries
    let options = RestoreOptions::default().with_flags(SelectionFlags::INTERNAL_DATA);
    let report = engine.restore(&app(0), &[], &options).await.unwrap();
    assert!(!single_success(&report).binaries_installed);
    assert_eq!(device.read(&notes), "internal notes");
}

#[tokio::test]
async fn test_restore_without_signature_check_reinstalls() {
    let device = TestDevice::new();
    let engine = device.engine();
    engine.backup(&app(0), &[], full_flags()).await.unwrap();

    resign_installed(&device, &"ee".repeat(32));
    let options =
        RestoreOptions::default().with_flags(full_flags() | SelectionFlags::NO_SIGNATURE_CHECK);
    let report = engine.restore(&app(0), &[], &options).await.unwrap();
    assert!(single_success(&report).binaries_installed);

    let installed = device.packages.get(APP_ID, 0).unwrap();
    assert_eq!(installed.certificate_checksums, vec![SIGNING_CERT]);
}

#[tokio::test]
async fn test_misc_settings_restored_with_extras() {
    let device = TestDevice::new();
    let engine = device.engine();
    let report = engine.backup(&app(0), &[], full_flags()).await.unwrap();
    assert!(single_success(&report).metadata.descriptor.has_misc_payload);

    let mut package = device.packages.get(APP_ID, 0).unwrap();
    package.misc = vec![MiscEntry::permission("android.permission.CAMERA", false)];
    device.packages.insert(package);

    let report = engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(single_success(&report).settings_applied, 2);
    assert_eq!(
        device.packages.export_misc(&app(0)).await.unwrap(),
        vec![
            MiscEntry::permission("android.permission.CAMERA", true),
            MiscEntry::new(MiscKind::AppOp, "63", "1"),
        ]
    );
}

#[tokio::test]
async fn test_misc_settings_skipped_without_extras() {
    let device = TestDevice::new();
    let engine = device.engine();
    let flags = full_flags() - SelectionFlags::EXTRAS;
    let report = engine.backup(&app(0), &[], flags).await.unwrap();
    let summary = single_success(&report);
    assert!(!summary.metadata.descriptor.has_misc_payload);
    assert!(!summary.instance_dir.join("misc.am.tsv").exists());

    let report = engine
        .restore(&app(0), &[], &RestoreOptions::default())
        .await
        .unwrap();
    assert_eq!(single_success(&report).settings_applied, 0);
}
