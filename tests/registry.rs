//! Registry and path-space behavior against private manifests.

use fat_rs::device::ImageDevice;
use fat_rs::{
    BackendKind, DateTime, FatPath, FatVariant, FileSystem, FixedClock, RamDevice, VolumeRegistry,
};

use std::path::PathBuf;
use std::sync::Arc;

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(DateTime::new(2022, 7, 1, 9, 30, 0)))
}

const BLANK_LABEL: [u8; 11] = *b"           ";

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fat-rs-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn ram_registry(tag: &str) -> VolumeRegistry {
    let registry = VolumeRegistry::new(scratch_dir(tag).join("manifest"), clock());
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
    registry
        .register("vol0", device, BackendKind::Ram)
        .unwrap();
    registry
}

#[test]
fn path_navigation_and_io() {
    let registry = ram_registry("nav");

    let p = FatPath::new(&registry, "vol0:/docs/readme.txt").unwrap();
    assert!(!p.exists());
    assert!(p.parent().mkdirs());
    assert!(p.create_new_file().unwrap());
    assert!(!p.create_new_file().unwrap()); // second create: false
    assert!(p.exists());
    assert!(p.is_file());
    assert!(!p.is_directory());

    let mut f = p.open("rw").unwrap();
    f.write(b"hello").unwrap();
    f.close().unwrap();
    assert_eq!(p.length(), 5);
    assert_eq!(p.last_modified().unwrap().year, 2022);

    let docs = FatPath::new(&registry, "vol0:/docs").unwrap();
    assert!(docs.is_directory());
    assert_eq!(docs.list().unwrap(), vec!["readme.txt".to_string()]);

    // Globbing hook: predicate over entries.
    let txt = docs
        .list_with(|e| e.name.to_lowercase().ends_with(".txt"))
        .unwrap();
    assert_eq!(txt, vec!["readme.txt".to_string()]);
    let none = docs
        .list_with(|e| e.name.to_lowercase().ends_with(".bin"))
        .unwrap();
    assert!(none.is_empty());

    // Case-insensitive resolution, case-preserving listing.
    let upper = FatPath::new(&registry, "vol0:/DOCS/README.TXT").unwrap();
    assert!(upper.exists());
}

#[test]
fn path_rename_and_delete() {
    let registry = ram_registry("ren");

    let src = FatPath::new(&registry, "vol0:/a/file one.dat").unwrap();
    assert!(src.parent().mkdirs());
    assert!(src.create_new_file().unwrap());
    let mut f = src.open("rw").unwrap();
    f.write(&[9u8; 300]).unwrap();
    f.close().unwrap();

    // Missing destination parents are created on rename.
    let dst = FatPath::new(&registry, "vol0:/b/c/file two.dat").unwrap();
    assert!(src.rename_to(&dst));
    assert!(!src.exists());
    assert!(dst.exists());
    assert_eq!(dst.length(), 300);

    // Deleting a non-empty directory fails; bottom-up works.
    let b = FatPath::new(&registry, "vol0:/b").unwrap();
    assert!(!b.delete());
    assert!(dst.delete());
    assert!(FatPath::new(&registry, "vol0:/b/c").unwrap().delete());
    assert!(b.delete());
}

#[test]
fn rename_across_volumes_returns_false() {
    let registry = ram_registry("xvol");
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
    registry
        .register("vol1", device, BackendKind::Ram)
        .unwrap();

    let src = FatPath::new(&registry, "vol0:/X.TXT").unwrap();
    assert!(src.create_new_file().unwrap());
    let dst = FatPath::new(&registry, "vol1:/X.TXT").unwrap();
    assert!(!src.rename_to(&dst));
    assert!(src.exists());
    assert!(!dst.exists());
}

#[test]
fn set_last_modified_rejects_pre_1980() {
    let registry = ram_registry("times");
    let p = FatPath::new(&registry, "vol0:/T.TXT").unwrap();
    assert!(p.create_new_file().unwrap());

    assert!(p
        .set_last_modified(DateTime::new(1979, 1, 1, 0, 0, 0))
        .is_err());
    p.set_last_modified(DateTime::new(1999, 4, 5, 6, 7, 8))
        .unwrap();
    let stamp = p.last_modified().unwrap();
    assert_eq!(
        (stamp.year, stamp.month, stamp.day, stamp.hour, stamp.minute),
        (1999, 4, 5, 6, 7)
    );
}

#[test]
fn ram_volumes_not_recorded() {
    let dir = scratch_dir("ram-manifest");
    let manifest = dir.join("manifest");
    let registry = VolumeRegistry::new(&manifest, clock());

    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
    registry
        .register("scratch", device, BackendKind::Ram)
        .unwrap();

    assert!(registry.lookup("scratch").is_some());
    assert!(!manifest.exists());
}

#[test]
fn manifest_replay_and_bad_lines() {
    let dir = scratch_dir("replay");
    let manifest = dir.join("manifest");
    let image = dir.join("disk.img");
    let image_name = image.to_str().unwrap().to_string();

    {
        let device = ImageDevice::create(&image, 65_536, 512).unwrap();
        FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
        let registry = VolumeRegistry::new(&manifest, clock());
        let fs = registry
            .register(&image_name, device, BackendKind::Raf)
            .unwrap();
        fs.root_dir().create_file("KEEP.TXT", 0).unwrap();
        registry.shutdown();
    }

    let recorded = std::fs::read_to_string(&manifest).unwrap();
    assert_eq!(
        recorded,
        format!("{}\t{}\tRAF\n", image_name, 65_536u64 * 512)
    );

    // A garbage line is skipped with a log message, not fatal.
    std::fs::write(
        &manifest,
        format!("{}not\ta\tmanifest line\n", recorded),
    )
    .unwrap();

    let registry = VolumeRegistry::boot(&manifest, clock());
    let fs = registry.lookup(&image_name).expect("replayed volume");
    assert!(fs.root_dir().find("KEEP.TXT").unwrap().is_some());

    // Removing rewrites the manifest without the volume's line.
    registry.remove(&image_name).unwrap();
    let rewritten = std::fs::read_to_string(&manifest).unwrap();
    assert!(!rewritten.contains(&image_name));
}
