//! End-to-end scenarios against RAM-backed volumes.

use fat_rs::bpb::BiosParameterBlock;
use fat_rs::{
    short_name_checksum, BlockDevice, DateTime, FatVariant, FileSystem, FixedClock, FsError,
    Mode, RamDevice,
};

use std::sync::Arc;

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(DateTime::new(2021, 3, 4, 12, 0, 0)))
}

const BLANK_LABEL: [u8; 11] = *b"           ";

/// The smallest conforming FAT16 footprint with 2 KiB clusters
/// (sectors-per-cluster = 4 by the Microsoft size table).
fn fat16_volume() -> (Arc<RamDevice>, Arc<FileSystem>) {
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
    let fs = FileSystem::mount(device.clone(), clock()).unwrap();
    (device, fs)
}

fn read_fat16_cell(device: &RamDevice, fat_start: u64, cluster: u32) -> u16 {
    let off = cluster as usize * 2;
    let mut buf = [0u8; 512];
    device
        .read_sector(fat_start + (off / 512) as u64, &mut buf)
        .unwrap();
    u16::from_le_bytes([buf[off % 512], buf[off % 512 + 1]])
}

fn write_fat16_cell(device: &RamDevice, fat_start: u64, cluster: u32, value: u16) {
    let off = cluster as usize * 2;
    let mut buf = [0u8; 512];
    let sector = fat_start + (off / 512) as u64;
    device.read_sector(sector, &mut buf).unwrap();
    buf[off % 512..off % 512 + 2].copy_from_slice(&value.to_le_bytes());
    device.write_sector(sector, &buf).unwrap();
}

fn chain_len_fat16(device: &RamDevice, fat_start: u64, start: u32) -> usize {
    let mut len = 0;
    let mut cur = start;
    while (2..0xFFF7).contains(&cur) {
        len += 1;
        cur = read_fat16_cell(device, fat_start, cur) as u32;
    }
    len
}

#[test]
fn create_write_read() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();

    root.create_file("HELLO.TXT", 0).unwrap();
    let mut f = root.open_file("HELLO.TXT", Mode::ReadWrite).unwrap();
    assert_eq!(f.write(b"Hello, world!").unwrap(), 13);
    f.close().unwrap();

    let mut f = root.open_file("HELLO.TXT", Mode::Read).unwrap();
    assert_eq!(f.len(), 13);
    let mut buf = [0u8; 13];
    assert_eq!(f.read(&mut buf).unwrap(), 13);
    assert_eq!(&buf, b"Hello, world!");

    // r-mode write attempts and post-close I/O both fail.
    assert_eq!(f.write(b"x"), Err(FsError::IoError));
    f.close().unwrap();
    assert_eq!(f.read(&mut buf), Err(FsError::IoError));
}

#[test]
fn extend_across_cluster_boundary() {
    let (device, fs) = fat16_volume();
    let boot = fs.raw_boot_sector().unwrap();
    let bpb = BiosParameterBlock::parse(&boot).unwrap();
    assert_eq!(bpb.sectors_per_cluster, 4); // 2048-byte clusters

    let root = fs.root_dir();
    root.create_file("A.BIN", 0).unwrap();
    let mut f = root.open_file("A.BIN", Mode::ReadWrite).unwrap();
    assert_eq!(f.write(&[0x41u8; 2050]).unwrap(), 2050);
    f.close().unwrap();

    let entry = root.find("A.BIN").unwrap().unwrap();
    assert_eq!(entry.file_size(), 2050);
    let fat_start = bpb.reserved_sectors as u64;
    assert_eq!(
        chain_len_fat16(&device, fat_start, entry.first_cluster()),
        2
    );

    let mut f = root.open_file("A.BIN", Mode::Read).unwrap();
    let mut byte = [0u8; 1];
    assert_eq!(f.read_at(2048, &mut byte).unwrap(), 1);
    assert_eq!(byte[0], 0x41);
    assert_eq!(f.read_at(2050, &mut byte).unwrap(), 0); // end-of-stream
    f.close().unwrap();
}

#[test]
fn long_name_creation() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();

    root.create_file("Very Long File Name.txt", 0).unwrap();

    let names: Vec<String> = root.list().unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["Very Long File Name.txt".to_string()]);

    // On disk: exactly 2 long slots before 1 short slot, checksum-linked.
    let bytes = fs.raw_root_dir().unwrap();
    let alias = b"VERYLO~1TXT";
    assert_eq!(bytes[0], 0x42); // order 2 | LAST_LONG_ENTRY
    assert_eq!(bytes[11], 0x0F);
    assert_eq!(bytes[32], 0x01); // order 1
    assert_eq!(bytes[32 + 11], 0x0F);
    assert_eq!(&bytes[64..64 + 11], alias);

    let sum = short_name_checksum(alias);
    assert_eq!(bytes[13], sum);
    assert_eq!(bytes[32 + 13], sum);

    // Lookup works through either name space, case-insensitively.
    assert!(root.find("very long file name.TXT").unwrap().is_some());
    assert!(root.find("VERYLO~1.TXT").unwrap().is_some());
}

#[test]
fn delete_non_empty_directory_fails() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();

    let d = root.create_dir("D").unwrap();
    let d_dir = root.sub_dir(&d).unwrap();
    d_dir.create_file("F", 0).unwrap();

    assert_eq!(root.remove("D").unwrap(), false);
    assert_eq!(d_dir.remove("F").unwrap(), true);
    assert_eq!(root.remove("D").unwrap(), true);
    assert!(root.find("D").unwrap().is_none());
}

#[test]
fn dot_entries_written() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();
    let d = root.create_dir("SUB").unwrap();
    let d_dir = root.sub_dir(&d).unwrap();

    let dot = d_dir.find(".").unwrap().unwrap();
    assert!(dot.is_dir());
    assert_eq!(dot.first_cluster(), d.first_cluster());
    let dotdot = d_dir.find("..").unwrap().unwrap();
    assert!(dotdot.is_dir());
    assert_eq!(dotdot.first_cluster(), 0); // parent is the root
}

#[test]
fn format_fat12_and_remount() {
    let device = RamDevice::new(2880, 512);
    FileSystem::format(device.clone(), FatVariant::Fat12, &BLANK_LABEL, clock()).unwrap();

    let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    {
        let fs = FileSystem::mount(device.clone(), clock()).unwrap();
        assert_eq!(fs.variant(), FatVariant::Fat12);
        let root = fs.root_dir();
        root.create_file("NOTE.TXT", 0).unwrap();
        let mut f = root.open_file("NOTE.TXT", Mode::ReadWrite).unwrap();
        f.write(&payload).unwrap();
        f.close().unwrap();
        fs.dismount().unwrap();
    }

    let fs = FileSystem::mount(device.clone(), clock()).unwrap();
    assert_eq!(fs.variant(), FatVariant::Fat12);
    let root = fs.root_dir();
    let mut f = root.open_file("NOTE.TXT", Mode::Read).unwrap();
    let mut back = vec![0u8; 256];
    assert_eq!(f.read(&mut back).unwrap(), 200);
    assert_eq!(&back[..200], &payload[..]);
    f.close().unwrap();
}

#[test]
fn recovery_after_unclean_shutdown() {
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();

    let (c1, c2);
    {
        let fs = FileSystem::mount(device.clone(), clock()).unwrap();
        let root = fs.root_dir();
        root.create_file("FILE1.BIN", 0).unwrap();
        let mut f = root.open_file("FILE1.BIN", Mode::ReadWrite).unwrap();
        f.write(&[0x41u8; 3000]).unwrap();
        f.close().unwrap();
        root.create_file("FILE2.BIN", 0).unwrap();
        let mut f = root.open_file("FILE2.BIN", Mode::ReadWrite).unwrap();
        f.write(&[0x42u8; 3000]).unwrap();
        f.close().unwrap();

        c1 = root.find("FILE1.BIN").unwrap().unwrap().first_cluster();
        c2 = root.find("FILE2.BIN").unwrap().unwrap().first_cluster();
        fs.dismount().unwrap();
    }

    let boot = {
        let mut buf = vec![0u8; 512];
        device.read_sector(0, &mut buf).unwrap();
        BiosParameterBlock::parse(&buf).unwrap()
    };
    let fat_start = boot.reserved_sectors as u64;
    let c1n = read_fat16_cell(&device, fat_start, c1) as u32;
    let c2n = read_fat16_cell(&device, fat_start, c2) as u32;
    assert!(c1n >= 2 && c2n >= 2);

    // Cross-link FILE2's chain into FILE1's in the active copy only; copy
    // 1 (replicated at dismount) keeps the disjoint view. Then clear the
    // clean-shutdown bit, leaving the hard-error bit set.
    write_fat16_cell(&device, fat_start, c2, c1n as u16);
    write_fat16_cell(&device, fat_start, 1, 0x7FFF);

    let fs = FileSystem::mount(device.clone(), clock()).unwrap();
    let root = fs.root_dir();

    // The chain check adopted the backup view: both files intact.
    let mut f = root.open_file("FILE1.BIN", Mode::Read).unwrap();
    let mut buf = vec![0u8; 3000];
    assert_eq!(f.read(&mut buf).unwrap(), 3000);
    assert!(buf.iter().all(|&b| b == 0x41));
    f.close().unwrap();

    let mut f = root.open_file("FILE2.BIN", Mode::Read).unwrap();
    assert_eq!(f.read(&mut buf).unwrap(), 3000);
    assert!(buf.iter().all(|&b| b == 0x42));
    f.close().unwrap();

    assert_eq!(read_fat16_cell(&device, fat_start, c2) as u32, c2n);
}

#[test]
fn dirty_bit_lifecycle() {
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, &BLANK_LABEL, clock()).unwrap();
    let fat_start = 1u64; // FAT16 format reserves a single sector

    // Freshly formatted: clean.
    assert_ne!(read_fat16_cell(&device, fat_start, 1) & 0x8000, 0);

    let fs = FileSystem::mount(device.clone(), clock()).unwrap();
    // Mounted: the clean-shutdown bit is cleared unconditionally.
    assert_eq!(read_fat16_cell(&device, fat_start, 1) & 0x8000, 0);

    fs.dismount().unwrap();
    assert_ne!(read_fat16_cell(&device, fat_start, 1) & 0x8000, 0);
}

#[test]
fn mode_escalation_refused() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();
    root.create_file("F.TXT", 0).unwrap();

    let r = root.open_file("F.TXT", Mode::Read).unwrap();
    assert!(matches!(
        root.open_file("F.TXT", Mode::ReadWrite),
        Err(FsError::IoError)
    ));
    drop(r);

    // After the read-only record is gone, read-write works again, and a
    // second reader may share a read-write record.
    let rw = root.open_file("F.TXT", Mode::ReadWrite).unwrap();
    let r2 = root.open_file("F.TXT", Mode::Read).unwrap();
    drop(r2);
    drop(rw);
}

#[test]
fn set_len_truncate_and_regrow() {
    let (device, fs) = fat16_volume();
    let root = fs.root_dir();
    root.create_file("T.BIN", 0).unwrap();

    let mut f = root.open_file("T.BIN", Mode::ReadWrite).unwrap();
    f.write(&[0xAAu8; 5000]).unwrap();
    f.set_len(1000).unwrap();
    assert_eq!(f.len(), 1000);
    f.close().unwrap();

    let boot = fs.raw_boot_sector().unwrap();
    let bpb = BiosParameterBlock::parse(&boot).unwrap();
    let entry = root.find("T.BIN").unwrap().unwrap();
    assert_eq!(entry.file_size(), 1000);
    assert_eq!(
        chain_len_fat16(&device, bpb.reserved_sectors as u64, entry.first_cluster()),
        1
    );

    // Regrow: the bytes between the old length and the new must read zero.
    let mut f = root.open_file("T.BIN", Mode::ReadWrite).unwrap();
    f.set_len(3000).unwrap();
    let mut buf = vec![0xFFu8; 2000];
    assert_eq!(f.read_at(1000, &mut buf).unwrap(), 2000);
    assert!(buf.iter().all(|&b| b == 0));
    f.close().unwrap();
}

#[test]
fn sparse_write_past_end_zero_fills() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();
    root.create_file("S.BIN", 0).unwrap();

    let mut f = root.open_file("S.BIN", Mode::ReadWrite).unwrap();
    f.write(&[0x11u8; 100]).unwrap();
    f.write_at(5000, b"X").unwrap();
    assert_eq!(f.len(), 5001);

    let mut byte = [0xFFu8; 1];
    assert_eq!(f.read_at(4999, &mut byte).unwrap(), 1);
    assert_eq!(byte[0], 0);
    assert_eq!(f.read_at(5000, &mut byte).unwrap(), 1);
    assert_eq!(byte[0], b'X');
    // Seeking past the chain is legal; the read just shorts.
    assert_eq!(f.read_at(100_000, &mut byte).unwrap(), 0);
    f.close().unwrap();
}

#[test]
fn rename_moves_entry_and_keeps_chain() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();

    root.create_file("OLD.TXT", 0).unwrap();
    let mut f = root.open_file("OLD.TXT", Mode::ReadWrite).unwrap();
    f.write(b"payload").unwrap();
    f.close().unwrap();
    let old_cluster = root.find("OLD.TXT").unwrap().unwrap().first_cluster();

    let d = root.create_dir("DST").unwrap();
    let dst = root.sub_dir(&d).unwrap();
    root.rename("OLD.TXT", &dst, "New Name.txt").unwrap();

    assert!(root.find("OLD.TXT").unwrap().is_none());
    let moved = dst.find("New Name.txt").unwrap().unwrap();
    assert_eq!(moved.first_cluster(), old_cluster);
    assert_eq!(moved.file_size(), 7);

    let mut f = dst.open_file("New Name.txt", Mode::Read).unwrap();
    let mut buf = [0u8; 7];
    f.read(&mut buf).unwrap();
    assert_eq!(&buf, b"payload");
    f.close().unwrap();

    // Renaming over an existing name is refused.
    dst.create_file("TAKEN.TXT", 0).unwrap();
    assert!(matches!(
        dst.rename("New Name.txt", &dst, "TAKEN.TXT"),
        Err(FsError::NameAlreadyExists)
    ));
}

#[test]
fn directory_grows_past_cluster_boundary() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();
    let d = root.create_dir("BIG").unwrap();
    let dir = root.sub_dir(&d).unwrap();

    // 3 long slots + 1 short slot each; 25 sets overflow the 64-slot
    // first cluster, so sets straddle the boundary and the chain grows.
    let names: Vec<String> = (0..25)
        .map(|i| format!("Some Legitimately Long {:02}.txt", i))
        .collect();
    for name in &names {
        dir.create_file(name, 0).unwrap();
    }

    let mut listed: Vec<String> = dir.list().unwrap().into_iter().map(|e| e.name).collect();
    listed.sort();
    let mut expected = names.clone();
    expected.sort();
    assert_eq!(listed, expected);

    for name in &names {
        assert!(dir.find(name).unwrap().is_some(), "missing {}", name);
    }
}

#[test]
fn numeric_tails_deconflict() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();
    root.create_file("Collision Name One.txt", 0).unwrap();
    root.create_file("Collision Name Two.txt", 0).unwrap();
    root.create_file("Collision Name Three.txt", 0).unwrap();

    let mut aliases: Vec<[u8; 11]> = root
        .list()
        .unwrap()
        .iter()
        .map(|e| e.short.name_bytes())
        .collect();
    aliases.sort();
    aliases.dedup();
    assert_eq!(aliases.len(), 3);
    assert!(aliases.contains(b"COLLIS~1TXT"));
    assert!(aliases.contains(b"COLLIS~2TXT"));
    assert!(aliases.contains(b"COLLIS~3TXT"));
}

#[test]
fn fixed_root_exhaustion() {
    let (_device, fs) = fat16_volume();
    let root = fs.root_dir();

    // The FAT16 root holds exactly 512 slots and cannot grow.
    for i in 0..512 {
        root.create_file(&format!("F{}.T", i), 0).unwrap();
    }
    assert!(matches!(
        root.create_file("OVERFLOW.T", 0),
        Err(FsError::NotEnoughSpace)
    ));
}

#[test]
fn free_pool_conservation() {
    let (device, fs) = fat16_volume();
    let root = fs.root_dir();

    root.create_file("ONE.BIN", 0).unwrap();
    let mut f = root.open_file("ONE.BIN", Mode::ReadWrite).unwrap();
    f.write(&[1u8; 6000]).unwrap();
    f.close().unwrap();
    root.create_file("TWO.BIN", 0).unwrap();
    let mut f = root.open_file("TWO.BIN", Mode::ReadWrite).unwrap();
    f.write(&[2u8; 3000]).unwrap();
    f.close().unwrap();
    assert!(root.remove("ONE.BIN").unwrap());

    let boot = fs.raw_boot_sector().unwrap();
    let bpb = BiosParameterBlock::parse(&boot).unwrap();
    let fat_start = bpb.reserved_sectors as u64;
    let mut used = 0u32;
    for cluster in 2..=bpb.last_cluster() {
        if read_fat16_cell(&device, fat_start, cluster) != 0 {
            used += 1;
        }
    }
    assert_eq!(fs.free_clusters() + used, bpb.count_of_clusters());
}

#[test]
fn volume_label_written_by_format() {
    let device = RamDevice::new(65_536, 512);
    FileSystem::format(device.clone(), FatVariant::Fat16, b"DATAVOL    ", clock()).unwrap();
    let fs = FileSystem::mount(device.clone(), clock()).unwrap();

    let bytes = fs.raw_root_dir().unwrap();
    assert_eq!(&bytes[0..11], b"DATAVOL    ");
    assert_eq!(bytes[11], 0x08); // ATTR_VOLUME_ID

    // The label entry is no ordinary listing entry.
    assert!(fs.root_dir().list().unwrap().is_empty());
}

#[test]
fn fat32_end_to_end() {
    let device = RamDevice::new(540_000, 512);
    FileSystem::format(device.clone(), FatVariant::Fat32, &BLANK_LABEL, clock()).unwrap();
    {
        let fs = FileSystem::mount(device.clone(), clock()).unwrap();
        assert_eq!(fs.variant(), FatVariant::Fat32);
        let root = fs.root_dir();
        root.create_dir("Nested Directory Name").unwrap();
        let d = root.find("Nested Directory Name").unwrap().unwrap();
        let dir = root.sub_dir(&d).unwrap();
        dir.create_file("payload.bin", 0).unwrap();
        let mut f = dir.open_file("payload.bin", Mode::ReadWrite).unwrap();
        f.write(&[0x5Au8; 10_000]).unwrap();
        f.close().unwrap();
        assert!(fs.free_clusters() > 0);
        fs.dismount().unwrap();
    }

    let fs = FileSystem::mount(device.clone(), clock()).unwrap();
    let root = fs.root_dir();
    let d = root.find("nested directory name").unwrap().unwrap();
    let dir = root.sub_dir(&d).unwrap();
    let mut f = dir.open_file("PAYLOAD.BIN", Mode::Read).unwrap();
    let mut buf = vec![0u8; 10_000];
    assert_eq!(f.read(&mut buf).unwrap(), 10_000);
    assert!(buf.iter().all(|&b| b == 0x5A));
    f.close().unwrap();

    // FSInfo survived the dismount with sane hints.
    let fsi = fat_rs::FsInfo::parse(&fs.raw_fsinfo().unwrap()).unwrap();
    let bpb = BiosParameterBlock::parse(&fs.raw_boot_sector().unwrap()).unwrap();
    assert!(fsi.free_count <= bpb.count_of_clusters());
}
