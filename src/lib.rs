//! A read/write FAT filesystem engine over a fixed-size block device.
//!
//! All three Microsoft FAT variants (FAT12, FAT16, FAT32) are multiplexed
//! through one engine: bit-exact on-disk layouts (BPB, FSInfo, FAT cells,
//! 32-byte directory entries, long-name chains), cluster-chain allocation
//! with redundant FAT copies, directory management with 8.3 + long-name
//! namespaces, and a random-access file abstraction with a single buffered
//! sector per open file.
//!
//! Layering, bottom to top: [`device::BlockDevice`] (sector store) →
//! [`bpb::BiosParameterBlock`] (geometry) → [`fat::Fat`] (allocation table)
//! → [`dir::Directory`] / [`entry`] (32-byte entry namespace) →
//! [`file::FatFile`] (byte streams) → [`fs::FileSystem`] (mount / format /
//! dismount glue). With the `std` feature the crate adds the manifest-backed
//! [`registry`] of mounted volumes and the [`path`] object consumers use to
//! address files as `<device>:/a/b`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod bpb;
pub mod check;
pub mod clock;
pub mod device;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod file;
pub mod fs;
#[cfg(feature = "std")]
pub mod path;
#[cfg(feature = "std")]
pub mod registry;

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryInto;

pub use bpb::{BiosParameterBlock, FatVariant, FsInfo};
pub use clock::{Clock, DateTime, FixedClock};
pub use device::{BlockDevice, RamDevice};
pub use dir::{DirEntry, Directory};
pub use entry::{LongDirEntry, ShortDirEntry};
pub use fat::Fat;
pub use file::{FatFile, Mode};
pub use fs::FileSystem;
#[cfg(feature = "std")]
pub use path::FatPath;
#[cfg(feature = "std")]
pub use registry::{BackendKind, VolumeRegistry};

// FSInfo signatures
pub const LEAD_SIGNATURE: u32 = 0x41615252;
pub const STRUCT_SIGNATURE: u32 = 0x61417272;
pub const TRAIL_SIGNATURE: u32 = 0xAA550000;

// Cluster numbers 0 and 1 are reserved; the first data cluster is 2.
pub const FREE_CLUSTER: u32 = 0x00000000;
pub const FIRST_DATA_CLUSTER: u32 = 2;

// File Attribute
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;
pub const ATTR_LONG_NAME_MASK: u8 = ATTR_LONG_NAME | ATTR_DIRECTORY | ATTR_ARCHIVE;

// Directory Entry
pub const DIRENT_SIZE: usize = 32;

/// For Short Directory Entry Name[0] and Long Directory Entry Ord
///
/// Deleted
pub const DIR_ENTRY_UNUSED: u8 = 0xE5;
/// For Short Directory Entry Name[0]: free, and every following entry free
pub const DIR_ENTRY_LAST_AND_UNUSED: u8 = 0x00;
/// Stand-in for an initial 0xE5 name byte (0xE5 is a valid KANJI lead byte)
pub const DIR_ENTRY_E5_SUBSTITUTE: u8 = 0x05;
/// For Long Directory Entry Ord as the last entry mask
///
/// The mask is for ord within one set. A long directory entry carries only
/// 13 UTF-16 units; names longer than that need multiple entries, numbered
/// from 1, with the last physical entry or'd with 0x40.
pub const LAST_LONG_ENTRY: u8 = 0x40;

// Directory Entry Name Length Capacity
pub const LONG_NAME_LEN_CAP: usize = 13;
pub const SHORT_NAME_LEN_CAP: usize = 11;
/// Longest legal long name, not counting the trailing NUL.
pub const LONG_NAME_MAX: usize = 255;
/// A coalesced logical entry never spans more physical slots than this
/// (13 * 20 = 260 > 255, the long-name maximum).
pub const LONG_SLOTS_CAP: usize = 20;

// Charactor
pub const SPACE: u8 = 0x20;
pub const DOT: u8 = 0x2E;

// FAT type boundaries. The one and only way that FAT type is determined:
// there is no such thing as a FAT12 volume with more than 4084 clusters,
// a FAT16 volume outside [4085, 65524], or a FAT32 volume below 65525.
pub const MAX_CLUSTER_FAT12: u32 = 4085;
pub const MAX_CLUSTER_FAT16: u32 = 65525;

/// FAT[1] high bit masks (FAT16/FAT32 only; FAT12 has no status bits).
///
/// Bit ClnShutBitMask -- If bit is 1, volume is "clean". If bit is 0, volume is "dirty".
/// Bit HrdErrBitMask  -- If this bit is 1, no disk read/write errors were encountered.
///                       If this bit is 0, the file system driver encountered a disk I/O
///                       error on the volume the last time it was mounted, which is an
///                       indicator that some sectors may have gone bad on the volume.
pub const CLN_SHUT_BIT_MASK_FAT16: u16 = 0x8000;
pub const HRD_ERR_BIT_MASK_FAT16: u16 = 0x4000;
pub const CLN_SHUT_BIT_MASK_FAT32: u32 = 0x08000000;
pub const HRD_ERR_BIT_MASK_FAT32: u32 = 0x04000000;

/// Everything that can go wrong in the engine, surfaced to callers.
///
/// I/O failures are additionally recovered locally (the offending cluster is
/// marked bad and the hard-error status cleared) before the operation
/// reports `IoError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Variant derived from the cluster count contradicts the caller or the volume.
    WrongFatType,
    /// Device size out of range for the requested variant, or a length field
    /// inconsistent with the chain backing it.
    WrongLength,
    /// Mount or format could not bring the volume to a usable state.
    InitializationFailure,
    /// The sector read as FSInfo does not carry the three signatures.
    NotFsiSector,
    /// A parameter outside its legal range (bytes-per-sector, year < 1980, ...).
    InvalidValue,
    NotEnoughSpace,
    FileNotFound,
    NameAlreadyExists,
    IllegalName,
    DirectoryOperationFailure,
    IoError,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            FsError::WrongFatType => "wrong FAT type",
            FsError::WrongLength => "length out of range",
            FsError::InitializationFailure => "initialization failure",
            FsError::NotFsiSector => "not an FSInfo sector",
            FsError::InvalidValue => "invalid value",
            FsError::NotEnoughSpace => "not enough space",
            FsError::FileNotFound => "file not found",
            FsError::NameAlreadyExists => "name already exists",
            FsError::IllegalName => "illegal name",
            FsError::DirectoryOperationFailure => "directory operation failure",
            FsError::IoError => "I/O error",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;

pub(crate) fn read_le_u16(input: &[u8]) -> u16 {
    let (int_bytes, _) = input.split_at(core::mem::size_of::<u16>());
    u16::from_le_bytes(int_bytes.try_into().unwrap())
}

pub(crate) fn read_le_u32(input: &[u8]) -> u32 {
    let (int_bytes, _) = input.split_at(core::mem::size_of::<u32>());
    u32::from_le_bytes(int_bytes.try_into().unwrap())
}

pub(crate) fn write_le_u16(out: &mut [u8], value: u16) {
    out[..2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_le_u32(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_le_bytes());
}

/// Checksum over the 11 short-name bytes, placed in every long entry of the
/// associated set.
///
/// Sum = 0;
/// for (FcbNameLen=11; FcbNameLen!=0; FcbNameLen--) {
///     Sum = ((Sum & 1) ? 0x80 : 0) + (Sum >> 1) + *pFcbName++;
/// }
pub fn short_name_checksum(name: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in name {
        sum = (if sum & 1 == 1 { 0x80u8 } else { 0 })
            .wrapping_add(sum >> 1)
            .wrapping_add(byte);
    }
    sum
}

/// Characters never legal in a name handed to the engine, long or short.
pub(crate) fn is_illegal(name: &str) -> bool {
    if name.is_empty() || name.len() > LONG_NAME_MAX {
        return true;
    }
    name.chars()
        .any(|ch| (ch as u32) < 0x20 || "\\/:*?\"<>|".contains(ch))
}

/// Split a name into its primary part and extension at the *last* period.
/// Leading periods belong to the primary part (".profile" has no extension).
pub(crate) fn split_name_ext(name: &str) -> (&str, &str) {
    match name {
        "." => (".", ""),
        ".." => ("..", ""),
        _ => {
            let stem = name.trim_start_matches('.');
            match stem.rfind('.') {
                Some(i) => {
                    let split = name.len() - stem.len() + i;
                    (&name[..split], &name[split + 1..])
                }
                None => (name, ""),
            }
        }
    }
}

/// Whether `name` fits a short directory entry as-is: OEM-safe characters,
/// no lower case, primary part at most 8 bytes and extension at most 3.
pub(crate) fn fits_short_name(name: &str) -> bool {
    let (primary, ext) = split_name_ext(name);
    if primary.is_empty() || primary.len() > 8 || ext.len() > 3 {
        return false;
    }
    if primary.starts_with('.') || primary.contains('.') {
        return false;
    }
    let oem_ok = |part: &str| {
        part.bytes().all(|b| {
            b.is_ascii_digit() || b.is_ascii_uppercase() || b"$%'-_@~`!(){}^#&".contains(&b)
        })
    };
    oem_ok(primary) && oem_ok(ext)
}

/// Split a long file name into 13-unit UTF-16LE pieces, NUL terminated and
/// 0xFFFF padded. A name that fits exactly is neither terminated nor padded.
pub(crate) fn long_name_split(name: &str) -> Vec<[u16; LONG_NAME_LEN_CAP]> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    let len = units.len();

    let lfn_cnt = (len + LONG_NAME_LEN_CAP - 1) / LONG_NAME_LEN_CAP;
    if len < lfn_cnt * LONG_NAME_LEN_CAP {
        units.push(0x0000);
        while units.len() < lfn_cnt * LONG_NAME_LEN_CAP {
            units.push(0xFFFF);
        }
    }
    units
        .chunks(LONG_NAME_LEN_CAP)
        .map(|x| {
            let mut arr = [0u16; LONG_NAME_LEN_CAP];
            arr.copy_from_slice(x);
            arr
        })
        .collect()
}

/// Build the basis 8.3 name for a long name: upper-cased, OEM-illegal
/// characters replaced with `_`, spaces and leading periods stripped, the
/// last period kept as the extension split.
///
/// Returns the 11 space-padded bytes and whether the result lost
/// information (and therefore needs a numeric tail even without a
/// collision).
pub(crate) fn basis_name(long: &str) -> ([u8; SHORT_NAME_LEN_CAP], bool) {
    let stripped: String = long.chars().filter(|&c| c != ' ').collect();
    let lossy_spaces = stripped.len() != long.len();
    let trimmed = stripped.trim_start_matches('.');
    let lossy_dots = trimmed.len() != stripped.len();
    let (primary, ext) = split_name_ext(trimmed);

    let mut lossy = lossy_spaces || lossy_dots;
    let mut out = [SPACE; SHORT_NAME_LEN_CAP];

    {
        let mut fill = |src: &str, start: usize, cap: usize| {
            let mut n = 0;
            for ch in src.chars() {
                if n == cap {
                    lossy = true;
                    break;
                }
                let up = ch.to_ascii_uppercase();
                if ch != up {
                    lossy = true;
                }
                let byte = if up.is_ascii()
                    && (up.is_ascii_digit()
                        || up.is_ascii_uppercase()
                        || b"$%'-_@~`!(){}^#&".contains(&(up as u8)))
                {
                    up as u8
                } else {
                    lossy = true;
                    b'_'
                };
                out[start + n] = byte;
                n += 1;
            }
        };

        fill(primary, 0, 8);
        fill(ext, 8, 3);
    }

    (out, lossy)
}

/// Insert the numeric tail `~k` into a basis name, truncating the primary
/// part as needed. `k` must fit the 8-byte primary field.
pub(crate) fn numeric_tail(basis: &[u8; SHORT_NAME_LEN_CAP], k: u32) -> [u8; SHORT_NAME_LEN_CAP] {
    let mut digits = [0u8; 7];
    let mut n = 0;
    let mut v = k;
    while v > 0 {
        digits[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
    }
    let tail_len = n + 1; // '~' plus digits

    let mut primary_len = basis[..8].iter().position(|&b| b == SPACE).unwrap_or(8);
    if primary_len == 0 {
        primary_len = 1; // a bare-extension name still gets one lead byte
    }
    let keep = primary_len.min(8 - tail_len);

    let mut out = *basis;
    out[keep] = b'~';
    for i in 0..n {
        out[keep + 1 + i] = digits[n - 1 - i];
    }
    for b in out[keep + tail_len..8].iter_mut() {
        *b = SPACE;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference() {
        // "VERYLO~1TXT" run through the Microsoft reference loop.
        let name = *b"VERYLO~1TXT";
        let mut sum: u32 = 0;
        for &b in name.iter() {
            sum = ((if sum & 1 == 1 { 0x80 } else { 0 }) + (sum >> 1) + b as u32) & 0xFF;
        }
        assert_eq!(short_name_checksum(&name), sum as u8);
    }

    #[test]
    fn split_keeps_last_period() {
        assert_eq!(split_name_ext("archive.tar.gz"), ("archive.tar", "gz"));
        assert_eq!(split_name_ext(".profile"), (".profile", ""));
        assert_eq!(split_name_ext("README"), ("README", ""));
        assert_eq!(split_name_ext("."), (".", ""));
    }

    #[test]
    fn basis_name_strips_and_upcases() {
        let (b, lossy) = basis_name("Very Long File Name.txt");
        assert_eq!(&b, b"VERYLONGTXT");
        assert!(lossy);

        let (b, lossy) = basis_name("HELLO.TXT");
        assert_eq!(&b, b"HELLO   TXT");
        assert!(!lossy);
    }

    #[test]
    fn numeric_tail_truncates_primary() {
        let (b, _) = basis_name("Very Long File Name.txt");
        assert_eq!(&numeric_tail(&b, 1), b"VERYLO~1TXT");
        assert_eq!(&numeric_tail(&b, 12), b"VERYL~12TXT");
    }

    #[test]
    fn long_name_split_pads() {
        let pieces = long_name_split("abc");
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0][..3], ['a' as u16, 'b' as u16, 'c' as u16]);
        assert_eq!(pieces[0][3], 0x0000);
        assert_eq!(pieces[0][4], 0xFFFF);

        // exactly 13 units: no terminator, no padding
        let pieces = long_name_split("abcdefghijklm");
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0][12], 'm' as u16);
    }
}
