//! Block device interface
//!
//! The engine consumes a random-access byte store addressed by fixed-size
//! sectors. The sector size is fixed when the device is opened and must
//! equal the mounted BPB's bytes-per-sector.

use crate::{FsError, Result};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;
use spin::RwLock;

pub trait BlockDevice: Send + Sync + Any {
    /// Read one sector into `buf`. `buf.len()` must equal `sector_size()`.
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one sector from `buf`. `buf.len()` must equal `sector_size()`.
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()>;

    fn num_sectors(&self) -> u64;

    fn sector_size(&self) -> usize;

    /// Release the underlying medium. Reads and writes after `close` fail.
    fn close(&self) {}
}

/// Memory-backed device. The cheapest way to get a volume under test, and
/// the backend behind `RAM` registry entries.
pub struct RamDevice {
    sectors: RwLock<Vec<u8>>,
    sector_size: usize,
    num_sectors: u64,
}

impl RamDevice {
    pub fn new(num_sectors: u64, sector_size: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: RwLock::new(vec![0u8; num_sectors as usize * sector_size]),
            sector_size,
            num_sectors,
        })
    }

    fn range(&self, sector: u64, len: usize) -> Result<(usize, usize)> {
        if sector >= self.num_sectors || len != self.sector_size {
            return Err(FsError::IoError);
        }
        let start = sector as usize * self.sector_size;
        Ok((start, start + self.sector_size))
    }
}

impl BlockDevice for RamDevice {
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.sectors.read()[start..end]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let (start, end) = self.range(sector, buf.len())?;
        self.sectors.write()[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    // There is nothing to flush; the memory goes away when the last
    // holder drops the device.
}

#[cfg(feature = "std")]
pub use self::host::ImageDevice;

#[cfg(feature = "std")]
mod host {
    use super::BlockDevice;
    use crate::{FsError, Result};

    use alloc::sync::Arc;
    use spin::RwLock;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::path::Path;

    /// Host-filesystem-backed image (the `RAF` registry backend), also used
    /// for `NATIVE` raw partitions, which look like big files on Unix hosts.
    pub struct ImageDevice {
        file: RwLock<Option<File>>,
        sector_size: usize,
        num_sectors: u64,
    }

    impl ImageDevice {
        /// Open an existing image or raw device node.
        pub fn open<P: AsRef<Path>>(path: P, sector_size: usize) -> Result<Arc<Self>> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|_| FsError::IoError)?;
            let len = file.metadata().map_err(|_| FsError::IoError)?.len();
            Ok(Arc::new(Self {
                file: RwLock::new(Some(file)),
                sector_size,
                num_sectors: len / sector_size as u64,
            }))
        }

        /// Create (or truncate) an image file of `num_sectors` sectors.
        pub fn create<P: AsRef<Path>>(
            path: P,
            num_sectors: u64,
            sector_size: usize,
        ) -> Result<Arc<Self>> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|_| FsError::IoError)?;
            file.set_len(num_sectors * sector_size as u64)
                .map_err(|_| FsError::IoError)?;
            Ok(Arc::new(Self {
                file: RwLock::new(Some(file)),
                sector_size,
                num_sectors,
            }))
        }
    }

    impl BlockDevice for ImageDevice {
        fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
            if sector >= self.num_sectors || buf.len() != self.sector_size {
                return Err(FsError::IoError);
            }
            let mut guard = self.file.write();
            let file = guard.as_mut().ok_or(FsError::IoError)?;
            file.seek(SeekFrom::Start(sector * self.sector_size as u64))
                .map_err(|_| FsError::IoError)?;
            file.read_exact(buf).map_err(|_| FsError::IoError)
        }

        fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
            if sector >= self.num_sectors || buf.len() != self.sector_size {
                return Err(FsError::IoError);
            }
            let mut guard = self.file.write();
            let file = guard.as_mut().ok_or(FsError::IoError)?;
            file.seek(SeekFrom::Start(sector * self.sector_size as u64))
                .map_err(|_| FsError::IoError)?;
            file.write_all(buf).map_err(|_| FsError::IoError)
        }

        fn num_sectors(&self) -> u64 {
            self.num_sectors
        }

        fn sector_size(&self) -> usize {
            self.sector_size
        }

        fn close(&self) {
            // Dropping the handle flushes and closes it.
            *self.file.write() = None;
        }
    }
}
