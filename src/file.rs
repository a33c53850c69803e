//! Random-access files over cluster chains.
//!
//! An open file is a cluster chain plus a logical byte length (possibly
//! larger than the on-disk-recorded length until close), a byte position,
//! and one cached sector with a dirty flag. Writes that stay inside the
//! cached sector never touch the device; switching sectors flushes then
//! loads. This buffer is the only cache the engine keeps.
//!
//! Open-file records are shared: every handle opened on the same directory
//! entry references one refcounted record, and the record's length and
//! timestamps are committed back into the 32-byte entry when a handle
//! closes (immediately, under the write-through flag).

use crate::dir::{DirEntry, Directory, SlotPos};
use crate::fs::FileSystem;
use crate::{FsError, Result};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

/// Access mode. `Closed -> Open(R|RW) -> Closed`; a reopen may never
/// escalate an existing read-only record to read-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    ReadWrite,
}

impl Mode {
    /// Parse the conventional `"r"` / `"rw"` strings.
    pub fn parse(s: &str) -> Result<Mode> {
        match s {
            "r" => Ok(Mode::Read),
            "rw" => Ok(Mode::ReadWrite),
            _ => Err(FsError::InvalidValue),
        }
    }
}

/// Shared state of one open directory entry.
pub(crate) struct OpenRecord {
    pub refs: u32,
    pub mode: Mode,
    pub write_through: bool,
    pub entry_pos: SlotPos,
    pub start_cluster: u32,
    /// Logical length; committed to the entry at close.
    pub length: u32,
    /// Length currently recorded on disk.
    pub disk_length: u32,
    pub meta_dirty: bool,
}

pub(crate) type SharedRecord = Arc<RwLock<OpenRecord>>;

impl Directory {
    /// Open a file in this directory.
    pub fn open_file(&self, name: &str, mode: Mode) -> Result<FatFile> {
        self.open_file_with(name, mode, false)
    }

    /// Open with an explicit write-through flag: metadata updates are
    /// persisted as they happen instead of at close.
    pub fn open_file_with(&self, name: &str, mode: Mode, write_through: bool) -> Result<FatFile> {
        let entry = self.find(name)?.ok_or(FsError::FileNotFound)?;
        if entry.is_dir() {
            return Err(FsError::DirectoryOperationFailure);
        }
        FatFile::from_entry(Arc::clone(&self.fs), &entry, mode, write_through)
    }
}

/// A random-access byte stream over one cluster chain.
pub struct FatFile {
    fs: Arc<FileSystem>,
    record: SharedRecord,
    key: (u64, usize),
    mode: Mode,
    open: bool,
    /// Next byte offset; may exceed the length after a long seek.
    pos: u32,
    /// Cluster containing the byte at `pos` (the start cluster until the
    /// chain is entered), with its index within the chain.
    cluster: u32,
    chain_idx: u32,
    sector_counter: usize,
    // the single cached sector
    buf: Vec<u8>,
    buf_sector: Option<u64>,
    dirty: bool,
}

impl FatFile {
    pub(crate) fn from_entry(
        fs: Arc<FileSystem>,
        entry: &DirEntry,
        mode: Mode,
        write_through: bool,
    ) -> Result<FatFile> {
        let key = (entry.pos.sector, entry.pos.offset);
        let record = fs.attach_record(key, entry, mode, write_through)?;
        let bps = fs.bpb().bytes_per_sector as usize;
        let start = record.read().start_cluster;
        Ok(FatFile {
            fs,
            record,
            key,
            mode,
            open: true,
            pos: 0,
            cluster: start,
            chain_idx: 0,
            sector_counter: 0,
            buf: vec![0u8; bps],
            buf_sector: None,
            dirty: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if !self.open || self.fs.is_sealed() {
            return Err(FsError::IoError);
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Logical length, including growth not yet committed to the entry.
    pub fn len(&self) -> u32 {
        self.record.read().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Move the byte position. Seeking beyond the chain stops the cluster
    /// walk at the terminal cluster: subsequent writes extend, subsequent
    /// reads return end-of-stream.
    pub fn seek(&mut self, pos: u32) -> Result<()> {
        self.check_open()?;
        self.pos = pos;
        self.locate()
    }

    /// Re-derive (cluster, chain_idx, sector_counter) for `pos`, walking
    /// forward from the current cluster or from the start after a rewind.
    fn locate(&mut self) -> Result<()> {
        let bpb = *self.fs.bpb();
        let cluster_size = bpb.cluster_size() as u32;
        let start = self.record.read().start_cluster;

        if start < 2 {
            self.cluster = start;
            self.chain_idx = 0;
            self.sector_counter = 0;
            return Ok(());
        }

        let target_idx = self.pos / cluster_size;
        if self.cluster < 2 || target_idx < self.chain_idx {
            self.cluster = start;
            self.chain_idx = 0;
        }
        while self.chain_idx < target_idx {
            match self.fs.chain_next(self.cluster)? {
                Some(next) => {
                    self.cluster = next;
                    self.chain_idx += 1;
                }
                None => break, // stop at the terminal cluster
            }
        }
        self.sector_counter = if self.chain_idx == target_idx {
            (self.pos % cluster_size) as usize / bpb.bytes_per_sector as usize
        } else {
            0
        };
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(sector) = self.buf_sector {
                self.fs.write_sector_from(sector, &self.buf)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Flush-then-load when the active sector changes.
    fn load(&mut self, sector: u64) -> Result<()> {
        if self.buf_sector == Some(sector) {
            return Ok(());
        }
        self.flush_buffer()?;
        self.fs.read_sector_into(sector, &mut self.buf)?;
        self.buf_sector = Some(sector);
        Ok(())
    }

    /// Read from the current position. A read past end of file returns 0
    /// (end-of-stream), not an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let length = self.record.read().length;
        if self.pos >= length || buf.is_empty() {
            return Ok(0);
        }

        let bpb = *self.fs.bpb();
        let bps = bpb.bytes_per_sector as usize;
        let end = (self.pos as u64 + buf.len() as u64).min(length as u64) as u32;
        let mut copied = 0usize;

        while self.pos < end {
            self.locate()?;
            // A chain shorter than the recorded length shorts the read.
            if self.cluster < 2 || self.chain_idx < self.pos / bpb.cluster_size() as u32 {
                break;
            }
            let sector =
                bpb.first_sector_of_cluster(self.cluster) as u64 + self.sector_counter as u64;
            self.load(sector)?;

            let offset = self.pos as usize % bps;
            let n = (bps - offset).min((end - self.pos) as usize);
            buf[copied..copied + n].copy_from_slice(&self.buf[offset..offset + n]);
            self.pos += n as u32;
            copied += n;
        }
        Ok(copied)
    }

    /// Read exactly at `offset` without disturbing sequential use beyond
    /// the position moving there.
    pub fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.seek(offset)?;
        self.read(buf)
    }

    /// Write at the current position, extending the file first when the
    /// write reaches past the current length.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        if self.mode == Mode::Read {
            return Err(FsError::IoError);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let end = self.pos as u64 + buf.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FsError::WrongLength);
        }
        let end = end as u32;
        if end > self.record.read().length {
            self.grow(end)?;
        }

        let bpb = *self.fs.bpb();
        let bps = bpb.bytes_per_sector as usize;
        let mut copied = 0usize;

        while self.pos < end {
            self.locate()?;
            if self.cluster < 2 {
                return Err(FsError::IoError);
            }
            let sector =
                bpb.first_sector_of_cluster(self.cluster) as u64 + self.sector_counter as u64;
            self.load(sector)?;

            let offset = self.pos as usize % bps;
            let n = (bps - offset).min((end - self.pos) as usize);
            self.buf[offset..offset + n].copy_from_slice(&buf[copied..copied + n]);
            self.dirty = true;
            self.pos += n as u32;
            copied += n;
        }
        Ok(copied)
    }

    pub fn write_at(&mut self, offset: u32, buf: &[u8]) -> Result<usize> {
        self.seek(offset)?;
        self.write(buf)
    }

    /// Truncate or extend to `new_len`.
    ///
    /// Shrinking walks to the cluster holding the new end, makes it EOC
    /// and frees the rest (or the whole chain at length 0). Growing
    /// allocates the deficit against the existing tail and zero-fills the
    /// gap between the old length and the old allocation boundary (fresh
    /// clusters arrive zeroed).
    pub fn set_len(&mut self, new_len: u32) -> Result<()> {
        self.check_open()?;
        if self.mode == Mode::Read {
            return Err(FsError::IoError);
        }
        let old_len = self.record.read().length;
        if new_len == old_len {
            return Ok(());
        }
        if new_len < old_len {
            self.shrink(new_len)
        } else {
            self.grow(new_len)
        }
    }

    fn shrink(&mut self, new_len: u32) -> Result<()> {
        // The buffer may cache a sector of the region being freed.
        self.flush_buffer()?;
        self.buf_sector = None;

        let cluster_size = self.fs.bpb().cluster_size() as u32;
        let start = self.record.read().start_cluster;
        let new_clusters = (new_len + cluster_size - 1) / cluster_size;

        if start >= 2 {
            if new_clusters == 0 {
                self.fs.free_chain(start)?;
                self.update_start_cluster(0)?;
            } else if let Some(keep) = self.fs.cluster_at(start, new_clusters - 1)? {
                self.fs.free_chain_keeping_head(keep)?;
            }
        }

        self.set_record_length(new_len)?;
        if self.pos > new_len {
            self.pos = new_len;
        }
        self.cluster = self.record.read().start_cluster;
        self.chain_idx = 0;
        self.locate()
    }

    fn grow(&mut self, new_len: u32) -> Result<()> {
        self.flush_buffer()?;
        self.buf_sector = None;

        let cluster_size = self.fs.bpb().cluster_size() as u32;
        let (start, old_len) = {
            let rec = self.record.read();
            (rec.start_cluster, rec.length)
        };
        let old_clusters = (old_len + cluster_size - 1) / cluster_size;
        let new_clusters = (new_len + cluster_size - 1) / cluster_size;

        if new_clusters > old_clusters || (start < 2 && new_clusters > 0) {
            let have = if start >= 2 { old_clusters } else { 0 };
            let deficit = (new_clusters - have) as usize;
            let tail = if start >= 2 {
                Some(self.fs.chain_tail(start)?)
            } else {
                None
            };
            let chain = self.fs.alloc_clusters(deficit, tail)?;
            if start < 2 {
                let new_start = chain.first().copied().unwrap_or(0);
                self.update_start_cluster(new_start)?;
                self.cluster = new_start;
                self.chain_idx = 0;
            }
        }

        // Stale bytes between the old length and the old allocation
        // boundary would otherwise leak through; newly allocated clusters
        // are already zero.
        if start >= 2 && old_len < old_clusters * cluster_size {
            let boundary = (old_clusters * cluster_size).min(new_len);
            self.zero_range(old_len, boundary)?;
        }

        self.set_record_length(new_len)
    }

    /// Zero bytes [from, to) of the already-allocated region.
    fn zero_range(&mut self, from: u32, to: u32) -> Result<()> {
        let bpb = *self.fs.bpb();
        let bps = bpb.bytes_per_sector as usize;
        let cluster_size = bpb.cluster_size() as u32;
        let start = self.record.read().start_cluster;
        let mut pos = from;

        while pos < to {
            let idx = pos / cluster_size;
            let cluster = match self.fs.cluster_at(start, idx)? {
                Some(c) => c,
                None => break,
            };
            let in_cluster = (pos % cluster_size) as usize;
            let sector =
                bpb.first_sector_of_cluster(cluster) as u64 + (in_cluster / bps) as u64;
            let offset = in_cluster % bps;
            let n = (bps - offset).min((to - pos) as usize);

            self.load(sector)?;
            self.buf[offset..offset + n].iter_mut().for_each(|b| *b = 0);
            self.dirty = true;
            pos += n as u32;
        }
        self.flush_buffer()
    }

    fn update_start_cluster(&mut self, cluster: u32) -> Result<()> {
        let pos = {
            let mut rec = self.record.write();
            rec.start_cluster = cluster;
            rec.entry_pos
        };
        // The cluster pointer is persisted immediately: the chain is
        // already linked and zeroed, so the entry may reference it.
        self.fs.update_short_entry(pos, |sde| {
            sde.set_first_cluster(cluster);
        })
    }

    fn set_record_length(&mut self, new_len: u32) -> Result<()> {
        let write_through = {
            let mut rec = self.record.write();
            rec.length = new_len;
            rec.meta_dirty = true;
            rec.write_through
        };
        if write_through {
            self.fs.commit_record(&self.record)?;
        }
        Ok(())
    }

    /// Flush the cached sector and commit length and timestamps to the
    /// directory entry; the record is torn down when the last holder
    /// closes.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(FsError::IoError);
        }
        self.open = false;
        // The record is detached even when the flush fails; a handle never
        // survives its close.
        let flushed = self.flush_buffer();
        self.buf_sector = None;
        let detached = self.fs.detach_record(self.key, &self.record);
        flushed.and(detached)
    }
}

impl Drop for FatFile {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}
