//! Directory management.
//!
//! On-disk layout of one named thing inside a directory file, low address
//! to high:
//!
//!   lde_n  (ord = n | 0x40, holds the name's last fragment)
//!   lde_n-1
//!   ...
//!   lde_1  (holds the name's first 13 characters)
//!   sde    (8.3 alias; owns cluster, size and times)
//!
//! The traversal below yields *logical* entries: a long-name set and its
//! short entry are coalesced into one [`DirEntry`], crossing cluster
//! boundaries where the set does. Orphaned long entries (bad order, bad
//! checksum, missing short entry) are skipped the way Microsoft drivers
//! skip them.
//!
//! The FAT12/16 root directory is not a cluster chain but a fixed run of
//! reserved sectors; it cannot grow, and running out of slots there is
//! `NotEnoughSpace`.

use crate::clock::DateTime;
use crate::entry::{attr_is_long_name, LongDirEntry, ShortDirEntry};
use crate::fs::FileSystem;
use crate::{
    basis_name, fits_short_name, is_illegal, long_name_split, numeric_tail, FsError, Result,
    ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED,
    LAST_LONG_ENTRY, LONG_SLOTS_CAP, SHORT_NAME_LEN_CAP, SPACE,
};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// Entry-class filter bits for [`Directory::iter_filtered`].
pub const FILTER_FILE: u8 = 0x01;
pub const FILTER_DIR: u8 = 0x02;
/// The `.` / `..` entries.
pub const FILTER_DOT: u8 = 0x04;
/// The volume-label entry (lives only in the root directory).
pub const FILTER_VOLUME: u8 = 0x08;
pub const FILTER_DEFAULT: u8 = FILTER_FILE | FILTER_DIR;

/// Absolute position of one 32-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPos {
    /// Absolute device sector holding the slot.
    pub sector: u64,
    /// Byte offset of the slot inside that sector.
    pub offset: usize,
    /// Governing cluster; 0 inside the fixed FAT12/16 root.
    pub cluster: u32,
    pub sector_in_cluster: usize,
    /// Slot lives in the fixed root region.
    pub is_root: bool,
}

/// One logical directory entry: the short entry plus, when present, the
/// coalesced long name and the physical slots the whole set occupies.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Long name when one is recorded, otherwise the 8.3 name.
    pub name: String,
    pub short: ShortDirEntry,
    /// Position of the short slot.
    pub pos: SlotPos,
    /// Every physical slot of the set, on-disk order (long slots first).
    pub slots: Vec<SlotPos>,
}

impl DirEntry {
    pub fn first_cluster(&self) -> u32 {
        self.short.first_cluster()
    }

    pub fn is_dir(&self) -> bool {
        self.short.is_dir()
    }

    pub fn file_size(&self) -> u32 {
        self.short.file_size
    }

    fn filter_class(&self) -> u8 {
        if self.short.is_dot() {
            FILTER_DOT
        } else if self.short.is_volume_id() {
            FILTER_VOLUME
        } else if self.short.is_dir() {
            FILTER_DIR
        } else {
            FILTER_FILE
        }
    }
}

/// A directory handle: the cluster chain (or fixed root run) plus the
/// volume it lives on.
#[derive(Clone)]
pub struct Directory {
    pub(crate) fs: Arc<FileSystem>,
    /// First cluster; 0 for the fixed FAT12/16 root.
    pub(crate) first_cluster: u32,
    pub(crate) is_root: bool,
}

impl Directory {
    pub(crate) fn new(fs: Arc<FileSystem>, first_cluster: u32, is_root: bool) -> Self {
        Self {
            fs,
            first_cluster,
            is_root,
        }
    }

    fn fixed_root(&self) -> bool {
        self.is_root && self.fs.bpb().root_entry_count != 0
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    /// Handle on a subdirectory found in this directory. A `..` entry
    /// recording cluster 0 leads back to the root.
    pub fn sub_dir(&self, entry: &DirEntry) -> Result<Directory> {
        if !entry.is_dir() {
            return Err(FsError::DirectoryOperationFailure);
        }
        if entry.first_cluster() == 0 {
            return Ok(Directory::new(
                Arc::clone(&self.fs),
                self.fs.bpb().root_cluster(),
                true,
            ));
        }
        Ok(Directory::new(
            Arc::clone(&self.fs),
            entry.first_cluster(),
            false,
        ))
    }

    /// Lazy traversal of logical entries (files and subdirectories only).
    pub fn iter(&self) -> DirIter {
        self.iter_filtered(FILTER_DEFAULT)
    }

    /// Lazy traversal with an entry-class mask of `FILTER_*` bits.
    pub fn iter_filtered(&self, mask: u8) -> DirIter {
        DirIter {
            cursor: SlotCursor::new(self),
            mask,
            done: false,
        }
    }

    pub fn list(&self) -> Result<Vec<DirEntry>> {
        self.iter().collect()
    }

    /// Case-insensitive lookup against both the long and the short name
    /// space.
    pub fn find(&self, name: &str) -> Result<Option<DirEntry>> {
        for entry in self.iter_filtered(FILTER_FILE | FILTER_DIR | FILTER_DOT) {
            let entry = entry?;
            if names_equal_ci(&entry.name, name)
                || names_equal_ci(&entry.short.display_name(), name)
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Walk a component path below this directory.
    pub fn resolve(&self, components: &[&str]) -> Result<Directory> {
        let mut current = self.clone();
        for comp in components {
            if comp.is_empty() || *comp == "." {
                continue;
            }
            let entry = current.find(comp)?.ok_or(FsError::FileNotFound)?;
            current = current.sub_dir(&entry)?;
        }
        Ok(current)
    }

    /// True when nothing beyond `.` and `..` remains.
    pub fn is_empty_dir(&self) -> Result<bool> {
        for entry in self.iter_filtered(FILTER_FILE | FILTER_DIR | FILTER_VOLUME) {
            entry?;
            return Ok(false);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // creation

    /// Create a file. `initial_len` bytes worth of zeroed clusters are
    /// pre-allocated; most callers pass 0 and let writes extend the file.
    pub fn create_file(&self, name: &str, initial_len: u32) -> Result<DirEntry> {
        self.create_entry(name, ATTR_ARCHIVE, initial_len, None, None)
    }

    /// Create a subdirectory with its `.` and `..` entries.
    pub fn create_dir(&self, name: &str) -> Result<DirEntry> {
        self.create_entry(name, ATTR_DIRECTORY, 0, None, None)
    }

    /// Shared creation path. `existing` carries (first_cluster, size) when
    /// the entry must point at an already-allocated chain (rename);
    /// `times` overrides the clock (rename keeps source stamps).
    pub(crate) fn create_entry(
        &self,
        name: &str,
        attr: u8,
        initial_len: u32,
        existing: Option<(u32, u32)>,
        times: Option<(DateTime, DateTime)>,
    ) -> Result<DirEntry> {
        if is_illegal(name) || name == "." || name == ".." {
            return Err(FsError::IllegalName);
        }
        if self.find(name)?.is_some() {
            return Err(FsError::NameAlreadyExists);
        }

        let is_dir = attr & ATTR_DIRECTORY != 0;
        let now = self.fs.now();
        let (created, written) = times.unwrap_or((now, now));

        // Committed order: FAT first, then zeroed data clusters (both in
        // alloc_clusters), directory slot bytes last.
        let (first_cluster, file_size) = match existing {
            Some((cluster, size)) => (cluster, size),
            None => {
                let cluster_size = self.fs.bpb().cluster_size() as u32;
                let need = if is_dir {
                    1
                } else {
                    ((initial_len + cluster_size - 1) / cluster_size) as usize
                };
                let chain = self.fs.alloc_clusters(need, None)?;
                (chain.first().copied().unwrap_or(0), initial_len)
            }
        };

        let result = self.place_entry(name, attr, first_cluster, file_size, created, written);
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                // The chain is unreferenced; hand it back before failing.
                if existing.is_none() && first_cluster != 0 {
                    let _ = self.fs.free_chain(first_cluster);
                }
                return Err(e);
            }
        };

        if is_dir && existing.is_none() {
            self.write_dot_entries(first_cluster, created, written)?;
        }
        Ok(entry)
    }

    fn place_entry(
        &self,
        name: &str,
        attr: u8,
        first_cluster: u32,
        file_size: u32,
        created: DateTime,
        written: DateTime,
    ) -> Result<DirEntry> {
        let (name11, long_pieces) = self.encode_name(name)?;

        let mut short = ShortDirEntry::new(&name11, attr, first_cluster, file_size, created)?;
        short.stamp_written(written)?;
        let checksum = short.checksum();

        let total_slots = long_pieces.len() + 1;
        let slots = self.find_free_run(total_slots)?;

        let mut images: Vec<[u8; DIRENT_SIZE]> = Vec::with_capacity(total_slots);
        let n = long_pieces.len();
        for (i, piece) in long_pieces.iter().rev().enumerate() {
            // Physically first slot carries the highest order plus the
            // end-of-set mark.
            let order = (n - i) as u8;
            let order = if i == 0 {
                order | LAST_LONG_ENTRY
            } else {
                order
            };
            images.push(LongDirEntry::new(order, checksum, *piece).to_bytes());
        }
        images.push(short.to_bytes());

        self.write_slots(&slots, &images)?;

        Ok(DirEntry {
            name: String::from(name),
            short,
            pos: slots[total_slots - 1],
            slots,
        })
    }

    /// Decide the 11-byte alias and the long-name pieces (empty when the
    /// name is already a legal 8.3 name).
    fn encode_name(&self, name: &str) -> Result<([u8; SHORT_NAME_LEN_CAP], Vec<[u16; 13]>)> {
        if fits_short_name(name) {
            let (name11, _) = basis_name(name);
            return Ok((name11, Vec::new()));
        }

        let pieces = long_name_split(name);
        if pieces.len() > LONG_SLOTS_CAP {
            return Err(FsError::IllegalName);
        }

        let (basis, lossy) = basis_name(name);
        let taken = self.short_names_in_use()?;
        let name11 = if !lossy && !taken.contains(&basis) {
            basis
        } else {
            // De-conflict with the numeric tail, ~1 upward.
            let mut k = 1u32;
            loop {
                let candidate = numeric_tail(&basis, k);
                if !taken.contains(&candidate) {
                    break candidate;
                }
                k += 1;
                if k > 999_999 {
                    return Err(FsError::NameAlreadyExists);
                }
            }
        };
        Ok((name11, pieces))
    }

    fn short_names_in_use(&self) -> Result<Vec<[u8; SHORT_NAME_LEN_CAP]>> {
        let mut names = Vec::new();
        for entry in self.iter_filtered(0xFF) {
            names.push(entry?.short.name_bytes());
        }
        Ok(names)
    }

    /// Write the `.` and `..` entries into the first (zeroed) cluster of a
    /// new directory. `..` points at the parent's first cluster, or 0 when
    /// the parent is the root (even on FAT32).
    fn write_dot_entries(
        &self,
        dir_cluster: u32,
        created: DateTime,
        written: DateTime,
    ) -> Result<()> {
        let mut dot_name = [SPACE; SHORT_NAME_LEN_CAP];
        dot_name[0] = b'.';
        let mut dot = ShortDirEntry::new(&dot_name, ATTR_DIRECTORY, dir_cluster, 0, created)?;
        dot.stamp_written(written)?;

        let mut dotdot_name = [SPACE; SHORT_NAME_LEN_CAP];
        dotdot_name[0] = b'.';
        dotdot_name[1] = b'.';
        let parent_cluster = if self.is_root { 0 } else { self.first_cluster };
        let mut dotdot =
            ShortDirEntry::new(&dotdot_name, ATTR_DIRECTORY, parent_cluster, 0, created)?;
        dotdot.stamp_written(written)?;

        let bps = self.fs.bpb().bytes_per_sector as usize;
        let sector = self.fs.bpb().first_sector_of_cluster(dir_cluster) as u64;
        let mut buf = vec![0u8; bps];
        self.fs.read_sector_into(sector, &mut buf)?;
        buf[0..DIRENT_SIZE].copy_from_slice(&dot.to_bytes());
        buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&dotdot.to_bytes());
        self.fs.write_sector_from(sector, &buf)
    }

    /// Rewrite `..` after a directory moved under a new parent.
    fn rewrite_dotdot(&self, dir_cluster: u32, new_parent: u32) -> Result<()> {
        let bps = self.fs.bpb().bytes_per_sector as usize;
        let sector = self.fs.bpb().first_sector_of_cluster(dir_cluster) as u64;
        let mut buf = vec![0u8; bps];
        self.fs.read_sector_into(sector, &mut buf)?;
        let mut dotdot = ShortDirEntry::from_bytes(&buf[DIRENT_SIZE..2 * DIRENT_SIZE]);
        dotdot.set_first_cluster(new_parent);
        buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(&dotdot.to_bytes());
        self.fs.write_sector_from(sector, &buf)
    }

    // ------------------------------------------------------------------
    // deletion and rename

    /// Delete a named entry. Returns Ok(false) when the target is a
    /// directory that still has content; marking every physical slot free
    /// and releasing the chain otherwise.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let entry = self.find(name)?.ok_or(FsError::FileNotFound)?;
        if entry.short.is_dot() {
            return Err(FsError::DirectoryOperationFailure);
        }
        if entry.is_dir() && !self.sub_dir(&entry)?.is_empty_dir()? {
            return Ok(false);
        }

        self.free_slots(&entry.slots)?;
        if entry.first_cluster() != 0 {
            self.fs.free_chain(entry.first_cluster())?;
        }
        Ok(true)
    }

    /// Rename/move within one volume. The destination entry is created
    /// first (same chain, same length, source timestamps); the source
    /// slots are freed last, with a best-effort rewrite if freeing fails
    /// half way.
    pub fn rename(&self, src_name: &str, dst_dir: &Directory, dst_name: &str) -> Result<()> {
        let src = self.find(src_name)?.ok_or(FsError::FileNotFound)?;
        if src.short.is_dot() {
            return Err(FsError::DirectoryOperationFailure);
        }
        if dst_dir.find(dst_name)?.is_some() {
            return Err(FsError::NameAlreadyExists);
        }
        if src.is_dir() && !self.sub_dir(&src)?.is_empty_dir()? {
            return Err(FsError::DirectoryOperationFailure);
        }

        let times = (src.short.created(), src.short.modified());
        dst_dir.create_entry(
            dst_name,
            src.short.attr,
            0,
            Some((src.first_cluster(), src.short.file_size)),
            Some(times),
        )?;

        if src.is_dir() && src.first_cluster() != 0 {
            dst_dir.rewrite_dotdot(src.first_cluster(), if dst_dir.is_root {
                0
            } else {
                dst_dir.first_cluster
            })?;
        }

        if let Err(e) = self.free_slots(&src.slots) {
            // Half-freed source: put the original images back as well as
            // the medium lets us.
            let images: Vec<[u8; DIRENT_SIZE]> = self
                .read_slot_images(&src.slots)
                .unwrap_or_default();
            if images.len() == src.slots.len() {
                let _ = self.write_slots(&src.slots, &images);
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // slot plumbing

    /// Find `k` consecutive free slots, extending the directory with
    /// zeroed clusters when the existing region runs out. A run may
    /// legally straddle a cluster boundary. The fixed FAT12/16 root
    /// cannot grow.
    fn find_free_run(&self, k: usize) -> Result<Vec<SlotPos>> {
        let mut run: Vec<SlotPos> = Vec::with_capacity(k);
        let mut cursor = SlotCursor::new(self);
        let mut last_cluster = self.first_cluster;

        while let Some((pos, bytes)) = cursor.next_slot()? {
            if pos.cluster != 0 {
                last_cluster = pos.cluster;
            }
            if bytes[0] == DIR_ENTRY_UNUSED || bytes[0] == DIR_ENTRY_LAST_AND_UNUSED {
                run.push(pos);
                if run.len() == k {
                    return Ok(run);
                }
            } else {
                run.clear();
            }
        }

        if self.fixed_root() {
            return Err(FsError::NotEnoughSpace);
        }

        // Grow the chain; fresh clusters arrive zeroed, so every slot in
        // them is free.
        let bpb = self.fs.bpb();
        let bps = bpb.bytes_per_sector as usize;
        let spc = bpb.sectors_per_cluster as usize;
        let slots_per_cluster = spc * bps / DIRENT_SIZE;
        let missing = k - run.len();
        let clusters = (missing + slots_per_cluster - 1) / slots_per_cluster;
        let tail = if last_cluster == 0 {
            None
        } else {
            Some(self.fs.chain_tail(last_cluster)?)
        };
        let new_clusters = self.fs.alloc_clusters(clusters, tail)?;

        for &cluster in new_clusters.iter() {
            let first_sector = bpb.first_sector_of_cluster(cluster) as u64;
            for sector_in_cluster in 0..spc {
                for slot in 0..bps / DIRENT_SIZE {
                    run.push(SlotPos {
                        sector: first_sector + sector_in_cluster as u64,
                        offset: slot * DIRENT_SIZE,
                        cluster,
                        sector_in_cluster,
                        is_root: false,
                    });
                    if run.len() == k {
                        return Ok(run);
                    }
                }
            }
        }
        // alloc_clusters sized the extension to cover `missing`.
        Err(FsError::NotEnoughSpace)
    }

    /// Write slot images in order, batching per sector; a run straddling a
    /// cluster boundary becomes two sector writes.
    fn write_slots(&self, slots: &[SlotPos], images: &[[u8; DIRENT_SIZE]]) -> Result<()> {
        debug_assert_eq!(slots.len(), images.len());
        let bps = self.fs.bpb().bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut loaded: Option<u64> = None;

        for (pos, image) in slots.iter().zip(images.iter()) {
            if loaded != Some(pos.sector) {
                if let Some(sector) = loaded {
                    self.fs.write_sector_from(sector, &buf)?;
                }
                self.fs.read_sector_into(pos.sector, &mut buf)?;
                loaded = Some(pos.sector);
            }
            buf[pos.offset..pos.offset + DIRENT_SIZE].copy_from_slice(image);
        }
        if let Some(sector) = loaded {
            self.fs.write_sector_from(sector, &buf)?;
        }
        Ok(())
    }

    fn read_slot_images(&self, slots: &[SlotPos]) -> Result<Vec<[u8; DIRENT_SIZE]>> {
        let bps = self.fs.bpb().bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut loaded: Option<u64> = None;
        let mut images = Vec::with_capacity(slots.len());
        for pos in slots {
            if loaded != Some(pos.sector) {
                self.fs.read_sector_into(pos.sector, &mut buf)?;
                loaded = Some(pos.sector);
            }
            let mut image = [0u8; DIRENT_SIZE];
            image.copy_from_slice(&buf[pos.offset..pos.offset + DIRENT_SIZE]);
            images.push(image);
        }
        Ok(images)
    }

    /// Mark every slot of a set free (0xE5 in the first byte).
    fn free_slots(&self, slots: &[SlotPos]) -> Result<()> {
        let bps = self.fs.bpb().bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        let mut loaded: Option<u64> = None;
        for pos in slots {
            if loaded != Some(pos.sector) {
                if let Some(sector) = loaded {
                    self.fs.write_sector_from(sector, &buf)?;
                }
                self.fs.read_sector_into(pos.sector, &mut buf)?;
                loaded = Some(pos.sector);
            }
            buf[pos.offset] = DIR_ENTRY_UNUSED;
        }
        if let Some(sector) = loaded {
            self.fs.write_sector_from(sector, &buf)?;
        }
        Ok(())
    }
}

fn names_equal_ci(a: &str, b: &str) -> bool {
    let mut ai = a.chars().flat_map(char::to_lowercase);
    let mut bi = b.chars().flat_map(char::to_lowercase);
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x == y => {}
            _ => return false,
        }
    }
}

/// Raw slot walker over a directory region: the fixed root run, or the
/// cluster chain. Yields every 32-byte slot, free or not; logical
/// consumers stop at the 0x00 terminator themselves.
struct SlotCursor {
    fs: Arc<FileSystem>,
    fixed_root: bool,
    // fixed root run
    root_first: u64,
    next_sector: u64,
    end_sector: u64,
    // chain walk
    cluster: u32,
    sector_in_cluster: usize,
    spc: usize,
    bps: usize,
    offset: usize,
    buf: Vec<u8>,
    buf_sector: Option<u64>,
    pushback: Option<(SlotPos, [u8; DIRENT_SIZE])>,
    done: bool,
}

impl SlotCursor {
    fn new(dir: &Directory) -> Self {
        let bpb = dir.fs.bpb();
        let bps = bpb.bytes_per_sector as usize;
        let fixed_root = dir.fixed_root();
        let (root_first, end_sector) = if fixed_root {
            let first = bpb.first_root_dir_sector() as u64;
            (first, first + bpb.root_dir_sectors() as u64)
        } else {
            (0, 0)
        };
        Self {
            fs: Arc::clone(&dir.fs),
            fixed_root,
            root_first,
            next_sector: root_first,
            end_sector,
            cluster: dir.first_cluster,
            sector_in_cluster: 0,
            spc: bpb.sectors_per_cluster as usize,
            bps,
            offset: 0,
            buf: vec![0u8; bps],
            buf_sector: None,
            pushback: None,
            done: false,
        }
    }

    fn push_back(&mut self, slot: (SlotPos, [u8; DIRENT_SIZE])) {
        self.pushback = Some(slot);
    }

    fn next_slot(&mut self) -> Result<Option<(SlotPos, [u8; DIRENT_SIZE])>> {
        if let Some(slot) = self.pushback.take() {
            return Ok(Some(slot));
        }
        if self.done {
            return Ok(None);
        }

        let (sector, pos) = if self.fixed_root {
            if self.offset >= self.bps {
                self.offset = 0;
                self.next_sector += 1;
            }
            if self.next_sector >= self.end_sector {
                self.done = true;
                return Ok(None);
            }
            let sector = self.next_sector;
            (
                sector,
                SlotPos {
                    sector,
                    offset: self.offset,
                    cluster: 0,
                    sector_in_cluster: (sector - self.root_first) as usize,
                    is_root: true,
                },
            )
        } else {
            if self.cluster < 2 {
                self.done = true;
                return Ok(None);
            }
            if self.offset >= self.bps {
                self.offset = 0;
                self.sector_in_cluster += 1;
                if self.sector_in_cluster == self.spc {
                    self.sector_in_cluster = 0;
                    match self.fs.chain_next(self.cluster)? {
                        Some(next) => self.cluster = next,
                        None => {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                }
            }
            let sector = self.fs.bpb().first_sector_of_cluster(self.cluster) as u64
                + self.sector_in_cluster as u64;
            (
                sector,
                SlotPos {
                    sector,
                    offset: self.offset,
                    cluster: self.cluster,
                    sector_in_cluster: self.sector_in_cluster,
                    is_root: false,
                },
            )
        };

        if self.buf_sector != Some(sector) {
            self.fs.read_sector_into(sector, &mut self.buf)?;
            self.buf_sector = Some(sector);
        }
        let mut bytes = [0u8; DIRENT_SIZE];
        bytes.copy_from_slice(&self.buf[self.offset..self.offset + DIRENT_SIZE]);
        self.offset += DIRENT_SIZE;
        Ok(Some((pos, bytes)))
    }

    /// Coalesce the next logical entry, skipping free slots and orphaned
    /// long sets, stopping at the 0x00 terminator or the region's end.
    fn next_logical(&mut self) -> Result<Option<DirEntry>> {
        'outer: loop {
            let (pos, bytes) = match self.next_slot()? {
                Some(s) => s,
                None => return Ok(None),
            };
            if bytes[0] == DIR_ENTRY_LAST_AND_UNUSED {
                return Ok(None);
            }
            if bytes[0] == DIR_ENTRY_UNUSED {
                continue;
            }

            if !attr_is_long_name(bytes[11]) {
                let short = ShortDirEntry::from_bytes(&bytes);
                return Ok(Some(DirEntry {
                    name: short.display_name(),
                    short,
                    pos,
                    slots: vec![pos],
                }));
            }

            // Start of a long set: must carry the end-of-set mark and a
            // sane order, or it is an orphan.
            let first = LongDirEntry::from_bytes(&bytes);
            if !first.is_last_in_set()
                || first.seq() == 0
                || first.seq() as usize > LONG_SLOTS_CAP
            {
                continue;
            }
            let n = first.seq();
            let checksum = first.checksum;
            let mut frags = vec![first];
            let mut slots = vec![pos];

            // Orders must run contiguously from n down to 1.
            for expected in (1..n).rev() {
                let (p2, b2) = match self.next_slot()? {
                    Some(s) => s,
                    None => return Ok(None),
                };
                if b2[0] == DIR_ENTRY_LAST_AND_UNUSED {
                    return Ok(None);
                }
                if b2[0] == DIR_ENTRY_UNUSED || !attr_is_long_name(b2[11]) {
                    self.push_back((p2, b2));
                    continue 'outer;
                }
                let lde = LongDirEntry::from_bytes(&b2);
                if lde.seq() != expected || lde.is_last_in_set() || lde.checksum != checksum {
                    self.push_back((p2, b2));
                    continue 'outer;
                }
                frags.push(lde);
                slots.push(p2);
            }

            // The short entry must follow immediately and agree on the
            // checksum, or the whole set is orphaned.
            let (short_pos, short_bytes) = match self.next_slot()? {
                Some(s) => s,
                None => return Ok(None),
            };
            if short_bytes[0] == DIR_ENTRY_LAST_AND_UNUSED {
                return Ok(None);
            }
            if short_bytes[0] == DIR_ENTRY_UNUSED || attr_is_long_name(short_bytes[11]) {
                self.push_back((short_pos, short_bytes));
                continue;
            }
            let short = ShortDirEntry::from_bytes(&short_bytes);
            if short.checksum() != checksum {
                return Ok(Some(DirEntry {
                    name: short.display_name(),
                    short,
                    pos: short_pos,
                    slots: vec![short_pos],
                }));
            }

            // Logical order is the reverse of physical order; only the
            // highest fragment is NUL terminated.
            let mut units: Vec<u16> = Vec::with_capacity(n as usize * 13);
            for frag in frags.iter().rev() {
                frag.push_units(&mut units);
            }
            slots.push(short_pos);
            return Ok(Some(DirEntry {
                name: String::from_utf16_lossy(&units),
                short,
                pos: short_pos,
                slots,
            }));
        }
    }
}

/// Iterator over a directory's logical entries.
pub struct DirIter {
    cursor: SlotCursor,
    mask: u8,
    done: bool,
}

impl Iterator for DirIter {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.cursor.next_logical() {
                Ok(Some(entry)) => {
                    if entry.filter_class() & self.mask != 0 {
                        return Some(Ok(entry));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
