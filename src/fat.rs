//! The File Allocation Table.
//!
//! The FAT defines a singly linked list of the "extents" (clusters) of a
//! file. The table maps the data region by cluster number; the first data
//! cluster is cluster 2, and cells 0 and 1 are reserved (media byte and
//! EOC mark; on FAT16/FAT32 the two high bits of cell 1 carry the
//! clean-shutdown and hard-error status).
//!
//! Cell width is variant dependent:
//!
//! | Variant | Cell | Byte offset of cell `c` |
//! |---------|------|-------------------------|
//! | FAT12   | 12 bit, odd cells in the high nibbles | `c + c/2` |
//! | FAT16   | 16 bit | `2c` |
//! | FAT32   | 28 bit, top 4 bits reserved | `4c` |
//!
//! Because bytes-per-sector is always divisible by 2 and 4, a FAT16 or
//! FAT32 cell never spans a sector boundary. This is not true of FAT12:
//! reads and writes of a straddling cell must load the adjacent sector as
//! well.
//!
//! A FAT32 cell is not really a 32-bit value; the high 4 bits are reserved
//! and must be preserved on write. 0x10000000, 0xF0000000 and 0x00000000
//! all mean the cluster is FREE.
//!
//! There are `num_fats` identical copies of the table. Writes go to the
//! active copy; dismount replicates the active copy over the others. On
//! FAT32 with mirroring enabled (ExtFlags bit 7 clear) every write fans
//! out to all copies immediately.

use crate::bpb::{BiosParameterBlock, FatVariant, FsInfo, FSINFO_UNKNOWN};
use crate::device::BlockDevice;
use crate::{
    FsError, Result, CLN_SHUT_BIT_MASK_FAT16, CLN_SHUT_BIT_MASK_FAT32, FREE_CLUSTER,
    HRD_ERR_BIT_MASK_FAT16, HRD_ERR_BIT_MASK_FAT32,
};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

pub struct Fat {
    device: Arc<dyn BlockDevice>,
    variant: FatVariant,
    bytes_per_sector: usize,
    /// First sector of the FAT region (== reserved sector count).
    fat_area_start: u64,
    /// Sectors per FAT copy.
    fat_size: u64,
    num_copies: u8,
    active: u8,
    /// FAT32 runtime mirroring; always false for FAT12/16.
    mirroring: bool,
    media: u8,
    /// Maximum valid cluster number (count_of_clusters + 1).
    last_cluster: u32,
    /// In-memory free pool, FAT12/16 only, ascending, populated at mount.
    free_list: VecDeque<u32>,
    free_count: u32,
    /// FAT32 next-free hint; `FSINFO_UNKNOWN` when there is none.
    next_free: u32,
    /// Set when any device I/O failed during this session; decides whether
    /// dismount may set the clean-shutdown bit.
    io_error_noted: bool,
    // one staging sector for cell reads and read-modify-write splices
    buf: Vec<u8>,
    buf_sector: Option<u64>,
}

impl Fat {
    /// Bind the table described by `bpb`. For FAT32 the FSInfo hints are
    /// loaded (unparseable FSInfo degrades to "unknown"); for FAT12/16 the
    /// free pool is populated by scanning every cell from 2 to the last
    /// cluster.
    pub fn new(device: Arc<dyn BlockDevice>, bpb: &BiosParameterBlock) -> Result<Self> {
        let variant = bpb.variant();
        let mut fat = Self {
            device,
            variant,
            bytes_per_sector: bpb.bytes_per_sector as usize,
            fat_area_start: bpb.reserved_sectors as u64,
            fat_size: bpb.fat_size() as u64,
            num_copies: bpb.num_fats,
            active: bpb.active_fat().min(bpb.num_fats - 1),
            mirroring: variant == FatVariant::Fat32 && bpb.mirroring_enabled(),
            media: bpb.media,
            last_cluster: bpb.last_cluster(),
            free_list: VecDeque::new(),
            free_count: 0,
            next_free: FSINFO_UNKNOWN,
            io_error_noted: false,
            buf: vec![0u8; bpb.bytes_per_sector as usize],
            buf_sector: None,
        };

        match variant {
            FatVariant::Fat32 => {
                let hints = fat.load_fsinfo(bpb);
                fat.next_free = hints.next_free;
                if hints.free_count == FSINFO_UNKNOWN || hints.free_count > fat.last_cluster {
                    fat.free_count = fat.scan_free(false)?;
                } else {
                    fat.free_count = hints.free_count;
                }
            }
            _ => {
                fat.free_count = fat.scan_free(true)?;
            }
        }
        Ok(fat)
    }

    fn load_fsinfo(&mut self, bpb: &BiosParameterBlock) -> FsInfo {
        let sector = match bpb.fsinfo_sector() {
            Some(s) => s as u64,
            None => return FsInfo::unknown(),
        };
        let mut buf = vec![0u8; self.bytes_per_sector];
        match self.device.read_sector(sector, &mut buf) {
            Ok(()) => match FsInfo::parse(&buf) {
                Ok(fsi) => fsi,
                Err(_) => {
                    log::warn!("FSInfo sector {} carries bad signatures, hints ignored", sector);
                    FsInfo::unknown()
                }
            },
            Err(_) => {
                self.io_error_noted = true;
                FsInfo::unknown()
            }
        }
    }

    /// Scan every cell once; optionally populate the free list.
    fn scan_free(&mut self, keep_list: bool) -> Result<u32> {
        let mut free = 0u32;
        for cluster in 2..=self.last_cluster {
            if self.get(cluster)? == FREE_CLUSTER {
                free += 1;
                if keep_list {
                    self.free_list.push_back(cluster);
                }
            }
        }
        Ok(free)
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn last_cluster(&self) -> u32 {
        self.last_cluster
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn num_copies(&self) -> u8 {
        self.num_copies
    }

    pub fn io_error_noted(&self) -> bool {
        self.io_error_noted
    }

    pub fn note_io_error(&mut self) {
        self.io_error_noted = true;
    }

    /// The hints to persist into FSInfo at dismount.
    pub fn fsinfo(&self) -> FsInfo {
        FsInfo {
            free_count: self.free_count,
            next_free: self.next_free,
        }
    }

    pub fn is_eoc(&self, cell: u32) -> bool {
        self.variant.is_eoc(cell)
    }

    pub fn is_bad(&self, cell: u32) -> bool {
        self.variant.is_bad(cell)
    }

    fn copy_start(&self, copy: u8) -> u64 {
        self.fat_area_start + copy as u64 * self.fat_size
    }

    fn cell_byte_offset(&self, cluster: u32) -> u64 {
        let c = cluster as u64;
        match self.variant {
            FatVariant::Fat12 => c + c / 2,
            FatVariant::Fat16 => c * 2,
            FatVariant::Fat32 => c * 4,
        }
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster > self.last_cluster {
            return Err(FsError::InvalidValue);
        }
        Ok(())
    }

    fn load(&mut self, sector: u64) -> Result<()> {
        if self.buf_sector == Some(sector) {
            return Ok(());
        }
        self.buf_sector = None;
        self.device
            .read_sector(sector, &mut self.buf)
            .map_err(|e| {
                self.io_error_noted = true;
                e
            })?;
        self.buf_sector = Some(sector);
        Ok(())
    }

    /// Read up to 4 raw bytes at `off` within one FAT copy, crossing a
    /// sector boundary when a FAT12 cell straddles it.
    fn read_bytes(&mut self, copy: u8, off: u64, n: usize) -> Result<[u8; 4]> {
        let bps = self.bytes_per_sector as u64;
        let mut out = [0u8; 4];
        let mut sector = self.copy_start(copy) + off / bps;
        let mut idx = (off % bps) as usize;
        self.load(sector)?;
        for slot in out.iter_mut().take(n) {
            if idx == self.bytes_per_sector {
                sector += 1;
                self.load(sector)?;
                idx = 0;
            }
            *slot = self.buf[idx];
            idx += 1;
        }
        Ok(out)
    }

    /// Read-modify-write `data` at `off` within one FAT copy, splitting
    /// across two sectors when necessary.
    fn write_bytes(&mut self, copy: u8, off: u64, data: &[u8]) -> Result<()> {
        let bps = self.bytes_per_sector as u64;
        let mut written = 0;
        let mut sector = self.copy_start(copy) + off / bps;
        let mut idx = (off % bps) as usize;
        while written < data.len() {
            self.load(sector)?;
            while written < data.len() && idx < self.bytes_per_sector {
                self.buf[idx] = data[written];
                idx += 1;
                written += 1;
            }
            self.device.write_sector(sector, &self.buf).map_err(|e| {
                self.buf_sector = None;
                self.io_error_noted = true;
                e
            })?;
            sector += 1;
            idx = 0;
        }
        Ok(())
    }

    /// Read one cell from an arbitrary FAT copy (the chain check reads
    /// backup copies through this).
    pub fn get_from_copy(&mut self, copy: u8, cluster: u32) -> Result<u32> {
        self.check_cluster(cluster)?;
        let off = self.cell_byte_offset(cluster);
        match self.variant {
            FatVariant::Fat12 => {
                let b = self.read_bytes(copy, off, 2)?;
                let v = u16::from_le_bytes([b[0], b[1]]);
                Ok(if cluster & 1 == 1 {
                    (v >> 4) as u32
                } else {
                    (v & 0x0FFF) as u32
                })
            }
            FatVariant::Fat16 => {
                let b = self.read_bytes(copy, off, 2)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u32)
            }
            FatVariant::Fat32 => {
                let b = self.read_bytes(copy, off, 4)?;
                Ok(u32::from_le_bytes(b) & 0x0FFF_FFFF)
            }
        }
    }

    /// Read one cell from the active copy. FAT16 values include the status
    /// bits when `cluster == 1`; FAT32 values are masked to 28 bits.
    pub fn get(&mut self, cluster: u32) -> Result<u32> {
        self.get_from_copy(self.active, cluster)
    }

    fn set_in_copy(&mut self, copy: u8, cluster: u32, value: u32) -> Result<()> {
        let off = self.cell_byte_offset(cluster);
        match self.variant {
            FatVariant::Fat12 => {
                let b = self.read_bytes(copy, off, 2)?;
                let old = u16::from_le_bytes([b[0], b[1]]);
                let new = if cluster & 1 == 1 {
                    (old & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                } else {
                    (old & 0xF000) | (value as u16 & 0x0FFF)
                };
                self.write_bytes(copy, off, &new.to_le_bytes())
            }
            FatVariant::Fat16 => self.write_bytes(copy, off, &(value as u16).to_le_bytes()),
            FatVariant::Fat32 => {
                // Preserve the reserved top 4 bits of the existing value.
                let b = self.read_bytes(copy, off, 4)?;
                let old = u32::from_le_bytes(b);
                let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                self.write_bytes(copy, off, &new.to_le_bytes())
            }
        }
    }

    /// Write one cell: the active copy, plus every other copy when FAT32
    /// mirroring is on.
    pub fn set(&mut self, cluster: u32, value: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        self.set_in_copy(self.active, cluster, value)?;
        if self.mirroring {
            for copy in 0..self.num_copies {
                if copy != self.active {
                    self.set_in_copy(copy, cluster, value)?;
                }
            }
        }
        Ok(())
    }

    /// Splice one cell of a backup copy into the active copy (chain-check
    /// fallback path).
    pub fn adopt_from_copy(&mut self, copy: u8, cluster: u32) -> Result<u32> {
        let value = self.get_from_copy(copy, cluster)?;
        self.set(cluster, value)?;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // chains

    /// The cluster following `cluster`, or None at end of chain. A bad or
    /// out-of-range successor also terminates the walk: corruption never
    /// propagates past the offending chain.
    pub fn next(&mut self, cluster: u32) -> Result<Option<u32>> {
        let cell = self.get(cluster)?;
        if self.is_eoc(cell) || self.is_bad(cell) {
            return Ok(None);
        }
        if cell < 2 || cell > self.last_cluster {
            return Ok(None);
        }
        Ok(Some(cell))
    }

    /// All clusters of the chain rooted at `start`, in order. Walks are
    /// bounded by the cluster count, so a cycle cannot hang the engine.
    pub fn collect_chain(&mut self, start: u32) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        if start < 2 || start > self.last_cluster {
            return Ok(chain);
        }
        let mut cur = start;
        for _ in 0..=self.last_cluster {
            chain.push(cur);
            match self.next(cur)? {
                Some(next) => cur = next,
                None => return Ok(chain),
            }
        }
        // Cycle: the chain revisited a cell without reaching EOC.
        Err(FsError::WrongLength)
    }

    pub fn chain_len(&mut self, start: u32) -> Result<u32> {
        Ok(self.collect_chain(start)?.len() as u32)
    }

    /// The terminal (EOC-marked) cluster of a chain, 0 for an empty chain.
    pub fn chain_tail(&mut self, start: u32) -> Result<u32> {
        Ok(self.collect_chain(start)?.last().copied().unwrap_or(0))
    }

    /// The `index`-th cluster of the chain, if the chain is that long.
    pub fn cluster_at(&mut self, start: u32, index: u32) -> Result<Option<u32>> {
        if start < 2 || start > self.last_cluster {
            return Ok(None);
        }
        let mut cur = start;
        for _ in 0..index {
            match self.next(cur)? {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    // ------------------------------------------------------------------
    // allocation

    /// Take `n` free clusters, link them into a chain terminated with EOC,
    /// and splice the chain onto `tail` if one is given. Returns the new
    /// clusters in allocation order.
    ///
    /// FAT32 walks cells forward from the next-free hint (2 when unknown),
    /// wrapping once; FAT12/16 pop from the mount-time free list. If fewer
    /// than `n` clusters are free, everything is returned to the pool and
    /// `NotEnoughSpace` reported.
    pub fn allocate(&mut self, n: usize, tail: Option<u32>) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let picked = match self.variant {
            FatVariant::Fat32 => self.pick_free_fat32(n)?,
            _ => self.pick_free_legacy(n),
        };
        if picked.len() < n {
            // Nothing has been written yet; just hand the candidates back.
            self.restore_candidates(&picked);
            return Err(FsError::NotEnoughSpace);
        }

        let mut linked = 0usize;
        let result = (|| -> Result<()> {
            if let Some(tail) = tail {
                self.set(tail, picked[0])?;
            }
            for i in 0..picked.len() {
                let value = if i + 1 < picked.len() {
                    picked[i + 1]
                } else {
                    self.variant.eoc_mark()
                };
                self.set(picked[i], value)?;
                linked = i + 1;
            }
            Ok(())
        })();

        if let Err(e) = result {
            // Unwind whatever was linked and reterminate the caller's tail.
            for &cluster in picked.iter().take(linked) {
                let _ = self.set(cluster, FREE_CLUSTER);
            }
            if let Some(tail) = tail {
                let _ = self.set(tail, self.variant.eoc_mark());
            }
            self.restore_candidates(&picked);
            return Err(e);
        }

        self.free_count = self.free_count.saturating_sub(n as u32);
        if self.variant == FatVariant::Fat32 {
            self.next_free = picked[picked.len() - 1];
        }
        Ok(picked)
    }

    fn pick_free_legacy(&mut self, n: usize) -> Vec<u32> {
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            match self.free_list.pop_front() {
                Some(c) => picked.push(c),
                None => break,
            }
        }
        picked
    }

    fn pick_free_fat32(&mut self, n: usize) -> Result<Vec<u32>> {
        let start = if self.next_free == FSINFO_UNKNOWN
            || self.next_free < 2
            || self.next_free > self.last_cluster
        {
            2
        } else {
            self.next_free
        };

        let mut picked = Vec::with_capacity(n);
        let span = self.last_cluster - 1; // clusters 2..=last
        let mut cluster = start;
        for _ in 0..span {
            if self.get(cluster)? == FREE_CLUSTER {
                picked.push(cluster);
                if picked.len() == n {
                    break;
                }
            }
            cluster += 1;
            if cluster > self.last_cluster {
                cluster = 2;
            }
        }
        Ok(picked)
    }

    fn restore_candidates(&mut self, picked: &[u32]) {
        if self.variant != FatVariant::Fat32 {
            // Keep the pool sorted so allocation stays low-to-high.
            for &c in picked.iter().rev() {
                self.free_list.push_front(c);
            }
        }
    }

    /// Free an entire chain. Returns the number of cells freed. Cells
    /// carrying the bad mark stay out of circulation.
    pub fn free_chain(&mut self, start: u32) -> Result<u32> {
        let chain = self.collect_chain(start)?;
        let mut freed = 0u32;
        for &cluster in chain.iter() {
            let cell = self.get(cluster)?;
            if self.is_bad(cell) {
                continue;
            }
            self.set(cluster, FREE_CLUSTER)?;
            self.release(cluster);
            freed += 1;
        }
        Ok(freed)
    }

    /// Free everything after `head` and mark `head` the new end of chain.
    pub fn free_chain_keeping_head(&mut self, head: u32) -> Result<u32> {
        self.check_cluster(head)?;
        let next = self.next(head)?;
        self.set(head, self.variant.eoc_mark())?;
        match next {
            Some(next) => self.free_chain(next),
            None => Ok(0),
        }
    }

    fn release(&mut self, cluster: u32) {
        self.free_count += 1;
        if self.variant != FatVariant::Fat32 {
            // Ascending insert keeps allocation order low-to-high.
            let at = self.free_list.partition_point(|&c| c < cluster);
            self.free_list.insert(at, cluster);
        } else if self.next_free == FSINFO_UNKNOWN || cluster < self.next_free {
            self.next_free = cluster;
        }
    }

    /// Take a cluster out of circulation after a failed read or write. The
    /// on-disk hard-error status is cleared with it.
    pub fn mark_bad(&mut self, cluster: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        let was_free = self.get(cluster).map(|c| c == FREE_CLUSTER).unwrap_or(false);
        self.set(cluster, self.variant.bad_mark())?;
        if was_free {
            self.free_count = self.free_count.saturating_sub(1);
            if self.variant != FatVariant::Fat32 {
                if let Some(at) = self.free_list.iter().position(|&c| c == cluster) {
                    self.free_list.remove(at);
                }
            }
        }
        self.io_error_noted = true;
        let _ = self.set_hard_error_ok(false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // reserved cells and status bits

    /// Write the two reserved cells the way FORMAT does: cell 0 carries the
    /// media byte under high ones, cell 1 an EOC mark with both status bits
    /// set (clean, no errors).
    pub fn init_reserved_cells(&mut self) -> Result<()> {
        for copy in 0..self.num_copies {
            self.set_in_copy(copy, 0, self.variant.media_cell(self.media))?;
            self.set_in_copy(copy, 1, self.variant.eoc_mark())?;
        }
        Ok(())
    }

    fn cell1_raw(&mut self) -> Result<u32> {
        let off = self.cell_byte_offset(1);
        match self.variant {
            FatVariant::Fat16 => {
                let b = self.read_bytes(self.active, off, 2)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as u32)
            }
            FatVariant::Fat32 => {
                let b = self.read_bytes(self.active, off, 4)?;
                Ok(u32::from_le_bytes(b))
            }
            FatVariant::Fat12 => Ok(0),
        }
    }

    fn cell1_write_raw(&mut self, value: u32) -> Result<()> {
        let off = self.cell_byte_offset(1);
        let copies: Vec<u8> = if self.mirroring {
            (0..self.num_copies).collect()
        } else {
            vec![self.active]
        };
        for copy in copies {
            match self.variant {
                FatVariant::Fat16 => {
                    self.write_bytes(copy, off, &(value as u16).to_le_bytes())?
                }
                FatVariant::Fat32 => self.write_bytes(copy, off, &value.to_le_bytes())?,
                FatVariant::Fat12 => {}
            }
        }
        Ok(())
    }

    /// FAT12 has no status bits and always reports clean.
    pub fn clean_shutdown(&mut self) -> Result<bool> {
        match self.variant {
            FatVariant::Fat12 => Ok(true),
            FatVariant::Fat16 => Ok(self.cell1_raw()? as u16 & CLN_SHUT_BIT_MASK_FAT16 != 0),
            FatVariant::Fat32 => Ok(self.cell1_raw()? & CLN_SHUT_BIT_MASK_FAT32 != 0),
        }
    }

    pub fn set_clean_shutdown(&mut self, clean: bool) -> Result<()> {
        let (mask, raw) = match self.variant {
            FatVariant::Fat12 => return Ok(()),
            FatVariant::Fat16 => (CLN_SHUT_BIT_MASK_FAT16 as u32, self.cell1_raw()?),
            FatVariant::Fat32 => (CLN_SHUT_BIT_MASK_FAT32, self.cell1_raw()?),
        };
        self.cell1_write_raw(if clean { raw | mask } else { raw & !mask })
    }

    /// True when the bit says "no disk I/O errors were encountered".
    pub fn hard_error_ok(&mut self) -> Result<bool> {
        match self.variant {
            FatVariant::Fat12 => Ok(true),
            FatVariant::Fat16 => Ok(self.cell1_raw()? as u16 & HRD_ERR_BIT_MASK_FAT16 != 0),
            FatVariant::Fat32 => Ok(self.cell1_raw()? & HRD_ERR_BIT_MASK_FAT32 != 0),
        }
    }

    pub fn set_hard_error_ok(&mut self, ok: bool) -> Result<()> {
        let (mask, raw) = match self.variant {
            FatVariant::Fat12 => return Ok(()),
            FatVariant::Fat16 => (HRD_ERR_BIT_MASK_FAT16 as u32, self.cell1_raw()?),
            FatVariant::Fat32 => (HRD_ERR_BIT_MASK_FAT32, self.cell1_raw()?),
        };
        self.cell1_write_raw(if ok { raw | mask } else { raw & !mask })
    }

    // ------------------------------------------------------------------
    // redundancy

    /// Copy the active FAT over every other copy, sector by sector,
    /// skipping sectors that already match. Dismount calls this; mirrored
    /// FAT32 volumes are already in sync but cheap to verify.
    pub fn replicate(&mut self) -> Result<()> {
        if self.num_copies < 2 {
            return Ok(());
        }
        let mut active_buf = vec![0u8; self.bytes_per_sector];
        let mut other_buf = vec![0u8; self.bytes_per_sector];
        for sector in 0..self.fat_size {
            self.device
                .read_sector(self.copy_start(self.active) + sector, &mut active_buf)
                .map_err(|e| {
                    self.io_error_noted = true;
                    e
                })?;
            for copy in 0..self.num_copies {
                if copy == self.active {
                    continue;
                }
                let target = self.copy_start(copy) + sector;
                let matches = self
                    .device
                    .read_sector(target, &mut other_buf)
                    .map(|_| other_buf == active_buf)
                    .unwrap_or(false);
                if !matches {
                    self.device.write_sector(target, &active_buf).map_err(|e| {
                        self.io_error_noted = true;
                        e
                    })?;
                }
            }
        }
        self.buf_sector = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpb::FormatParams;
    use crate::device::RamDevice;

    fn fat12_fixture() -> Fat {
        let params = FormatParams::new(800, FatVariant::Fat12).unwrap();
        let bpb = params.to_bpb(1, *b"TEST       ").unwrap();
        let device = RamDevice::new(800, 512);
        Fat::new(device, &bpb).unwrap()
    }

    #[test]
    fn fat12_cell_spanning_sector_boundary() {
        let mut fat = fat12_fixture();
        // Cell 682 lives at byte offset 1023, so its two bytes straddle
        // the first and second FAT sectors.
        let cluster = 682u32;
        assert_eq!(fat.cell_byte_offset(cluster) % 512, 511);

        fat.set(cluster, 0x0ABC).unwrap();
        assert_eq!(fat.get(cluster).unwrap(), 0x0ABC);

        // The odd neighbour shares its low nibble byte; both survive.
        fat.set(cluster + 1, 0x0DEF).unwrap();
        assert_eq!(fat.get(cluster).unwrap(), 0x0ABC);
        assert_eq!(fat.get(cluster + 1).unwrap(), 0x0DEF);
    }

    #[test]
    fn fat12_odd_even_nibble_packing() {
        let mut fat = fat12_fixture();
        fat.set(2, 0x0123).unwrap();
        fat.set(3, 0x0456).unwrap();
        assert_eq!(fat.get(2).unwrap(), 0x0123);
        assert_eq!(fat.get(3).unwrap(), 0x0456);
    }

    #[test]
    fn allocate_links_and_terminates() {
        let mut fat = fat12_fixture();
        let before = fat.free_count();
        let chain = fat.allocate(3, None).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(fat.free_count(), before - 3);
        assert_eq!(fat.get(chain[0]).unwrap(), chain[1]);
        assert_eq!(fat.get(chain[1]).unwrap(), chain[2]);
        let tail_cell = fat.get(chain[2]).unwrap();
        assert!(fat.is_eoc(tail_cell));

        let more = fat.allocate(2, Some(chain[2])).unwrap();
        assert_eq!(fat.get(chain[2]).unwrap(), more[0]);
        assert_eq!(fat.collect_chain(chain[0]).unwrap().len(), 5);
    }

    #[test]
    fn free_chain_keeping_head_reterminates() {
        let mut fat = fat12_fixture();
        let chain = fat.allocate(4, None).unwrap();
        let freed = fat.free_chain_keeping_head(chain[0]).unwrap();
        assert_eq!(freed, 3);
        let head_cell = fat.get(chain[0]).unwrap();
        assert!(fat.is_eoc(head_cell));
        assert_eq!(fat.get(chain[1]).unwrap(), FREE_CLUSTER);
    }

    #[test]
    fn exhaustion_restores_pool() {
        let mut fat = fat12_fixture();
        let free = fat.free_count() as usize;
        assert_eq!(fat.allocate(free + 1, None), Err(FsError::NotEnoughSpace));
        assert_eq!(fat.free_count() as usize, free);
        // The pool still hands out every cluster it had.
        assert_eq!(fat.allocate(free, None).unwrap().len(), free);
    }
}
