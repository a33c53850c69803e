//! The volume: a block device bound to a BPB + FAT + root directory.
//!
//! `mount` parses the BPB, builds the free-cluster pool, runs the recovery
//! passes the dirty/hard-error bits call for, and clears the clean-shutdown
//! bit so a power loss before the next dismount is caught. `format` lays a
//! fresh filesystem onto the device. `dismount` commits every open file,
//! replicates the active FAT over the other copies, persists the FSInfo
//! hints, sets the clean-shutdown bit and releases the device.

use crate::bpb::{BiosParameterBlock, FatVariant, FormatParams, FsInfo};
use crate::check;
use crate::clock::{Clock, DateTime};
use crate::device::BlockDevice;
use crate::dir::{Directory, DirEntry, SlotPos};
use crate::entry::ShortDirEntry;
use crate::fat::Fat;
use crate::file::{Mode, OpenRecord, SharedRecord};
use crate::{FsError, Result, ATTR_VOLUME_ID, DIRENT_SIZE, SHORT_NAME_LEN_CAP, SPACE};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, RwLock};

pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    bpb: BiosParameterBlock,
    fat: RwLock<Fat>,
    clock: Arc<dyn Clock>,
    open_files: Mutex<BTreeMap<(u64, usize), SharedRecord>>,
    /// Set at dismount; every later operation fails with `IoError`.
    sealed: AtomicBool,
}

impl FileSystem {
    /// Mount an existing volume.
    ///
    /// Reads the BPB, binds the FAT (building the FAT12/16 free pool),
    /// runs the surface or chain check when the status bits in FAT cell 1
    /// require it, and unconditionally clears the clean-shutdown bit.
    pub fn mount(device: Arc<dyn BlockDevice>, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let mut sector0 = vec![0u8; device.sector_size()];
        device
            .read_sector(0, &mut sector0)
            .map_err(|_| FsError::InitializationFailure)?;
        let bpb = BiosParameterBlock::parse(&sector0)?;

        if bpb.bytes_per_sector as usize != device.sector_size() {
            return Err(FsError::InitializationFailure);
        }
        if bpb.total_sectors() as u64 > device.num_sectors() {
            return Err(FsError::WrongLength);
        }

        let fat = Fat::new(Arc::clone(&device), &bpb)?;
        let fs = Arc::new(Self {
            device,
            bpb,
            fat: RwLock::new(fat),
            clock,
            open_files: Mutex::new(BTreeMap::new()),
            sealed: AtomicBool::new(false),
        });

        let (clean, hardware_ok) = {
            let mut fat = fs.fat.write();
            (fat.clean_shutdown()?, fat.hard_error_ok()?)
        };
        if !hardware_ok {
            check::surface_check(&fs)?;
            // The surviving sectors are accounted for; stop re-checking on
            // every mount.
            fs.fat.write().set_hard_error_ok(true)?;
        } else if !clean {
            check::chain_check(&fs)?;
        }

        fs.fat.write().set_clean_shutdown(false)?;
        Ok(fs)
    }

    /// Lay a fresh filesystem of the chosen variant onto the device, then
    /// leave it ready to mount. The whole data region is zeroed; sectors
    /// that fail to write get their cluster marked bad.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        variant: FatVariant,
        volume_label: &[u8; SHORT_NAME_LEN_CAP],
        clock: Arc<dyn Clock>,
    ) -> Result<()> {
        if device.sector_size() != 512 {
            return Err(FsError::InvalidValue);
        }
        let params = FormatParams::new(device.num_sectors(), variant)?;
        let now = clock.now();
        let volume_id = ((now.fat_date().unwrap_or(0) as u32) << 16)
            | now.fat_time().unwrap_or(0) as u32;
        let bpb = params.to_bpb(volume_id, *volume_label)?;

        log::info!(
            "formatting {:?}: {} sectors, {} sectors/cluster, fat size {}",
            variant,
            params.total_sectors,
            params.sectors_per_cluster,
            params.fat_size
        );

        let image = bpb.encode();
        device.write_sector(0, &image)?;
        if let Some(backup) = bpb.backup_boot_sector() {
            device.write_sector(backup as u64, &image)?;
        }

        // Zero the whole FAT region before planting the reserved cells.
        let zero = vec![0u8; 512];
        let fat_sectors = bpb.num_fats as u64 * bpb.fat_size() as u64;
        for sector in 0..fat_sectors {
            device.write_sector(bpb.reserved_sectors as u64 + sector, &zero)?;
        }

        // FSInfo (and its backup) before the FAT binds to it: everything
        // is free except the root directory cluster.
        if let Some(fsinfo_sector) = bpb.fsinfo_sector() {
            let fsi = FsInfo {
                free_count: bpb.count_of_clusters() - 1,
                next_free: 3,
            };
            let fsi_image = fsi.encode();
            device.write_sector(fsinfo_sector as u64, &fsi_image)?;
            if let Some(backup) = bpb.backup_boot_sector() {
                device.write_sector((backup + fsinfo_sector) as u64, &fsi_image)?;
            }
        }

        let mut fat = Fat::new(Arc::clone(&device), &bpb)?;
        fat.init_reserved_cells()?;
        if variant == FatVariant::Fat32 {
            // The root directory chain is one cluster, terminated.
            fat.set(bpb.root_cluster(), variant.eoc_mark())?;
        }

        // Zero the fixed root region (FAT32's root cluster is zeroed with
        // the data region below).
        for sector in 0..bpb.root_dir_sectors() as u64 {
            device.write_sector(bpb.first_root_dir_sector() as u64 + sector, &zero)?;
        }

        // Zero every data cluster; a failing write takes its cluster out
        // of circulation rather than failing the format.
        let spc = bpb.sectors_per_cluster as u32;
        for cluster in 2..=bpb.last_cluster() {
            let first = bpb.first_sector_of_cluster(cluster) as u64;
            for s in 0..spc as u64 {
                if device.write_sector(first + s, &zero).is_err() {
                    log::warn!("format: cluster {} failed to write, marking bad", cluster);
                    fat.mark_bad(cluster)?;
                    break;
                }
            }
            if cluster % 8192 == 0 {
                log::debug!("format: zeroed {} / {} clusters", cluster, bpb.last_cluster());
            }
        }

        // The root entry: a volume-label slot in the first root sector.
        if volume_label != &[SPACE; SHORT_NAME_LEN_CAP] {
            let label = ShortDirEntry::new(volume_label, ATTR_VOLUME_ID, 0, 0, now)?;
            let root_sector = if variant == FatVariant::Fat32 {
                bpb.first_sector_of_cluster(bpb.root_cluster()) as u64
            } else {
                bpb.first_root_dir_sector() as u64
            };
            let mut buf = vec![0u8; 512];
            device.read_sector(root_sector, &mut buf)?;
            buf[0..DIRENT_SIZE].copy_from_slice(&label.to_bytes());
            device.write_sector(root_sector, &buf)?;
        }

        // Persist the final hints; the FAT's view is authoritative after
        // bad-marking.
        if let Some(fsinfo_sector) = bpb.fsinfo_sector() {
            let fsi_image = fat.fsinfo().encode();
            device.write_sector(fsinfo_sector as u64, &fsi_image)?;
            if let Some(backup) = bpb.backup_boot_sector() {
                device.write_sector((backup + fsinfo_sector) as u64, &fsi_image)?;
            }
        }

        log::info!("format complete: {} clusters", bpb.count_of_clusters());
        Ok(())
    }

    /// Close all open files, replicate the active FAT to every other copy,
    /// persist FSInfo and its backup, set the clean-shutdown bit and
    /// release the device.
    pub fn dismount(&self) -> Result<()> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(FsError::IoError);
        }

        // Commit whatever the open files buffered; handles left around
        // become dead (sealed).
        let records: Vec<SharedRecord> = {
            let mut map = self.open_files.lock();
            let records = map.values().cloned().collect();
            map.clear();
            records
        };
        let mut first_err = None;
        for record in records {
            let needs_commit = {
                let r = record.read();
                r.meta_dirty || r.length != r.disk_length
            };
            if needs_commit {
                if let Err(e) = self.commit_record_sealed(&record) {
                    first_err.get_or_insert(e);
                }
            }
        }

        {
            let mut fat = self.fat.write();
            fat.replicate()?;

            if let Some(fsinfo_sector) = self.bpb.fsinfo_sector() {
                let image = fat.fsinfo().encode();
                self.device.write_sector(fsinfo_sector as u64, &image)?;
                if let Some(backup) = self.bpb.backup_boot_sector() {
                    self.device
                        .write_sector((backup + fsinfo_sector) as u64, &image)?;
                }
            }

            // Only a session with no I/O failures may claim a clean
            // shutdown.
            if !fat.io_error_noted() && fat.hard_error_ok()? {
                fat.set_clean_shutdown(true)?;
            }
        }

        self.device.close();
        first_err.map_or(Ok(()), Err)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn variant(&self) -> FatVariant {
        self.bpb.variant()
    }

    pub fn now(&self) -> DateTime {
        self.clock.now()
    }

    pub fn free_clusters(&self) -> u32 {
        self.fat.read().free_count()
    }

    pub(crate) fn fat(&self) -> &RwLock<Fat> {
        &self.fat
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// The root directory of this volume.
    pub fn root_dir(self: &Arc<Self>) -> Directory {
        Directory::new(Arc::clone(self), self.bpb.root_cluster(), true)
    }

    // ------------------------------------------------------------------
    // sector I/O with local error recovery

    /// Translate a failing data sector into a bad cluster mark plus the
    /// hard-error status; metadata-region failures only clear the status.
    fn note_bad_sector(&self, sector: u64) {
        let first_data = self.bpb.first_data_sector() as u64;
        let mut fat = self.fat.write();
        if sector >= first_data {
            let cluster = 2 + ((sector - first_data) / self.bpb.sectors_per_cluster as u64) as u32;
            log::warn!("I/O failure on sector {}, marking cluster {} bad", sector, cluster);
            let _ = fat.mark_bad(cluster);
        } else {
            log::warn!("I/O failure on metadata sector {}", sector);
            fat.note_io_error();
            let _ = fat.set_hard_error_ok(false);
        }
    }

    pub(crate) fn read_sector_into(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if self.is_sealed() {
            return Err(FsError::IoError);
        }
        self.device.read_sector(sector, buf).map_err(|_| {
            self.note_bad_sector(sector);
            FsError::IoError
        })
    }

    pub(crate) fn write_sector_from(&self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.is_sealed() {
            return Err(FsError::IoError);
        }
        self.device.write_sector(sector, buf).map_err(|_| {
            self.note_bad_sector(sector);
            FsError::IoError
        })
    }

    // ------------------------------------------------------------------
    // cluster bookkeeping (all FAT access routes through here so the lock
    // is held only for the table operation itself)

    /// Allocate `n` clusters (spliced onto `tail` when given) and zero
    /// their data sectors before anything can reference them.
    pub(crate) fn alloc_clusters(&self, n: usize, tail: Option<u32>) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let chain = self.fat.write().allocate(n, tail)?;
        for &cluster in chain.iter() {
            self.zero_cluster(cluster)?;
        }
        Ok(chain)
    }

    pub(crate) fn zero_cluster(&self, cluster: u32) -> Result<()> {
        let zero = vec![0u8; self.bpb.bytes_per_sector as usize];
        let first = self.bpb.first_sector_of_cluster(cluster) as u64;
        for s in 0..self.bpb.sectors_per_cluster as u64 {
            self.write_sector_from(first + s, &zero)?;
        }
        Ok(())
    }

    pub(crate) fn free_chain(&self, start: u32) -> Result<u32> {
        self.fat.write().free_chain(start)
    }

    pub(crate) fn free_chain_keeping_head(&self, head: u32) -> Result<u32> {
        self.fat.write().free_chain_keeping_head(head)
    }

    pub(crate) fn chain_next(&self, cluster: u32) -> Result<Option<u32>> {
        self.fat.write().next(cluster)
    }

    pub(crate) fn chain_tail(&self, start: u32) -> Result<u32> {
        self.fat.write().chain_tail(start)
    }

    pub(crate) fn cluster_at(&self, start: u32, index: u32) -> Result<Option<u32>> {
        self.fat.write().cluster_at(start, index)
    }

    // ------------------------------------------------------------------
    // the open-file registry

    /// Attach to (or create) the shared record for a directory entry.
    /// Escalating an existing read-only record to read-write is refused.
    pub(crate) fn attach_record(
        &self,
        key: (u64, usize),
        entry: &DirEntry,
        mode: Mode,
        write_through: bool,
    ) -> Result<SharedRecord> {
        if self.is_sealed() {
            return Err(FsError::IoError);
        }
        let mut map = self.open_files.lock();
        if let Some(record) = map.get(&key) {
            let mut r = record.write();
            if mode == Mode::ReadWrite && r.mode == Mode::Read {
                return Err(FsError::IoError);
            }
            r.refs += 1;
            if write_through {
                r.write_through = true;
            }
            return Ok(Arc::clone(record));
        }
        let record = Arc::new(RwLock::new(OpenRecord {
            refs: 1,
            mode,
            write_through,
            entry_pos: entry.pos,
            start_cluster: entry.short.first_cluster(),
            length: entry.short.file_size,
            disk_length: entry.short.file_size,
            meta_dirty: false,
        }));
        map.insert(key, Arc::clone(&record));
        Ok(record)
    }

    /// One handle closed: commit pending metadata, drop the record when
    /// the last holder leaves.
    pub(crate) fn detach_record(&self, key: (u64, usize), record: &SharedRecord) -> Result<()> {
        let needs_commit = {
            let r = record.read();
            r.meta_dirty || r.length != r.disk_length
        };
        let commit_result = if needs_commit && !self.is_sealed() {
            self.commit_record(record)
        } else {
            Ok(())
        };

        let mut map = self.open_files.lock();
        let gone = {
            let mut r = record.write();
            r.refs = r.refs.saturating_sub(1);
            r.refs == 0
        };
        if gone {
            map.remove(&key);
        }
        commit_result
    }

    /// Persist length, start cluster and write timestamps into the 32-byte
    /// entry backing a record.
    pub(crate) fn commit_record(&self, record: &SharedRecord) -> Result<()> {
        if self.is_sealed() {
            return Err(FsError::IoError);
        }
        self.commit_record_sealed(record)
    }

    fn commit_record_sealed(&self, record: &SharedRecord) -> Result<()> {
        let now = self.clock.now();
        let time = now.fat_time()?;
        let date = now.fat_date()?;
        let (pos, length, start) = {
            let r = record.read();
            (r.entry_pos, r.length, r.start_cluster)
        };
        self.update_short_entry_raw(pos, |sde| {
            sde.file_size = length;
            sde.set_first_cluster(start);
            sde.wrt_time = time;
            sde.wrt_date = date;
            sde.lst_acc_date = date;
        })?;
        let mut r = record.write();
        r.disk_length = length;
        r.meta_dirty = false;
        Ok(())
    }

    /// Read-modify-write one short entry in place.
    pub(crate) fn update_short_entry(
        &self,
        pos: SlotPos,
        f: impl FnOnce(&mut ShortDirEntry),
    ) -> Result<()> {
        if self.is_sealed() {
            return Err(FsError::IoError);
        }
        self.update_short_entry_raw(pos, f)
    }

    fn update_short_entry_raw(
        &self,
        pos: SlotPos,
        f: impl FnOnce(&mut ShortDirEntry),
    ) -> Result<()> {
        let mut buf = vec![0u8; self.bpb.bytes_per_sector as usize];
        self.device.read_sector(pos.sector, &mut buf).map_err(|_| {
            self.note_bad_sector(pos.sector);
            FsError::IoError
        })?;
        let mut sde = ShortDirEntry::from_bytes(&buf[pos.offset..pos.offset + DIRENT_SIZE]);
        f(&mut sde);
        buf[pos.offset..pos.offset + DIRENT_SIZE].copy_from_slice(&sde.to_bytes());
        self.device.write_sector(pos.sector, &buf).map_err(|_| {
            self.note_bad_sector(pos.sector);
            FsError::IoError
        })
    }

    // ------------------------------------------------------------------
    // diagnostic raw accessors

    /// Raw boot sector, for diagnostic tooling only.
    pub fn raw_boot_sector(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.bpb.bytes_per_sector as usize];
        self.read_sector_into(0, &mut buf)?;
        Ok(buf)
    }

    /// Raw image of one FAT copy.
    pub fn raw_fat_copy(&self, copy: u8) -> Result<Vec<u8>> {
        if copy >= self.bpb.num_fats {
            return Err(FsError::InvalidValue);
        }
        let bps = self.bpb.bytes_per_sector as usize;
        let start = self.bpb.reserved_sectors as u64 + copy as u64 * self.bpb.fat_size() as u64;
        let mut out = Vec::with_capacity(self.bpb.fat_size() as usize * bps);
        let mut buf = vec![0u8; bps];
        for s in 0..self.bpb.fat_size() as u64 {
            self.read_sector_into(start + s, &mut buf)?;
            out.extend_from_slice(&buf);
        }
        Ok(out)
    }

    /// Raw FSInfo sector; `NotFsiSector` on FAT12/16 volumes.
    pub fn raw_fsinfo(&self) -> Result<Vec<u8>> {
        let sector = self.bpb.fsinfo_sector().ok_or(FsError::NotFsiSector)? as u64;
        let mut buf = vec![0u8; self.bpb.bytes_per_sector as usize];
        self.read_sector_into(sector, &mut buf)?;
        FsInfo::parse(&buf)?;
        Ok(buf)
    }

    /// Raw bytes of the root directory region (fixed run, or the root
    /// cluster chain on FAT32).
    pub fn raw_root_dir(self: &Arc<Self>) -> Result<Vec<u8>> {
        let bps = self.bpb.bytes_per_sector as usize;
        let mut out = Vec::new();
        let mut buf = vec![0u8; bps];
        if self.bpb.root_entry_count != 0 {
            let first = self.bpb.first_root_dir_sector() as u64;
            for s in 0..self.bpb.root_dir_sectors() as u64 {
                self.read_sector_into(first + s, &mut buf)?;
                out.extend_from_slice(&buf);
            }
        } else {
            let chain = self.fat.write().collect_chain(self.bpb.root_cluster())?;
            for cluster in chain {
                let first = self.bpb.first_sector_of_cluster(cluster) as u64;
                for s in 0..self.bpb.sectors_per_cluster as u64 {
                    self.read_sector_into(first + s, &mut buf)?;
                    out.extend_from_slice(&buf);
                }
            }
        }
        Ok(out)
    }
}
