//! Mount-time consistency recovery.
//!
//! FAT cell 1 carries two status bits (FAT16/FAT32). When the hard-error
//! bit is clear the previous session hit disk I/O errors and the *surface
//! check* runs: every metadata sector and every data cluster is read once,
//! and whatever does not come back is marked bad in the FAT. When only the
//! clean-shutdown bit is clear the previous session ended without a
//! dismount and the *chain check* runs: every directory entry's chain is
//! traced through the active FAT copy against a scratch visited map, and
//! the four repair rules below reconcile what a torn operation left
//! behind.
//!
//! Repair rules, in order of preference:
//! (a) two chains collide -> the offending chain is re-read from a backup
//!     FAT copy and, when the backup view is collision free, spliced into
//!     the active copy;
//! (b) a recorded file length exceeds what the chain can hold -> same
//!     backup fallback, else the recorded length is clipped to the chain;
//! (c) length > 0 with cluster = 0 -> the length is zeroed;
//! (d) cluster != 0 with length = 0 -> the cluster field is zeroed.
//!
//! Repairs keep going on a best-effort basis: unrepaired corruption costs
//! truncated lengths, never damage beyond the offending chain.

use crate::dir::{DirEntry, Directory, FILTER_DIR, FILTER_FILE};
use crate::fs::FileSystem;
use crate::{FsError, Result};

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// Read every sector up to the first data sector and every data cluster;
/// mark unreadable clusters bad.
pub(crate) fn surface_check(fs: &Arc<FileSystem>) -> Result<()> {
    let bpb = fs.bpb();
    log::info!("surface check: {} sectors", bpb.total_sectors());
    let mut buf = vec![0u8; bpb.bytes_per_sector as usize];

    for sector in 0..bpb.first_data_sector() as u64 {
        if fs.device().read_sector(sector, &mut buf).is_err() {
            // Metadata has no governing cluster; the failure is only noted.
            log::warn!("surface check: metadata sector {} unreadable", sector);
            fs.fat().write().note_io_error();
        }
    }

    let mut bad = 0u32;
    for cluster in 2..=bpb.last_cluster() {
        let first = bpb.first_sector_of_cluster(cluster) as u64;
        for s in 0..bpb.sectors_per_cluster as u64 {
            if fs.device().read_sector(first + s, &mut buf).is_err() {
                let _ = fs.fat().write().mark_bad(cluster);
                bad += 1;
                break;
            }
        }
        if cluster % 8192 == 0 {
            log::debug!(
                "surface check: {} / {} clusters",
                cluster,
                bpb.last_cluster()
            );
        }
    }
    log::info!("surface check complete, {} bad clusters", bad);
    Ok(())
}

/// Walk every directory entry, tracing each chain through the active FAT
/// copy into a scratch visited map, repairing per the module rules.
pub(crate) fn chain_check(fs: &Arc<FileSystem>) -> Result<()> {
    log::info!("chain check: volume was not dismounted cleanly");
    let last = fs.bpb().last_cluster();
    let mut visited = vec![false; last as usize + 1];

    // The FAT32 root chain owns its cells before any entry is considered.
    if fs.bpb().root_entry_count == 0 {
        let (chain, _) = trace(fs, None, fs.bpb().root_cluster(), &visited);
        for &c in chain.iter() {
            visited[c as usize] = true;
        }
    }

    let mut pending: Vec<Directory> = vec![fs.root_dir()];
    let mut repaired = 0u32;
    while let Some(dir) = pending.pop() {
        // Collect first: repairs rewrite entries under the iterator.
        let entries: Vec<DirEntry> = dir
            .iter_filtered(FILTER_FILE | FILTER_DIR)
            .collect::<Result<_>>()?;
        for entry in entries {
            let (chain, fixed) = check_entry(fs, &mut visited, &entry)?;
            if fixed {
                repaired += 1;
            }
            // Recurse only into chains this entry actually owns now; a
            // cross-link into an ancestor was cut above, which also keeps
            // directory cycles from looping the walk.
            if entry.is_dir() && !chain.is_empty() {
                pending.push(dir.sub_dir(&entry)?);
            }
        }
    }
    log::info!("chain check complete, {} entries repaired", repaired);
    Ok(())
}

/// Returns the chain the entry owns after repair, and whether a repair was
/// needed.
fn check_entry(
    fs: &Arc<FileSystem>,
    visited: &mut [bool],
    entry: &DirEntry,
) -> Result<(Vec<u32>, bool)> {
    let start = entry.first_cluster();
    let length = entry.short.file_size;
    let is_dir = entry.is_dir();

    if !is_dir {
        // Rules (c) and (d): an interrupted create left the entry half
        // initialized.
        if length > 0 && start == 0 {
            log::warn!("chain check: '{}' has length but no chain, zeroing length", entry.name);
            fs.update_short_entry(entry.pos, |sde| sde.file_size = 0)?;
            return Ok((Vec::new(), true));
        }
        if start != 0 && length == 0 {
            log::warn!("chain check: '{}' has chain but no length, zeroing cluster", entry.name);
            fs.update_short_entry(entry.pos, |sde| sde.set_first_cluster(0))?;
            return Ok((Vec::new(), true));
        }
    }
    if start == 0 {
        return Ok((Vec::new(), false));
    }

    let (mut chain, mut collided) = trace(fs, None, start, visited);
    let mut repaired = false;

    // Rule (a): collision -> prefer the backup copy's view of this chain.
    if collided {
        if let Some(backup) = backup_chain(fs, start, visited) {
            log::warn!(
                "chain check: '{}' cross-linked, adopting backup FAT view",
                entry.name
            );
            splice(fs, &backup)?;
            chain = backup;
            collided = false;
        } else if chain.is_empty() {
            // Even the start cell belongs to someone else; the entry
            // loses its chain.
            log::warn!(
                "chain check: '{}' starts inside another chain, detaching it",
                entry.name
            );
            fs.update_short_entry(entry.pos, |sde| {
                sde.set_first_cluster(0);
                sde.file_size = 0;
            })?;
            return Ok((Vec::new(), true));
        } else {
            log::warn!(
                "chain check: '{}' cross-linked, truncating at the collision",
                entry.name
            );
            truncate_chain(fs, &chain)?;
        }
        repaired = true;
    }

    // Rule (b): recorded length beyond the chain's capacity.
    if !is_dir {
        let cluster_size = fs.bpb().cluster_size() as u64;
        let capacity = chain.len() as u64 * cluster_size;
        if length as u64 > capacity {
            let adopted = if !collided {
                match backup_chain(fs, start, visited) {
                    Some(backup) if backup.len() > chain.len() => {
                        splice(fs, &backup)?;
                        chain = backup;
                        true
                    }
                    _ => false,
                }
            } else {
                false
            };
            let capacity = chain.len() as u64 * cluster_size;
            if !adopted || (length as u64) > capacity {
                let clipped = capacity.min(length as u64) as u32;
                log::warn!(
                    "chain check: '{}' length {} exceeds chain, clipping to {}",
                    entry.name,
                    length,
                    clipped
                );
                fs.update_short_entry(entry.pos, |sde| sde.file_size = clipped)?;
            }
            repaired = true;
        }
    }

    for &c in chain.iter() {
        visited[c as usize] = true;
    }
    Ok((chain, repaired))
}

/// Trace a chain through one FAT copy (active when `copy` is None),
/// stopping at EOC, bad cells, out-of-range links, revisits of the scratch
/// map, or internal cycles. Returns the cells reached plus whether the
/// walk ended in a collision.
fn trace(fs: &Arc<FileSystem>, copy: Option<u8>, start: u32, visited: &[bool]) -> (Vec<u32>, bool) {
    let last = fs.bpb().last_cluster();
    let mut chain = Vec::new();
    if start < 2 || start > last {
        return (chain, false);
    }
    let mut fat = fs.fat().write();
    let mut cur = start;
    loop {
        if visited[cur as usize] || chain.contains(&cur) {
            return (chain, true);
        }
        chain.push(cur);
        let cell = match copy {
            Some(copy) => fat.get_from_copy(copy, cur),
            None => fat.get(cur),
        };
        let cell = match cell {
            Ok(cell) => cell,
            Err(_) => return (chain, false),
        };
        if fat.is_eoc(cell) || fat.is_bad(cell) || cell < 2 || cell > last {
            return (chain, false);
        }
        cur = cell;
    }
}

/// A collision-free view of the chain from the first backup copy, when one
/// exists and actually avoids the collision.
fn backup_chain(fs: &Arc<FileSystem>, start: u32, visited: &[bool]) -> Option<Vec<u32>> {
    let copies = fs.fat().read().num_copies();
    if copies < 2 {
        return None;
    }
    // The active copy is 0 on every volume this engine formats; copy 1 is
    // the first backup.
    let (chain, collided) = trace(fs, Some(1), start, visited);
    if collided || chain.is_empty() {
        None
    } else {
        Some(chain)
    }
}

/// Write a chain's links into the active copy (and its mirrors).
fn splice(fs: &Arc<FileSystem>, chain: &[u32]) -> Result<()> {
    let mut fat = fs.fat().write();
    let eoc = fat.variant().eoc_mark();
    for i in 0..chain.len() {
        let next = chain.get(i + 1).copied().unwrap_or(eoc);
        fat.set(chain[i], next)?;
    }
    Ok(())
}

/// Reterminate a chain at its last safely-owned cell.
fn truncate_chain(fs: &Arc<FileSystem>, chain: &[u32]) -> Result<()> {
    if let Some(&tail) = chain.last() {
        let mut fat = fs.fat().write();
        let eoc = fat.variant().eoc_mark();
        fat.set(tail, eoc)?;
    } else {
        return Err(FsError::DirectoryOperationFailure);
    }
    Ok(())
}
