//! Incremental change scanner.
//!
//! No directory traversal: the subvolume's b-tree is searched directly with
//! a minimum transaction id, so a scan touches only items written since the
//! last committed watermark. The watermark committed with the results is the
//! filesystem's transaction id sampled *before* the search starts, so any
//! change racing the scan lands at or above it and is revisited next pass.

pub mod find_new;

use crate::core::errors::Result;
use crate::platform::btrfs::{self, ItemKey, SearchRange, TreeSearch};
use crate::platform::item::{BTRFS_INODE_ITEM_KEY, InodeItemView};
use crate::registry::OpenVolume;
use crate::store::{ScannedInode, TrackingStore, VolumeRow};

/// Per-scan counters, reported to the user in verbose mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub items_seen: u64,
    pub absorbed: u64,
    pub below_cutoff: u64,
    pub not_regular: u64,
    pub nocow: u64,
    pub stale: u64,
}

/// Result of one committed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub fs_uuid: String,
    pub root_id: u64,
    pub watermark: u64,
    pub stats: ScanStats,
}

/// Minimum generation to scan from.
///
/// Incremental only holds while the cutoff did not drop: lowering it makes
/// older files newly eligible, which forces a full rescan from zero.
pub fn effective_min_generation(volume: &VolumeRow, cutoff: u64) -> u64 {
    match volume.last_tracked_size_cutoff {
        Some(last) if last <= cutoff => volume.last_tracked_generation,
        _ => 0,
    }
}

/// Filter raw tree items down to trackable inode records.
///
/// Keeps regular files of at least `cutoff` bytes (and never empty ones)
/// whose last-change transaction id is past `min_generation`, excluding
/// files with copy-on-write or checksumming disabled.
pub fn absorb_inode_items<I>(
    items: I,
    cutoff: u64,
    min_generation: u64,
) -> Result<(Vec<ScannedInode>, ScanStats)>
where
    I: IntoIterator<Item = Result<(ItemKey, Vec<u8>)>>,
{
    let mut records = Vec::new();
    let mut stats = ScanStats::default();

    for item in items {
        let (key, data) = item?;
        stats.items_seen += 1;
        if key.item_type != BTRFS_INODE_ITEM_KEY {
            continue;
        }
        let Some(view) = InodeItemView::new(&data) else {
            continue;
        };

        if !view.is_regular_file() {
            stats.not_regular += 1;
            continue;
        }
        // The leaf may have been rewritten (balance, relocation) without the
        // inode itself changing; the item's own counter is authoritative.
        if view.transid() <= min_generation {
            stats.stale += 1;
            continue;
        }
        let size = view.size();
        if size == 0 || size < cutoff {
            stats.below_cutoff += 1;
            continue;
        }
        if view.is_nocow() {
            stats.nocow += 1;
            continue;
        }

        let (mtime_sec, mtime_nsec) = view.mtime();
        records.push(ScannedInode {
            ino: key.objectid,
            size,
            generation: view.transid(),
            mtime_sec,
            mtime_nsec,
        });
        stats.absorbed += 1;
    }

    Ok((records, stats))
}

/// Run one scan over `volume` and commit `(records, watermark)` atomically.
pub fn scan_volume(
    volume: &OpenVolume,
    row: &VolumeRow,
    store: &mut TrackingStore,
) -> Result<ScanReport> {
    let cutoff = row.size_cutoff;

    // Flush so every delalloc write is serialised under the watermark we are
    // about to sample.
    btrfs::syncfs_volume(&volume.dir, &volume.path)?;
    let watermark = btrfs::root_generation(&volume.dir, &volume.path, volume.root_id)?;

    let min_generation = effective_min_generation(row, cutoff);
    let range = SearchRange::changes_since(0, min_generation + 1, BTRFS_INODE_ITEM_KEY);
    let search = TreeSearch::new(&volume.dir, &volume.path, range);

    let (records, stats) = absorb_inode_items(search, cutoff, min_generation)?;
    store.commit_scan(row.id, &records, watermark, cutoff)?;

    Ok(ScanReport {
        fs_uuid: volume.fs_uuid.clone(),
        root_id: volume.root_id,
        watermark,
        stats,
    })
}
