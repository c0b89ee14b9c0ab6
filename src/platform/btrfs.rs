//! Typed wrappers over the btrfs ioctl surface.
//!
//! Every operation is a thin transformation over one ioctl number plus a
//! byte-layout-exact argument structure. Request numbers are spelled out as
//! constants (the `_IO*` encodings are stable kernel ABI); argument structs
//! are `#[repr(C)]` and size-checked in tests so the encoded length in each
//! request stays honest.
//!
//! Newer kernels offer `BTRFS_IOC_FILE_EXTENT_SAME`, which would let callers
//! skip the immutable-attribute protocol entirely. This layer deliberately
//! sticks to the clone ioctl; see dedup::locker for the userspace protocol.

#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::core::errors::{BdhError, Result};
use crate::platform::item::{BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID, RootItemView};

// Request numbers, precomputed from the _IOC encoding on Linux.
const BTRFS_IOC_TREE_SEARCH_V2: u64 = 0xc070_9411; // _IOWR(0x94, 17, search_args_v2)
const BTRFS_IOC_INO_LOOKUP: u64 = 0xd000_9412; // _IOWR(0x94, 18, ino_lookup_args)
const BTRFS_IOC_SUBVOL_GETFLAGS: u64 = 0x8008_9419; // _IOR(0x94, 25, u64)
const BTRFS_IOC_CLONE: u64 = 0x4004_9409; // _IOW(0x94, 9, int)
const BTRFS_IOC_DEFRAG_RANGE: u64 = 0x4030_9410; // _IOW(0x94, 16, defrag_range_args)
const BTRFS_IOC_FS_INFO: u64 = 0x8400_941f; // _IOR(0x94, 31, fs_info_args)

/// Subvolume flag returned by `SUBVOL_GETFLAGS`. Distinct from the
/// same-named root-item flag, which lives at a different bit.
const BTRFS_SUBVOL_RDONLY: u64 = 1 << 1;

/// One kernel batch worth of tree-search results. The buffer is allocated
/// once per search and reused across ioctl round trips.
pub const TREE_SEARCH_BUF_CAP: usize = 16 * 1024;

const SEARCH_HEADER_LEN: usize = 32;
const ITEMS_PER_BATCH: u32 = 4096;

fn ioctl_raw(
    fd: i32,
    op: &'static str,
    path: &Path,
    request: u64,
    arg: *mut libc::c_void,
) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if rc < 0 {
        return Err(BdhError::from_ioctl_errno(
            op,
            path,
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

// ──────────────────── tree search ────────────────────

/// Kernel search key, also the in/out cursor state of a running search.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

#[repr(C)]
struct SearchArgsV2 {
    key: SearchKey,
    buf_size: u64,
    buf: [u8; TREE_SEARCH_BUF_CAP],
}

/// Search bounds: `(tree_id, min key, max key, min transid)`.
///
/// `tree_id == 0` searches the subvolume the ioctl fd belongs to. The `min_*`
/// fields iterate in `(objectid, type, offset)` tuple order, they are not an
/// intersection of per-field ranges; `min_transid` is the only extra filter
/// the kernel applies per item.
#[derive(Clone, Copy, Debug)]
pub struct SearchRange {
    pub tree_id: u64,
    pub min: (u64, u32, u64),
    pub max: (u64, u32, u64),
    pub min_transid: u64,
}

impl SearchRange {
    /// Everything in the given tree newer than `min_transid`, up to and
    /// including items of type `max_type`.
    pub fn changes_since(tree_id: u64, min_transid: u64, max_type: u32) -> Self {
        Self {
            tree_id,
            min: (0, 0, 0),
            max: (u64::MAX, max_type, u64::MAX),
            min_transid,
        }
    }

    /// All items of one type under a single objectid.
    pub fn single_object(tree_id: u64, objectid: u64, item_type: u32) -> Self {
        Self {
            tree_id,
            min: (objectid, item_type, 0),
            max: (objectid, item_type, u64::MAX),
            min_transid: 0,
        }
    }
}

/// Key of one returned item. `transid` is the transaction that wrote the
/// containing leaf, which can run ahead of the item's own change counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemKey {
    pub objectid: u64,
    pub item_type: u32,
    pub offset: u64,
    pub transid: u64,
}

/// Lazy sequence of `(key, item bytes)` pairs.
///
/// Re-issues the ioctl with an advancing cursor until the kernel returns
/// zero items.
pub struct TreeSearch<'v> {
    fd: i32,
    path: &'v Path,
    args: Box<SearchArgsV2>,
    batch_remaining: u32,
    batch_offset: usize,
    last: Option<(u64, u32, u64)>,
    done: bool,
}

impl<'v> TreeSearch<'v> {
    pub fn new(volume: &'v File, path: &'v Path, range: SearchRange) -> Self {
        let key = SearchKey {
            tree_id: range.tree_id,
            min_objectid: range.min.0,
            max_objectid: range.max.0,
            min_offset: range.min.2,
            max_offset: range.max.2,
            min_transid: range.min_transid,
            max_transid: u64::MAX,
            min_type: range.min.1,
            max_type: range.max.1,
            nr_items: 0,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        };
        Self {
            fd: volume.as_raw_fd(),
            path,
            args: Box::new(SearchArgsV2 {
                key,
                buf_size: TREE_SEARCH_BUF_CAP as u64,
                buf: [0; TREE_SEARCH_BUF_CAP],
            }),
            batch_remaining: 0,
            batch_offset: 0,
            last: None,
            done: false,
        }
    }

    fn refill(&mut self) -> Result<u32> {
        if let Some(last) = self.last
            && !advance_cursor(&mut self.args.key, last)
        {
            return Ok(0);
        }
        self.args.key.nr_items = ITEMS_PER_BATCH;
        self.args.buf_size = TREE_SEARCH_BUF_CAP as u64;
        ioctl_raw(
            self.fd,
            "tree-search",
            self.path,
            BTRFS_IOC_TREE_SEARCH_V2,
            std::ptr::from_mut::<SearchArgsV2>(&mut *self.args).cast::<libc::c_void>(),
        )?;
        self.batch_offset = 0;
        Ok(self.args.key.nr_items)
    }
}

impl Iterator for TreeSearch<'_> {
    type Item = Result<(ItemKey, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.batch_remaining == 0 {
            match self.refill() {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => self.batch_remaining = n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        match parse_search_header(&self.args.buf, self.batch_offset) {
            Some((key, data_range)) => {
                let data = self.args.buf[data_range.clone()].to_vec();
                self.batch_offset = data_range.end;
                self.batch_remaining -= 1;
                self.last = Some((key.objectid, key.item_type, key.offset));
                Some(Ok((key, data)))
            }
            None => {
                self.done = true;
                Some(Err(BdhError::Runtime {
                    details: format!(
                        "tree-search returned a malformed batch at offset {}",
                        self.batch_offset
                    ),
                }))
            }
        }
    }
}

/// Decode one `btrfs_ioctl_search_header` plus the extent of its item bytes.
fn parse_search_header(buf: &[u8], offset: usize) -> Option<(ItemKey, std::ops::Range<usize>)> {
    let header = buf.get(offset..offset + SEARCH_HEADER_LEN)?;
    let u64_at = |o: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header[o..o + 8]);
        u64::from_le_bytes(raw)
    };
    let u32_at = |o: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&header[o..o + 4]);
        u32::from_le_bytes(raw)
    };
    let key = ItemKey {
        transid: u64_at(0),
        objectid: u64_at(8),
        offset: u64_at(16),
        item_type: u32_at(24),
    };
    let len = u32_at(28) as usize;
    let start = offset + SEARCH_HEADER_LEN;
    let end = start.checked_add(len)?;
    (end <= buf.len()).then_some((key, start..end))
}

/// Advance the cursor one position past `last` in tuple order.
/// Returns `false` once the key space is exhausted.
fn advance_cursor(key: &mut SearchKey, last: (u64, u32, u64)) -> bool {
    let (objectid, item_type, offset) = last;
    key.min_objectid = objectid;
    key.min_type = item_type;
    key.min_offset = offset;

    if key.min_offset < u64::MAX {
        key.min_offset += 1;
        return true;
    }
    key.min_offset = 0;
    if key.min_type < u32::from(u8::MAX) {
        key.min_type += 1;
        return true;
    }
    key.min_type = 0;
    if key.min_objectid < u64::MAX {
        key.min_objectid += 1;
        return true;
    }
    false
}

// ──────────────────── inode path lookup ────────────────────

const INO_LOOKUP_NAME_MAX: usize = 4080;

#[repr(C)]
struct InoLookupArgs {
    treeid: u64,
    objectid: u64,
    name: [u8; INO_LOOKUP_NAME_MAX],
}

fn ino_lookup(volume: &File, path: &Path, treeid: u64, objectid: u64) -> Result<Box<InoLookupArgs>> {
    let mut args = Box::new(InoLookupArgs {
        treeid,
        objectid,
        name: [0; INO_LOOKUP_NAME_MAX],
    });
    ioctl_raw(
        volume.as_raw_fd(),
        "ino-lookup",
        path,
        BTRFS_IOC_INO_LOOKUP,
        std::ptr::from_mut::<InoLookupArgs>(&mut *args).cast::<libc::c_void>(),
    )?;
    Ok(args)
}

/// Root tree id of the subvolume the fd belongs to.
pub fn subvolume_id(volume: &File, path: &Path) -> Result<u64> {
    let args = ino_lookup(
        volume,
        path,
        0,
        crate::platform::item::BTRFS_FIRST_FREE_OBJECTID,
    )?;
    Ok(args.treeid)
}

/// Path of an inode relative to its subvolume root.
///
/// Only resolves one hardlink; sufficient because cloning any link dedups
/// the shared inode. `ENOENT` surfaces as [`BdhError::Vanished`].
pub fn ino_lookup_path(volume: &File, path: &Path, ino: u64) -> Result<PathBuf> {
    let args = ino_lookup(volume, path, 0, ino)?;
    let len = args.name.iter().position(|&b| b == 0).unwrap_or(0);
    // The kernel appends a trailing separator.
    let raw = args.name[..len].strip_suffix(b"/").unwrap_or(&args.name[..len]);
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(raw)))
}

// ──────────────────── filesystem / subvolume identity ────────────────────

#[repr(C)]
struct FsInfoArgs {
    max_id: u64,
    num_devices: u64,
    fsid: [u8; 16],
    reserved: [u64; 124],
}

/// Filesystem UUID, hyphenated lowercase hex.
pub fn fs_uuid(volume: &File, path: &Path) -> Result<String> {
    let mut args = Box::new(FsInfoArgs {
        max_id: 0,
        num_devices: 0,
        fsid: [0; 16],
        reserved: [0; 124],
    });
    ioctl_raw(
        volume.as_raw_fd(),
        "fs-info",
        path,
        BTRFS_IOC_FS_INFO,
        std::ptr::from_mut::<FsInfoArgs>(&mut *args).cast::<libc::c_void>(),
    )?;
    Ok(format_uuid(&args.fsid))
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Read-only bit via `SUBVOL_GETFLAGS`. The fd must be the subvolume root
/// directory; use [`root_item_readonly`] from arbitrary directories.
pub fn subvol_flags_readonly(volume: &File, path: &Path) -> Result<bool> {
    let mut flags: u64 = 0;
    ioctl_raw(
        volume.as_raw_fd(),
        "subvol-getflags",
        path,
        BTRFS_IOC_SUBVOL_GETFLAGS,
        std::ptr::from_mut::<u64>(&mut flags).cast::<libc::c_void>(),
    )?;
    Ok(flags & BTRFS_SUBVOL_RDONLY != 0)
}

/// Read-only bit from the subvolume's root item, reachable from any fd on
/// the filesystem.
pub fn root_item_readonly(volume: &File, path: &Path, root_id: u64) -> Result<bool> {
    let range = SearchRange::single_object(BTRFS_ROOT_TREE_OBJECTID, root_id, BTRFS_ROOT_ITEM_KEY);
    for item in TreeSearch::new(volume, path, range) {
        let (key, data) = item?;
        if key.item_type != BTRFS_ROOT_ITEM_KEY {
            continue;
        }
        if let Some(view) = RootItemView::new(&data) {
            return Ok(view.is_readonly());
        }
    }
    Err(BdhError::Runtime {
        details: format!("no root item found for subvolume {root_id}"),
    })
}

/// Current generation of a subvolume: the highest generation recorded on its
/// root item. Used as the scan watermark, sampled before the search starts so
/// later changes stay above it.
pub fn root_generation(volume: &File, path: &Path, root_id: u64) -> Result<u64> {
    let range = SearchRange::single_object(BTRFS_ROOT_TREE_OBJECTID, root_id, BTRFS_ROOT_ITEM_KEY);
    let mut max_found: u64 = 0;
    for item in TreeSearch::new(volume, path, range) {
        let (key, data) = item?;
        if key.item_type != BTRFS_ROOT_ITEM_KEY {
            continue;
        }
        if let Some(view) = RootItemView::new(&data) {
            max_found = max_found.max(view.generation());
        }
    }
    if max_found == 0 {
        return Err(BdhError::Runtime {
            details: format!("no generation found for subvolume {root_id}"),
        });
    }
    Ok(max_found)
}

// ──────────────────── clone / defrag / sync ────────────────────

/// Whole-file clone: `dest` becomes a reflink of `src`.
///
/// Both files must have the same length; `dest` must be open for writing.
/// `EXDEV` means the kernel refused to cross a subvolume boundary.
pub fn clone_whole_file(src: &File, dest: &File, dest_path: &Path) -> Result<()> {
    let rc = unsafe {
        libc::ioctl(
            dest.as_raw_fd(),
            BTRFS_IOC_CLONE as libc::c_ulong,
            src.as_raw_fd(),
        )
    };
    if rc < 0 {
        let errno = io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::EXDEV) {
            return Err(BdhError::UnsupportedKernel {
                feature: "cross-subvolume clone",
                details: errno.to_string(),
            });
        }
        return Err(BdhError::from_ioctl_errno("clone", dest_path, errno));
    }
    Ok(())
}

#[repr(C)]
struct DefragRangeArgs {
    start: u64,
    len: u64,
    flags: u64,
    extent_thresh: u32,
    compress_type: u32,
    unused: [u32; 4],
}

/// Defragment the whole file. Callers gate this on [`supports_safe_defrag`];
/// older kernels unshare extents as a side effect, defeating the point.
pub fn defrag_range(file: &File, path: &Path) -> Result<()> {
    let mut args = DefragRangeArgs {
        start: 0,
        len: u64::MAX,
        flags: 0,
        extent_thresh: 0,
        compress_type: 0,
        unused: [0; 4],
    };
    ioctl_raw(
        file.as_raw_fd(),
        "defrag-range",
        path,
        BTRFS_IOC_DEFRAG_RANGE,
        std::ptr::from_mut::<DefragRangeArgs>(&mut args).cast::<libc::c_void>(),
    )
}

/// Flush the filesystem containing `volume` so every delalloc write is
/// serialised under the generation the scan is about to sample.
pub fn syncfs_volume(volume: &File, path: &Path) -> Result<()> {
    let rc = unsafe { libc::syncfs(volume.as_raw_fd()) };
    if rc < 0 {
        return Err(BdhError::io(path, io::Error::last_os_error()));
    }
    Ok(())
}

// ──────────────────── kernel feature gates ────────────────────

/// `(major, minor)` of the running kernel.
pub fn kernel_version() -> Option<(u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split(['.', '-']);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Cross-subvolume cloning works from Linux 3.6.
pub fn supports_cross_subvol_clone() -> bool {
    kernel_version().is_none_or(|v| v >= (3, 6))
}

/// Defragmentation stopped breaking extent sharing in Linux 3.9.
pub fn supports_safe_defrag() -> bool {
    kernel_version().is_none_or(|v| v >= (3, 9))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(size_of::<SearchKey>(), 104);
        assert_eq!(size_of::<SearchArgsV2>(), 104 + 8 + TREE_SEARCH_BUF_CAP);
        assert_eq!(size_of::<InoLookupArgs>(), 4096);
        assert_eq!(size_of::<FsInfoArgs>(), 1024);
        assert_eq!(size_of::<DefragRangeArgs>(), 48);
    }

    #[test]
    fn header_parse_round_trip() {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(&77u64.to_le_bytes()); // transid
        buf[8..16].copy_from_slice(&256u64.to_le_bytes()); // objectid
        buf[16..24].copy_from_slice(&0u64.to_le_bytes()); // offset
        buf[24..28].copy_from_slice(&1u32.to_le_bytes()); // type
        buf[28..32].copy_from_slice(&8u32.to_le_bytes()); // len
        buf[32..40].copy_from_slice(&0xdead_beefu64.to_le_bytes());

        let (key, range) = parse_search_header(&buf, 0).unwrap();
        assert_eq!(key.transid, 77);
        assert_eq!(key.objectid, 256);
        assert_eq!(key.item_type, 1);
        assert_eq!(range, 32..40);
    }

    #[test]
    fn header_parse_rejects_overrun() {
        let mut buf = vec![0u8; SEARCH_HEADER_LEN];
        buf[28..32].copy_from_slice(&1u32.to_le_bytes()); // len extends past buf
        assert!(parse_search_header(&buf, 0).is_none());
        assert!(parse_search_header(&buf, 1).is_none());
    }

    fn range_key() -> SearchKey {
        let range = SearchRange::changes_since(0, 0, u32::from(u8::MAX));
        SearchKey {
            tree_id: range.tree_id,
            min_objectid: range.min.0,
            max_objectid: range.max.0,
            min_offset: range.min.2,
            max_offset: range.max.2,
            min_transid: range.min_transid,
            max_transid: u64::MAX,
            min_type: range.min.1,
            max_type: range.max.1,
            nr_items: 0,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        }
    }

    #[test]
    fn cursor_advances_offset_first() {
        let mut key = range_key();
        assert!(advance_cursor(&mut key, (256, 1, 10)));
        assert_eq!(
            (key.min_objectid, key.min_type, key.min_offset),
            (256, 1, 11)
        );
    }

    #[test]
    fn cursor_carries_into_type_and_objectid() {
        let mut key = range_key();
        assert!(advance_cursor(&mut key, (256, 1, u64::MAX)));
        assert_eq!((key.min_objectid, key.min_type, key.min_offset), (256, 2, 0));

        let mut key = range_key();
        assert!(advance_cursor(&mut key, (256, u32::from(u8::MAX), u64::MAX)));
        assert_eq!((key.min_objectid, key.min_type, key.min_offset), (257, 0, 0));
    }

    #[test]
    fn cursor_exhausts_at_key_space_end() {
        let mut key = range_key();
        assert!(!advance_cursor(
            &mut key,
            (u64::MAX, u32::from(u8::MAX), u64::MAX)
        ));
    }

    #[test]
    fn uuid_formatting() {
        let bytes: [u8; 16] = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        assert_eq!(
            format_uuid(&bytes),
            "12345678-9abc-def0-1122-334455667788"
        );
    }

    #[test]
    fn kernel_release_parsing() {
        assert_eq!(parse_kernel_release("6.8.0-40-generic\n"), Some((6, 8)));
        assert_eq!(parse_kernel_release("3.6.11"), Some((3, 6)));
        assert_eq!(parse_kernel_release("5.15-rc1"), Some((5, 15)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }
}
