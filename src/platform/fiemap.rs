//! Extent maps via `FS_IOC_FIEMAP`.
//!
//! Used as a clone short-circuit: two files whose extent maps already
//! coincide share all their storage, so issuing the clone ioctl would only
//! churn metadata.

#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::core::errors::{BdhError, Result};

const FS_IOC_FIEMAP: u64 = 0xc020_660b; // _IOWR('f', 11, struct fiemap)

const FIEMAP_FLAG_SYNC: u32 = 0x0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0001;

const EXTENT_BATCH: usize = 128;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapArgs {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; EXTENT_BATCH],
}

/// One mapped extent; physical position is what extent sharing is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

/// Full extent map of an open file, in logical order.
pub fn extent_map(file: &File, path: &Path) -> Result<Vec<Extent>> {
    let mut extents = Vec::new();
    let mut start: u64 = 0;
    let zero_extent = FiemapExtent {
        fe_logical: 0,
        fe_physical: 0,
        fe_length: 0,
        fe_reserved64: [0; 2],
        fe_flags: 0,
        fe_reserved: [0; 3],
    };

    loop {
        let mut args = Box::new(FiemapArgs {
            fm_start: start,
            fm_length: u64::MAX - start,
            fm_flags: FIEMAP_FLAG_SYNC,
            fm_mapped_extents: 0,
            fm_extent_count: EXTENT_BATCH as u32,
            fm_reserved: 0,
            fm_extents: [zero_extent; EXTENT_BATCH],
        });
        let rc = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                FS_IOC_FIEMAP as libc::c_ulong,
                std::ptr::from_mut::<FiemapArgs>(&mut *args).cast::<libc::c_void>(),
            )
        };
        if rc < 0 {
            return Err(BdhError::from_ioctl_errno(
                "fiemap",
                path,
                io::Error::last_os_error(),
            ));
        }

        let mapped = args.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }
        let mut saw_last = false;
        for fe in &args.fm_extents[..mapped.min(EXTENT_BATCH)] {
            extents.push(Extent {
                logical: fe.fe_logical,
                physical: fe.fe_physical,
                length: fe.fe_length,
            });
            start = fe.fe_logical + fe.fe_length;
            saw_last = fe.fe_flags & FIEMAP_EXTENT_LAST != 0;
        }
        if saw_last {
            break;
        }
    }
    Ok(extents)
}

/// Whether two files already share every extent.
pub fn same_extents(a: &File, a_path: &Path, b: &File, b_path: &Path) -> Result<bool> {
    Ok(extent_map(a, a_path)? == extent_map(b, b_path)?)
}
