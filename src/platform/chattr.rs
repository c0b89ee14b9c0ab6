//! Per-file inode attribute flags (`FS_IOC_GETFLAGS`/`SETFLAGS`).
//!
//! The immutable bit is the one this tool cares about: once set, nobody
//! (root included) can open the file for writing until it is cleared, which
//! is what makes the clone ioctl safe to use from userspace.

#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::core::errors::{BdhError, Result};

const FS_IOC_GETFLAGS: u64 = 0x8008_6601; // _IOR('f', 1, long)
const FS_IOC_SETFLAGS: u64 = 0x4008_6602; // _IOW('f', 2, long)

/// Immutable file: no writes, no truncation, no link/unlink, even for root.
pub const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

fn flags_ioctl(file: &File, path: &Path, request: u64, flags: &mut libc::c_long) -> Result<()> {
    let rc = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            request as libc::c_ulong,
            std::ptr::from_mut::<libc::c_long>(flags),
        )
    };
    if rc < 0 {
        let op = if request == FS_IOC_GETFLAGS {
            "getflags"
        } else {
            "setflags"
        };
        return Err(BdhError::from_ioctl_errno(
            op,
            path,
            io::Error::last_os_error(),
        ));
    }
    Ok(())
}

/// Current inode flags.
pub fn getflags(file: &File, path: &Path) -> Result<libc::c_long> {
    let mut flags: libc::c_long = 0;
    flags_ioctl(file, path, FS_IOC_GETFLAGS, &mut flags)?;
    Ok(flags)
}

/// Set and clear inode flags in one read-modify-write.
///
/// Returns the previous state of the touched bits, so callers can tell
/// whether a flag they added was already present. Does not alter atime or
/// mtime. `add` and `remove` must not overlap.
pub fn editflags(
    file: &File,
    path: &Path,
    add: libc::c_long,
    remove: libc::c_long,
) -> Result<libc::c_long> {
    assert_eq!(add & remove, 0, "added and removed flags must not overlap");

    let mut flags: libc::c_long = 0;
    flags_ioctl(file, path, FS_IOC_GETFLAGS, &mut flags)?;
    let prev = flags;
    flags |= add;
    flags &= !remove;
    if flags != prev {
        flags_ioctl(file, path, FS_IOC_SETFLAGS, &mut flags)?;
    }
    Ok(prev & (add | remove))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Setting FS_IMMUTABLE_FL needs CAP_LINUX_IMMUTABLE, so tests stay on
    // the read side and the bookkeeping contract.

    #[test]
    fn getflags_on_regular_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        // tmpfs and some CI filesystems lack the ioctl; tolerate Unsupported.
        match getflags(tmp.as_file(), tmp.path()) {
            Ok(flags) => assert_eq!(flags & FS_IMMUTABLE_FL, 0),
            Err(BdhError::UnsupportedKernel { .. }) | Err(BdhError::Ioctl { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn noop_edit_reports_prior_bits() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        // add = remove = 0 never issues SETFLAGS, so this works unprivileged.
        match editflags(tmp.as_file(), tmp.path(), 0, 0) {
            Ok(prev) => assert_eq!(prev, 0),
            Err(BdhError::UnsupportedKernel { .. }) | Err(BdhError::Ioctl { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    #[should_panic(expected = "must not overlap")]
    fn overlapping_edit_is_a_bug() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let _ = editflags(
            tmp.as_file(),
            tmp.path(),
            FS_IMMUTABLE_FL,
            FS_IMMUTABLE_FL,
        );
    }
}
