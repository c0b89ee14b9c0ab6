//! Writer sweep over `/proc`.
//!
//! The immutable attribute only prevents *new* write opens; file descriptors
//! and shared writable mappings that already existed keep working. Before any
//! clone we therefore enumerate `/proc/<pid>/fd/*` and `/proc/<pid>/maps`
//! once and refuse to touch inodes some other process can still modify.
//!
//! Known residual risk: a process with CAP_LINUX_IMMUTABLE can clear the
//! attribute itself. That cannot be defended from userspace and is accepted.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::os::fd::RawFd;
use std::os::linux::fs::MetadataExt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Identity of an inode as seen by stat: `(device, inode number)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeId {
    pub dev: u64,
    pub ino: u64,
}

/// How a foreign process holds one of our target inodes writable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterVia {
    /// A file descriptor open with write access.
    OpenFd(u32),
    /// A `MAP_SHARED` mapping with `PROT_WRITE`.
    SharedMapping,
}

/// One detected writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterInfo {
    pub pid: u32,
    pub target: InodeId,
    pub via: WriterVia,
}

/// Sweep `/proc` once for write-capable users of `targets`.
///
/// The caller's own lock fds are excluded by `(self pid, fd number)`; any
/// *other* fd in this process pointing at a target still counts, because it
/// could be handed to arbitrary code. Processes that exit mid-sweep are
/// skipped silently: the sweep runs with the targets already immutable, so
/// a vanished reader cannot have been a writer we needed.
pub fn find_writers(targets: &[InodeId], own_fds: &[RawFd]) -> Vec<WriterInfo> {
    let wanted: HashSet<InodeId> = targets.iter().copied().collect();
    if wanted.is_empty() {
        return Vec::new();
    }

    let self_pid = std::process::id();
    let mut writers = Vec::new();

    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return writers;
    };

    for proc_entry in proc_dir.flatten() {
        let name = proc_entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };

        sweep_fds(&proc_entry.path(), pid, self_pid, own_fds, &wanted, &mut writers);
        sweep_maps(&proc_entry.path(), pid, &wanted, &mut writers);
    }

    writers
}

fn sweep_fds(
    proc_path: &Path,
    pid: u32,
    self_pid: u32,
    own_fds: &[RawFd],
    wanted: &HashSet<InodeId>,
    writers: &mut Vec<WriterInfo>,
) {
    let Ok(fd_entries) = fs::read_dir(proc_path.join("fd")) else {
        return;
    };

    for fd_entry in fd_entries.flatten() {
        let Ok(fd_num) = fd_entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == self_pid && own_fds.contains(&(fd_num as RawFd)) {
            continue;
        }

        // stat through the symlink identifies the inode; lstat of the
        // symlink itself exposes the open mode in its permission bits.
        let Ok(target_meta) = fs::metadata(fd_entry.path()) else {
            continue;
        };
        let id = InodeId {
            dev: target_meta.st_dev(),
            ino: target_meta.st_ino(),
        };
        if !wanted.contains(&id) {
            continue;
        }

        let Ok(link_meta) = fs::symlink_metadata(fd_entry.path()) else {
            continue;
        };
        if link_meta.st_mode() & 0o200 != 0 {
            writers.push(WriterInfo {
                pid,
                target: id,
                via: WriterVia::OpenFd(fd_num),
            });
        }
    }
}

fn sweep_maps(proc_path: &Path, pid: u32, wanted: &HashSet<InodeId>, writers: &mut Vec<WriterInfo>) {
    let Ok(maps) = fs::read_to_string(proc_path.join("maps")) else {
        return;
    };

    for line in maps.lines() {
        let Some(record) = parse_maps_line(line) else {
            continue;
        };
        if !record.writable_shared {
            continue;
        }
        let id = InodeId {
            dev: record.dev,
            ino: record.ino,
        };
        if wanted.contains(&id) {
            writers.push(WriterInfo {
                pid,
                target: id,
                via: WriterVia::SharedMapping,
            });
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MapsRecord {
    writable_shared: bool,
    dev: u64,
    ino: u64,
}

static MAPS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9a-f]+-[0-9a-f]+\s+([rwxps-]{4})\s+[0-9a-f]+\s+([0-9a-f]+):([0-9a-f]+)\s+(\d+)",
    )
    .expect("maps line regex")
});

/// `address perms offset dev inode [path]`; perms is `rwxp` or `rwxs`.
fn parse_maps_line(line: &str) -> Option<MapsRecord> {
    let caps = MAPS_LINE_RE.captures(line)?;
    let perms = caps.get(1)?.as_str().as_bytes();
    let major = u32::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
    let minor = u32::from_str_radix(caps.get(3)?.as_str(), 16).ok()?;
    let ino: u64 = caps.get(4)?.as_str().parse().ok()?;
    if ino == 0 {
        // Anonymous mapping.
        return None;
    }
    Some(MapsRecord {
        writable_shared: perms[1] == b'w' && perms[3] == b's',
        dev: libc::makedev(major, minor),
        ino,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn maps_line_parsing() {
        let shared = parse_maps_line(
            "7f2c4e5d6000-7f2c4e5f8000 rw-s 00000000 08:02 1234567   /some/file",
        )
        .unwrap();
        assert!(shared.writable_shared);
        assert_eq!(shared.ino, 1_234_567);
        assert_eq!(shared.dev, libc::makedev(8, 2));

        let private = parse_maps_line(
            "7f2c4e5d6000-7f2c4e5f8000 rw-p 00000000 08:02 1234567   /some/file",
        )
        .unwrap();
        assert!(!private.writable_shared);

        let readonly_shared =
            parse_maps_line("7f2c4e5d6000-7f2c4e5f8000 r--s 00000000 08:02 99 /f").unwrap();
        assert!(!readonly_shared.writable_shared);

        // Anonymous mappings carry inode 0 and never match a file target.
        assert!(
            parse_maps_line("7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]").is_none()
        );
        assert!(parse_maps_line("not a maps line").is_none());
    }

    fn inode_id_of(file: &std::fs::File) -> InodeId {
        let meta = file.metadata().unwrap();
        InodeId {
            dev: meta.st_dev(),
            ino: meta.st_ino(),
        }
    }

    #[test]
    fn detects_writable_fd_in_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim");
        let mut writable = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        writable.write_all(b"data").unwrap();

        let id = inode_id_of(&writable);
        // Not excluded: the sweep must flag our own writable fd.
        let writers = find_writers(&[id], &[]);
        assert!(
            writers
                .iter()
                .any(|w| w.pid == std::process::id() && w.target == id),
            "own writable fd should be detected: {writers:?}"
        );
    }

    #[test]
    fn excluded_own_fd_is_not_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held");
        let writable = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let id = inode_id_of(&writable);
        let writers = find_writers(&[id], &[writable.as_raw_fd()]);
        assert!(
            !writers
                .iter()
                .any(|w| w.pid == std::process::id() && w.target == id),
            "excluded fd must not count: {writers:?}"
        );
    }

    #[test]
    fn readonly_fd_is_not_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro");
        std::fs::write(&path, b"data").unwrap();
        let readonly = std::fs::File::open(&path).unwrap();

        let id = inode_id_of(&readonly);
        let writers = find_writers(&[id], &[]);
        assert!(
            !writers.iter().any(|w| w.target == id),
            "read-only fd must not count: {writers:?}"
        );
    }
}
