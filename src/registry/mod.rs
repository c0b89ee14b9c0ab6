//! Volume references and resolution.
//!
//! A volume is the pair `(fs_uuid, subvolume root id)`. Users name volumes
//! three ways (a path under a mount point, a `/dev/...` block path, or a
//! filesystem UUID) and every form funnels into [`resolve`], which opens
//! the subvolume root directory and reads its identity from the kernel.

#![allow(missing_docs)]

use std::fs::File;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use nix::sys::statfs::{BTRFS_SUPER_MAGIC, fstatfs};
use regex::Regex;

use crate::core::errors::{BdhError, Result};
use crate::platform::btrfs;
use crate::platform::item::BTRFS_FIRST_FREE_OBJECTID;

/// An opened, identified subvolume.
#[derive(Debug)]
pub struct OpenVolume {
    /// Directory handle on the subvolume root; all per-volume ioctls go
    /// through this fd.
    pub dir: File,
    /// Where the subvolume root is reachable right now.
    pub path: PathBuf,
    pub fs_uuid: String,
    pub root_id: u64,
    /// Anonymous device id the kernel assigned this subvolume.
    pub st_dev: u64,
    pub readonly: bool,
}

impl OpenVolume {
    /// Resolve an inode to an absolute path under this volume's mount.
    pub fn path_of_inode(&self, ino: u64) -> Result<PathBuf> {
        let rel = btrfs::ino_lookup_path(&self.dir, &self.path, ino)?;
        Ok(self.path.join(rel))
    }
}

/// How the user referred to a volume on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRef {
    Path(PathBuf),
    Device(PathBuf),
    Uuid(String),
}

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("uuid regex")
});

impl VolumeRef {
    pub fn parse(reference: &str) -> Self {
        if UUID_RE.is_match(reference) {
            Self::Uuid(reference.to_ascii_lowercase())
        } else if reference.starts_with("/dev/") {
            Self::Device(PathBuf::from(reference))
        } else {
            Self::Path(PathBuf::from(reference))
        }
    }
}

/// Resolve one user-supplied volume reference.
pub fn resolve(reference: &str) -> Result<OpenVolume> {
    match VolumeRef::parse(reference) {
        VolumeRef::Path(path) => open_volume_at(&path),
        VolumeRef::Device(device) => {
            // Canonicalize the user's reference so /dev/disk/by-* aliases
            // match the node the mount table names. Mount sources are only
            // canonicalized when they resolve; entries like /dev/root keep
            // their literal spelling.
            let device = std::fs::canonicalize(&device)
                .map_err(|e| BdhError::io(&device, e))?;
            let mounts = btrfs_mounts()?;
            let entry = mounts
                .iter()
                .find(|m| {
                    let source = Path::new(&m.source);
                    std::fs::canonicalize(source).map_or(source == device, |c| c == device)
                })
                .ok_or_else(|| BdhError::VolumeResolve {
                    reference: reference.to_string(),
                    details: "device is not a mounted btrfs filesystem".to_string(),
                })?;
            open_volume_at(&entry.mount_point)
        }
        VolumeRef::Uuid(uuid) => {
            for entry in btrfs_mounts()? {
                let Ok(volume) = open_volume_at(&entry.mount_point) else {
                    continue;
                };
                if volume.fs_uuid == uuid {
                    return Ok(volume);
                }
            }
            Err(BdhError::VolumeResolve {
                reference: reference.to_string(),
                details: "no mounted btrfs filesystem has this UUID".to_string(),
            })
        }
    }
}

/// Open the subvolume containing `path` and read its identity.
pub fn open_volume_at(path: &Path) -> Result<OpenVolume> {
    // A volume reference must name something that exists; canonicalizing
    // here both rejects dangling references early and makes the subvolume
    // climb below walk the real directory chain rather than symlink
    // aliases, whose parents can live on a different filesystem.
    let resolved = std::fs::canonicalize(path).map_err(|e| BdhError::io(path, e))?;
    let root_path = subvolume_root_of(&resolved)?;

    let dir = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(&root_path)
        .map_err(|e| BdhError::io(&root_path, e))?;

    let statfs = fstatfs(&dir).map_err(|e| BdhError::io(&root_path, std::io::Error::from(e)))?;
    if statfs.filesystem_type() != BTRFS_SUPER_MAGIC {
        return Err(BdhError::NotBtrfs { path: root_path });
    }

    let meta = dir.metadata().map_err(|e| BdhError::io(&root_path, e))?;
    let root_id = btrfs::subvolume_id(&dir, &root_path)?;
    let fs_uuid = btrfs::fs_uuid(&dir, &root_path)?;
    let readonly = if meta.st_ino() == BTRFS_FIRST_FREE_OBJECTID {
        btrfs::subvol_flags_readonly(&dir, &root_path)?
    } else {
        btrfs::root_item_readonly(&dir, &root_path, root_id)?
    };

    Ok(OpenVolume {
        st_dev: meta.st_dev(),
        dir,
        path: root_path,
        fs_uuid,
        root_id,
        readonly,
    })
}

/// Climb from a canonical `path` to the root directory of its containing
/// subvolume.
///
/// Subvolume roots are recognisable without ioctls: their directory inode
/// number is always `BTRFS_FIRST_FREE_OBJECTID`. The caller has already
/// canonicalized, so every component exists and none is a symlink.
fn subvolume_root_of(path: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(path).map_err(|e| BdhError::io(path, e))?;
    let mut current = if meta.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"))
    };

    loop {
        let meta = std::fs::metadata(&current).map_err(|e| BdhError::io(&current, e))?;
        if meta.st_ino() == BTRFS_FIRST_FREE_OBJECTID {
            return Ok(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            // Reached / without finding a subvolume root; let the statfs
            // check in open_volume_at produce the real diagnosis.
            None => return Ok(current),
        }
    }
}

// ──────────────────── mount table ────────────────────

/// One line of `/proc/self/mountinfo`, reduced to what volume resolution
/// needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
    /// Subvolume path within the filesystem (the "root" field).
    pub subvol: String,
}

/// All mounted btrfs filesystems, first mount of each device first.
pub fn btrfs_mounts() -> Result<Vec<MountEntry>> {
    let text = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| BdhError::MountParse {
            details: e.to_string(),
        })?;
    Ok(parse_mountinfo(&text)
        .into_iter()
        .filter(|m| m.fs_type == "btrfs")
        .collect())
}

/// Parse mountinfo lines: `id parent major:minor root mountpoint opts
/// [optional...] - fstype source superopts`. Unparseable lines are skipped;
/// the kernel appends new optional fields over time.
pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(sep) = fields.iter().position(|&f| f == "-") else {
            continue;
        };
        if fields.len() < 6 || fields.len() < sep + 3 {
            continue;
        }
        entries.push(MountEntry {
            mount_point: PathBuf::from(unescape_mount_path(fields[4])),
            fs_type: fields[sep + 1].to_string(),
            source: fields[sep + 2].to_string(),
            subvol: unescape_mount_path(fields[3]),
        });
    }
    entries
}

/// Mountinfo escapes space, tab, newline, and backslash as octal.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            if let Ok(value) = u8::from_str_radix(&raw[i + 1..i + 4], 8) {
                out.push(value as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}
