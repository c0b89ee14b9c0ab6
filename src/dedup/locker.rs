//! The immutable-attribute locking protocol.
//!
//! The clone ioctl does not re-check that both files are unmodified, so
//! userspace has to make modification impossible for the critical section:
//!
//! 1. open every file read-only (`O_NOFOLLOW`), pinning the inode
//! 2. set `FS_IMMUTABLE_FL`, remembering whether we set it
//! 3. sweep `/proc` once for writable fds and shared writable mappings
//! 4. re-stat and compare against the indexed size/mtime, since the
//!    immutable bit stops *future* writers, not ones that raced ahead of
//!    step 2
//! 5. hand the handles to the comparator/cloner
//! 6. on every exit path, clear the bit exactly where we set it and restore
//!    timestamps
//!
//! Step 6 is a `Drop` impl, so it runs on success, mismatch, clone error,
//! panic, and orchestrator-level interrupts alike. What it cannot survive is
//! SIGKILL between steps 2 and 6; such leftovers show up on the next pass as
//! already-immutable files, which are reported and never touched.

#![allow(missing_docs)]

use std::fs::File;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use filetime::FileTime;

use crate::core::errors::{BdhError, Result};
use crate::platform::chattr::{self, FS_IMMUTABLE_FL};
use crate::platform::proc_scan::{self, InodeId};

/// A file the orchestrator wants locked, with the indexed state the
/// stability recheck verifies against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Store key; `vol_id` is negative for store-less operation.
    pub vol_id: i64,
    pub ino: u64,
    pub path: PathBuf,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub generation: u64,
}

/// Why one member could not be locked. Never fatal to the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockFailure {
    /// Open failed with ENOENT, or the path now names a different inode.
    Vanished,
    /// Another process holds write access.
    Busy { pids: Vec<u32> },
    /// Size or mtime moved since indexing.
    Changed,
    /// SETFLAGS denied, or the file was already immutable (reported for
    /// `chattr -i` when left over from a crashed run).
    Locked { already_immutable: bool },
}

impl std::fmt::Display for LockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vanished => f.write_str("vanished"),
            Self::Busy { pids } => write!(f, "busy (pids {pids:?})"),
            Self::Changed => f.write_str("changed since indexing"),
            Self::Locked {
                already_immutable: true,
            } => f.write_str("already immutable"),
            Self::Locked { .. } => f.write_str("could not set immutable"),
        }
    }
}

/// One locked file. Reverting is automatic on drop.
pub struct LockedFile {
    pub request: LockRequest,
    file: File,
    dev: u64,
    ino: u64,
    we_set_immutable: bool,
    atime: FileTime,
    mtime: FileTime,
    released: bool,
}

impl LockedFile {
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn inode_id(&self) -> InodeId {
        InodeId {
            dev: self.dev,
            ino: self.ino,
        }
    }

    /// Run `operation` against a writable handle on this file.
    ///
    /// The immutable bit blocks both write opens and the clone ioctl, so it
    /// is cleared immediately before and re-set immediately after; the fresh
    /// handle is verified to still name the locked inode before `operation`
    /// sees it. The window is as small as userspace can make it; the
    /// preceding writer sweep covers every handle that existed before the
    /// class was locked.
    pub fn with_writable<R>(&self, operation: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        chattr::editflags(&self.file, &self.request.path, 0, FS_IMMUTABLE_FL)?;
        let result = self.writable_inner(operation);
        let restored = chattr::editflags(&self.file, &self.request.path, FS_IMMUTABLE_FL, 0);
        let value = result?;
        restored?;
        Ok(value)
    }

    fn writable_inner<R>(&self, operation: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&self.request.path)
            .map_err(|e| BdhError::io(&self.request.path, e))?;

        let meta = file
            .metadata()
            .map_err(|e| BdhError::io(&self.request.path, e))?;
        if meta.st_dev() != self.dev || meta.st_ino() != self.ino {
            return Err(BdhError::Vanished {
                path: self.request.path.clone(),
            });
        }
        operation(&file)
    }

    fn revert(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.we_set_immutable {
            return;
        }
        if let Err(e) = chattr::editflags(&self.file, &self.request.path, 0, FS_IMMUTABLE_FL) {
            eprintln!(
                "[BDH-LOCK] failed to clear immutable on {}: {e}; run `chattr -i` manually",
                self.request.path.display()
            );
            return;
        }
        // Our reads moved atime; flag edits themselves leave times alone.
        let _ = filetime::set_file_handle_times(&self.file, Some(self.atime), Some(self.mtime));
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        self.revert();
    }
}

/// A fully locked class. Holding this value is the license to compare and
/// clone its members.
pub struct LockSet {
    files: Vec<LockedFile>,
}

impl LockSet {
    pub fn files(&self) -> &[LockedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Result of one acquisition attempt.
///
/// Acquisition is all-or-nothing: on any failure everything already flagged
/// is reverted, the failing members are reported, and `survivors` carries
/// the requests worth retrying without them.
pub struct AcquireOutcome {
    pub locked: Option<LockSet>,
    pub failures: Vec<(LockRequest, LockFailure)>,
    pub survivors: Vec<LockRequest>,
}

/// Run the locking protocol over one class.
pub fn acquire(requests: Vec<LockRequest>) -> Result<AcquireOutcome> {
    let mut failures: Vec<(LockRequest, LockFailure)> = Vec::new();
    let mut opened: Vec<LockedFile> = Vec::new();

    // Step 1: open read-only, pinning inodes. Individual failures here cost
    // nothing, so they are dropped inline without aborting the attempt.
    for request in requests {
        let file = match std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&request.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                failures.push((request, LockFailure::Vanished));
                continue;
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                failures.push((
                    request,
                    LockFailure::Locked {
                        already_immutable: false,
                    },
                ));
                continue;
            }
            Err(e) => return Err(BdhError::io(&request.path, e)),
        };

        let meta = file.metadata().map_err(|e| BdhError::io(&request.path, e))?;
        if request.ino != 0 && meta.st_ino() != request.ino {
            // The path was recycled for a different inode.
            failures.push((request, LockFailure::Vanished));
            continue;
        }

        opened.push(LockedFile {
            dev: meta.st_dev(),
            ino: meta.st_ino(),
            request,
            file,
            we_set_immutable: false,
            atime: FileTime::zero(),
            mtime: FileTime::zero(),
            released: false,
        });
    }

    // Step 2: take the immutable attribute. A failure aborts the attempt
    // (dropping `opened` reverts whatever was flagged so far).
    for i in 0..opened.len() {
        let flagged = chattr::editflags(&opened[i].file, &opened[i].request.path, FS_IMMUTABLE_FL, 0);
        let prev = match flagged {
            Ok(prev) => prev,
            Err(BdhError::PermissionDenied { .. }) => {
                return Ok(fail_at(
                    opened,
                    failures,
                    i,
                    LockFailure::Locked {
                        already_immutable: false,
                    },
                ));
            }
            Err(other) => return Err(other),
        };

        if prev & FS_IMMUTABLE_FL != 0 {
            eprintln!(
                "[BDH-LOCK] {} is already immutable (crashed run?); leaving it alone. \
                 Clear with `chattr -i` to make it eligible again",
                opened[i].request.path.display()
            );
            return Ok(fail_at(
                opened,
                failures,
                i,
                LockFailure::Locked {
                    already_immutable: true,
                },
            ));
        }
        opened[i].we_set_immutable = true;

        // Timestamps measured after flagging; these are what revert restores.
        let meta = opened[i]
            .file
            .metadata()
            .map_err(|e| BdhError::io(&opened[i].request.path, e))?;
        opened[i].atime = FileTime::from_last_access_time(&meta);
        opened[i].mtime = FileTime::from_last_modification_time(&meta);
    }

    // Step 3: one writer sweep over /proc for the whole set.
    let targets: Vec<InodeId> = opened.iter().map(LockedFile::inode_id).collect();
    let own_fds: Vec<RawFd> = opened.iter().map(|l| l.file.as_raw_fd()).collect();
    let writers = proc_scan::find_writers(&targets, &own_fds);
    if !writers.is_empty() {
        let mut survivors = Vec::new();
        for locked in opened {
            let pids: Vec<u32> = writers
                .iter()
                .filter(|w| w.target == locked.inode_id())
                .map(|w| w.pid)
                .collect();
            if pids.is_empty() {
                survivors.push(locked.request.clone());
            } else {
                failures.push((locked.request.clone(), LockFailure::Busy { pids }));
            }
            // `locked` drops here, reverting its flag.
        }
        return Ok(AcquireOutcome {
            locked: None,
            failures,
            survivors,
        });
    }

    // Step 4: stability recheck against the indexed state. The bit only
    // blocks writes from now on; a write that landed between indexing and
    // step 2 shows up as a size/mtime delta.
    let mut changed = Vec::new();
    for locked in &opened {
        let meta = locked
            .file
            .metadata()
            .map_err(|e| BdhError::io(&locked.request.path, e))?;
        let mtime = FileTime::from_last_modification_time(&meta);
        if meta.len() != locked.request.size
            || mtime.unix_seconds() != locked.request.mtime_sec
            || mtime.nanoseconds() != locked.request.mtime_nsec
        {
            changed.push(locked.inode_id());
        }
    }
    if !changed.is_empty() {
        let mut survivors = Vec::new();
        for locked in opened {
            if changed.contains(&locked.inode_id()) {
                failures.push((locked.request.clone(), LockFailure::Changed));
            } else {
                survivors.push(locked.request.clone());
            }
        }
        return Ok(AcquireOutcome {
            locked: None,
            failures,
            survivors,
        });
    }

    // Step 5: hand off.
    Ok(AcquireOutcome {
        locked: Some(LockSet { files: opened }),
        failures,
        survivors: Vec::new(),
    })
}

/// Abort an attempt because the member at `culprit` failed: revert
/// everything, fail the culprit, keep the rest as survivors.
fn fail_at(
    opened: Vec<LockedFile>,
    mut failures: Vec<(LockRequest, LockFailure)>,
    culprit: usize,
    failure: LockFailure,
) -> AcquireOutcome {
    let mut survivors = Vec::new();
    for (i, locked) in opened.into_iter().enumerate() {
        if i == culprit {
            failures.push((locked.request.clone(), failure.clone()));
        } else {
            survivors.push(locked.request.clone());
        }
        // `locked` drops here, reverting its flag if it was taken.
    }
    AcquireOutcome {
        locked: None,
        failures,
        survivors,
    }
}
