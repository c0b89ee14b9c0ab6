//! Dedup orchestrator: drives scan → index → lock → compare → clone and
//! enforces the failure policy.
//!
//! Work happens at class granularity. The pass is interruptible between
//! classes; inside a class the locker's drop guards keep the revert
//! obligation even when the pass aborts. The store watermark only moves at
//! scanner commits, never mid-class, so an interrupt cannot make a file
//! skip a pass.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use filetime::FileTime;

use crate::core::errors::{BdhError, Result};
use crate::dedup::Outcome;
use crate::dedup::compare;
use crate::dedup::locker::{self, LockFailure, LockRequest, LockSet};
use crate::platform::{btrfs, fiemap, ioprio};
use crate::registry::{self, OpenVolume};
use crate::scanner;
use crate::store::{SizeClass, TrackingStore, VolumeRow};

/// Pass-level knobs, resolved from config + CLI by the caller.
#[derive(Debug, Clone)]
pub struct DedupOptions {
    pub crossvol: bool,
    pub defrag: bool,
    pub compare_block: usize,
    pub size_cutoff: Option<u64>,
    pub default_size_cutoff: u64,
    pub verbose: bool,
}

/// Counts per outcome for one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub cloned: u64,
    pub already_shared: u64,
    pub mismatched: u64,
    pub busy: u64,
    pub changed: u64,
    pub vanished: u64,
    pub locked: u64,
    pub io_errors: u64,
    pub classes_seen: u64,
    pub bytes_reclaimed: u64,
    pub interrupted: bool,
}

impl PassSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Cloned => self.cloned += 1,
            Outcome::AlreadyShared => self.already_shared += 1,
            Outcome::Mismatch => self.mismatched += 1,
            Outcome::Busy => self.busy += 1,
            Outcome::Changed => self.changed += 1,
            Outcome::Vanished => self.vanished += 1,
            Outcome::Locked => self.locked += 1,
            Outcome::IoError => self.io_errors += 1,
        }
    }

    /// Class-level failures the exit code must reflect.
    pub fn has_failures(&self) -> bool {
        self.busy + self.changed + self.locked + self.io_errors > 0
    }
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "classes {}, cloned {}, already-shared {}, mismatch {}, busy {}, \
             changed {}, vanished {}, locked {}, io-errors {}, reclaimed ~{} bytes",
            self.classes_seen,
            self.cloned,
            self.already_shared,
            self.mismatched,
            self.busy,
            self.changed,
            self.vanished,
            self.locked,
            self.io_errors,
            self.bytes_reclaimed,
        )
    }
}

/// Cooperative interrupt flag, settable from signal handlers.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM into the flag. Registration failures are
    /// reported but not fatal; the pass just loses graceful interruption.
    pub fn register_signals(&self) {
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.0)) {
                eprintln!("[BDH-PASS] failed to register signal {signal}: {e}");
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Drives one pass over the selected volumes.
pub struct Orchestrator<'s> {
    store: &'s mut TrackingStore,
    options: DedupOptions,
    shutdown: ShutdownFlag,
    summary: PassSummary,
}

impl<'s> Orchestrator<'s> {
    pub fn new(store: &'s mut TrackingStore, options: DedupOptions, shutdown: ShutdownFlag) -> Self {
        Self {
            store,
            options,
            shutdown,
            summary: PassSummary::default(),
        }
    }

    /// Resolve volume references, register them, and run the scanner over
    /// each. Read-only and duplicate volumes are skipped with a notice.
    pub fn scan_volumes(&mut self, references: &[String]) -> Result<Vec<(OpenVolume, VolumeRow)>> {
        self.store.mark_all_offline()?;

        let mut volumes: Vec<(OpenVolume, VolumeRow)> = Vec::new();
        for reference in references {
            let volume = registry::resolve(reference)?;
            if volume.readonly {
                eprintln!(
                    "[BDH-SCAN] {} is read-only, skipping (snapshots cannot be deduplicated)",
                    volume.path.display()
                );
                continue;
            }
            if volumes
                .iter()
                .any(|(v, _)| v.fs_uuid == volume.fs_uuid && v.root_id == volume.root_id)
            {
                continue;
            }

            let row = self.store.get_or_create_volume(
                &volume.fs_uuid,
                volume.root_id,
                self.options.size_cutoff,
                self.options.default_size_cutoff,
            )?;
            self.store
                .set_volume_seen(row.id, &volume.path.to_string_lossy())?;

            let report = scanner::scan_volume(&volume, &row, self.store)?;
            eprintln!(
                "[BDH-SCAN] {}: absorbed {} of {} items, watermark {}",
                volume.path.display(),
                report.stats.absorbed,
                report.stats.items_seen,
                report.watermark,
            );
            if self.options.verbose {
                eprintln!(
                    "[BDH-SCAN]   below-cutoff {}, not-regular {}, nocow {}, stale {}",
                    report.stats.below_cutoff,
                    report.stats.not_regular,
                    report.stats.nocow,
                    report.stats.stale,
                );
            }
            // Re-read: the scan advanced the watermark.
            let row = self.store.get_or_create_volume(
                &volume.fs_uuid,
                volume.root_id,
                None,
                self.options.default_size_cutoff,
            )?;
            volumes.push((volume, row));
        }
        Ok(volumes)
    }

    /// Full pass: scan, then lock/compare/clone every eligible class.
    pub fn run_dedup(&mut self, references: &[String]) -> Result<PassSummary> {
        ioprio::set_idle_priority();
        let volumes = self.scan_volumes(references)?;

        // Classes never span filesystems; group the selected volumes first.
        let mut by_fs: BTreeMap<String, Vec<&(OpenVolume, VolumeRow)>> = BTreeMap::new();
        for entry in &volumes {
            by_fs.entry(entry.0.fs_uuid.clone()).or_default().push(entry);
        }

        let crossvol_ok = self.options.crossvol && btrfs::supports_cross_subvol_clone();

        'pass: for (fs_uuid, group) in by_fs {
            let vol_ids: Vec<i64> = group.iter().map(|(_, row)| row.id).collect();
            let by_id: HashMap<i64, &OpenVolume> =
                group.iter().map(|(vol, row)| (row.id, vol)).collect();

            let classes = self.store.size_classes(&vol_ids, 1)?;
            for class in classes {
                if self.shutdown.is_set() {
                    eprintln!("[BDH-PASS] interrupted, stopping before next class");
                    self.summary.interrupted = true;
                    break 'pass;
                }
                self.summary.classes_seen += 1;
                self.process_class(&fs_uuid, &by_id, class, crossvol_ok)?;
            }
        }

        eprintln!("[BDH-PASS] {}", self.summary);
        Ok(self.summary)
    }

    /// Safe-lock + compare + clone a user-supplied file set, bypassing the
    /// index. Files are grouped by size; singleton sizes are skipped.
    pub fn run_files(&mut self, paths: &[PathBuf]) -> Result<PassSummary> {
        use std::os::linux::fs::MetadataExt;

        ioprio::set_idle_priority();

        let mut by_size: BTreeMap<u64, Vec<LockRequest>> = BTreeMap::new();
        for path in paths {
            let meta = std::fs::symlink_metadata(path).map_err(|e| BdhError::io(path, e))?;
            if !meta.is_file() {
                return Err(BdhError::InvalidConfig {
                    details: format!("{} is not a regular file", path.display()),
                });
            }
            if meta.len() == 0 {
                eprintln!("[BDH-PASS] {} is empty, skipping", path.display());
                continue;
            }
            let mtime = FileTime::from_last_modification_time(&meta);
            by_size
                .entry(meta.len())
                .or_default()
                .push(LockRequest {
                    vol_id: -1,
                    ino: meta.st_ino(),
                    path: path.clone(),
                    size: meta.len(),
                    mtime_sec: mtime.unix_seconds(),
                    mtime_nsec: mtime.nanoseconds(),
                    generation: 0,
                });
        }

        for (size, requests) in by_size.into_iter().rev() {
            if requests.len() < 2 {
                eprintln!(
                    "[BDH-PASS] no other file of size {size}, skipping {}",
                    requests[0].path.display()
                );
                continue;
            }
            self.summary.classes_seen += 1;
            self.lock_and_clone(None, size, requests)?;
        }

        eprintln!("[BDH-PASS] {}", self.summary);
        Ok(self.summary)
    }

    // ──────────────────── class processing ────────────────────

    fn process_class(
        &mut self,
        fs_uuid: &str,
        volumes: &HashMap<i64, &OpenVolume>,
        class: SizeClass,
        crossvol_ok: bool,
    ) -> Result<()> {
        // Resolve index records to paths; stale records are confirmation
        // that the inode is gone and get removed here.
        let mut requests: Vec<LockRequest> = Vec::new();
        for record in &class.members {
            let Some(volume) = volumes.get(&record.vol_id) else {
                continue;
            };
            match volume.path_of_inode(record.ino) {
                Ok(path) => requests.push(LockRequest {
                    vol_id: record.vol_id,
                    ino: record.ino,
                    path,
                    size: record.size,
                    mtime_sec: record.mtime_sec,
                    mtime_nsec: record.mtime_nsec,
                    generation: record.generation,
                }),
                Err(BdhError::Vanished { .. }) => {
                    self.store.remove_inode(record.vol_id, record.ino)?;
                    self.summary.record(Outcome::Vanished);
                }
                Err(other) => return Err(other),
            }
        }

        // Candidates in different subvolumes are never paired unless the
        // kernel can clone across them and the user did not opt out.
        let groups: Vec<Vec<LockRequest>> = if crossvol_ok {
            vec![requests]
        } else {
            let mut by_vol: BTreeMap<i64, Vec<LockRequest>> = BTreeMap::new();
            for request in requests {
                by_vol.entry(request.vol_id).or_default().push(request);
            }
            by_vol.into_values().collect()
        };

        for group in groups {
            if group.len() < 2 {
                continue;
            }
            self.lock_and_clone(Some(fs_uuid), class.size, group)?;
        }
        Ok(())
    }

    /// Lock a group (retrying without members that fail), then compare and
    /// clone its equality sub-classes.
    fn lock_and_clone(
        &mut self,
        fs_uuid: Option<&str>,
        size: u64,
        mut requests: Vec<LockRequest>,
    ) -> Result<()> {
        let lock_set: LockSet = loop {
            if requests.len() < 2 {
                return Ok(());
            }
            let attempt = locker::acquire(requests)?;
            for (request, failure) in &attempt.failures {
                eprintln!(
                    "[BDH-LOCK] skipping {}: {failure}",
                    request.path.display()
                );
                let outcome = match failure {
                    LockFailure::Vanished => {
                        if request.vol_id >= 0 {
                            self.store.remove_inode(request.vol_id, request.ino)?;
                        }
                        Outcome::Vanished
                    }
                    LockFailure::Busy { .. } => Outcome::Busy,
                    LockFailure::Changed => Outcome::Changed,
                    LockFailure::Locked { .. } => Outcome::Locked,
                };
                self.summary.record(outcome);
            }
            match attempt.locked {
                Some(set) => break set,
                None => requests = attempt.survivors,
            }
        };

        // Open-phase dropouts can leave a lone survivor locked; nothing to
        // compare it against, and it stays pending for future passes.
        if lock_set.len() < 2 {
            return Ok(());
        }

        if self.options.defrag && btrfs::supports_safe_defrag() {
            // Pre-defrag both sides. Needs a writable handle, so it reuses
            // the clone-destination dance; failures are not worth a class.
            for file in lock_set.files() {
                let result =
                    file.with_writable(|writable| btrfs::defrag_range(writable, &file.request.path));
                if let Err(e) = result {
                    eprintln!(
                        "[BDH-PASS] defrag of {} failed: {e}",
                        file.request.path.display()
                    );
                }
            }
        }

        match self.clone_equal_subclasses(fs_uuid, size, &lock_set) {
            Ok(()) => Ok(()),
            // Class-level IO problems abandon the class but not the pass;
            // dropping the lock set reverts every flag.
            Err(e)
                if matches!(
                    e,
                    BdhError::Io { .. } | BdhError::Ioctl { .. } | BdhError::Vanished { .. }
                ) =>
            {
                eprintln!("[BDH-PASS] abandoning class of size {size}: {e}");
                self.summary.record(Outcome::IoError);
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    }

    fn clone_equal_subclasses(
        &mut self,
        fs_uuid: Option<&str>,
        size: u64,
        lock_set: &LockSet,
    ) -> Result<()> {
        let files = lock_set.files();
        let block = self.options.compare_block;

        let indices: Vec<usize> = (0..files.len()).collect();
        let subclasses = compare::partition_equal(indices, |&a, &b| {
            compare::contents_equal(files[a].file(), files[b].file(), size, block)
                .map_err(|e| BdhError::io(&files[b].request.path, e))
        })?;

        for subclass in &subclasses {
            if subclass.len() < 2 {
                // Verified unequal against every reference: a mismatch
                // outcome, and it stays pending for future classes.
                self.summary.record(Outcome::Mismatch);
                continue;
            }

            let reference = &files[subclass[0]];
            let mut participants: Vec<(i64, u64)> = vec![(reference.request.vol_id, reference.request.ino)];
            let mut any_cloned = false;

            for &candidate_index in &subclass[1..] {
                let candidate = &files[candidate_index];

                // Already sharing every extent? Then the clone would be a
                // metadata-churning no-op.
                let shared = fiemap::same_extents(
                    reference.file(),
                    &reference.request.path,
                    candidate.file(),
                    &candidate.request.path,
                )
                .unwrap_or(false);
                if shared {
                    self.summary.record(Outcome::AlreadyShared);
                    self.mark_compared(candidate)?;
                    continue;
                }

                candidate.with_writable(|dest| {
                    btrfs::clone_whole_file(reference.file(), dest, &candidate.request.path)
                })?;
                self.summary.record(Outcome::Cloned);
                self.summary.bytes_reclaimed += size;
                self.mark_compared(candidate)?;
                participants.push((candidate.request.vol_id, candidate.request.ino));
                any_cloned = true;

                if self.options.verbose {
                    eprintln!(
                        "[BDH-PASS] cloned {} <- {}",
                        candidate.request.path.display(),
                        reference.request.path.display()
                    );
                }
            }

            // The reference was verified equal to at least one candidate.
            self.mark_compared(reference)?;

            if any_cloned && let Some(fs_uuid) = fs_uuid {
                let logged: Vec<(i64, u64)> = participants
                    .iter()
                    .filter(|(vol_id, _)| *vol_id >= 0)
                    .copied()
                    .collect();
                if !logged.is_empty() {
                    self.store.log_dedup_event(fs_uuid, size, &logged)?;
                }
            }
        }
        Ok(())
    }

    fn mark_compared(&mut self, file: &locker::LockedFile) -> Result<()> {
        if file.request.vol_id >= 0 {
            self.store
                .mark_compared(file.request.vol_id, file.request.ino)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_records_every_outcome() {
        let mut summary = PassSummary::default();
        for outcome in [
            Outcome::Cloned,
            Outcome::AlreadyShared,
            Outcome::Mismatch,
            Outcome::Busy,
            Outcome::Changed,
            Outcome::Vanished,
            Outcome::Locked,
            Outcome::IoError,
        ] {
            summary.record(outcome);
        }
        assert_eq!(summary.cloned, 1);
        assert_eq!(summary.already_shared, 1);
        assert_eq!(summary.mismatched, 1);
        assert_eq!(summary.busy, 1);
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.vanished, 1);
        assert_eq!(summary.locked, 1);
        assert_eq!(summary.io_errors, 1);
    }

    #[test]
    fn failure_predicate_ignores_benign_outcomes() {
        let mut summary = PassSummary::default();
        summary.record(Outcome::Cloned);
        summary.record(Outcome::Mismatch);
        summary.record(Outcome::Vanished);
        summary.record(Outcome::AlreadyShared);
        assert!(!summary.has_failures());

        summary.record(Outcome::Busy);
        assert!(summary.has_failures());
    }

    #[test]
    fn shutdown_flag_round_trip() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.trigger();
        assert!(flag.is_set());
        // Clones observe the same state.
        let clone = flag.clone();
        assert!(clone.is_set());
    }

    #[test]
    fn summary_display_mentions_all_counters() {
        let summary = PassSummary {
            cloned: 3,
            bytes_reclaimed: 12_288,
            ..PassSummary::default()
        };
        let text = summary.to_string();
        assert!(text.contains("cloned 3"));
        assert!(text.contains("12288"));
    }
}
