//! Tracking store: WAL-mode sqlite database holding the volume registry,
//! the inode index, and the dedup event log.
//!
//! All persistent state lives here. The scanner commits `(inode records,
//! watermark)` pairs atomically; the orchestrator reads size classes and
//! writes back comparison results. Volumes are identified by
//! `(fs_uuid, root_id)`: remounting at a different path never creates a
//! second record, and a vanished volume keeps its rows for when it returns.

#![allow(missing_docs)]
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{BdhError, Result};

/// One tracked subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRow {
    pub id: i64,
    pub fs_uuid: String,
    pub root_id: u64,
    /// Every change with transaction id <= this has been absorbed.
    pub last_tracked_generation: u64,
    /// Cutoff the watermark is valid for; lowering the cutoff forces a
    /// full rescan so older, newly-eligible files get picked up.
    pub last_tracked_size_cutoff: Option<u64>,
    pub size_cutoff: u64,
    pub last_seen_path: Option<String>,
    pub online: bool,
}

/// One tracked inode, keyed by `(vol_id, ino)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub vol_id: i64,
    pub ino: u64,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    /// Transaction id of the last known change.
    pub generation: u64,
    /// Generation at which this inode last participated in a successful
    /// comparison; equal to `generation` means nothing new to do.
    pub last_compared_generation: u64,
}

/// Scanner output absorbed by [`TrackingStore::commit_scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedInode {
    pub ino: u64,
    pub size: u64,
    pub generation: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
}

/// Same-size equivalence class, members in canonical `(vol_id, ino)` order.
#[derive(Debug, Clone)]
pub struct SizeClass {
    pub size: u64,
    pub members: Vec<InodeRecord>,
}

/// The durable state store.
pub struct TrackingStore {
    conn: Connection,
    path: PathBuf,
}

impl TrackingStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BdhError::io(parent, source))?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── volumes ────────────────────

    /// Look up or register a volume by `(fs_uuid, root_id)`.
    ///
    /// A cutoff override updates the stored cutoff; otherwise a new volume
    /// starts at `default_cutoff` and an existing one keeps its setting.
    pub fn get_or_create_volume(
        &self,
        fs_uuid: &str,
        root_id: u64,
        cutoff_override: Option<u64>,
        default_cutoff: u64,
    ) -> Result<VolumeRow> {
        let existing = self
            .conn
            .prepare_cached(
                "SELECT id FROM volumes WHERE fs_uuid = ?1 AND root_id = ?2",
            )?
            .query_row(params![fs_uuid, root_id as i64], |row| row.get::<_, i64>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            Some(id) => {
                if let Some(cutoff) = cutoff_override {
                    self.conn
                        .prepare_cached("UPDATE volumes SET size_cutoff = ?1 WHERE id = ?2")?
                        .execute(params![cutoff as i64, id])?;
                }
                self.volume_by_id(id)
            }
            None => {
                let cutoff = cutoff_override.unwrap_or(default_cutoff);
                self.conn
                    .prepare_cached(
                        "INSERT INTO volumes (fs_uuid, root_id, size_cutoff) VALUES (?1, ?2, ?3)",
                    )?
                    .execute(params![fs_uuid, root_id as i64, cutoff as i64])?;
                self.volume_by_id(self.conn.last_insert_rowid())
            }
        }
    }

    fn volume_by_id(&self, id: i64) -> Result<VolumeRow> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT id, fs_uuid, root_id, last_tracked_generation,
                        last_tracked_size_cutoff, size_cutoff, last_seen_path, online
                 FROM volumes WHERE id = ?1",
            )?
            .query_row(params![id], volume_from_row)?;
        Ok(row)
    }

    /// Record where the volume is mounted this pass and flag it online.
    pub fn set_volume_seen(&self, vol_id: i64, mount_path: &str) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE volumes SET last_seen_path = ?1, online = 1 WHERE id = ?2",
            )?
            .execute(params![mount_path, vol_id])?;
        Ok(())
    }

    /// Flag every volume offline. Called at pass start; volumes actually
    /// resolved get flipped back by [`Self::set_volume_seen`].
    pub fn mark_all_offline(&self) -> Result<()> {
        self.conn.execute("UPDATE volumes SET online = 0", [])?;
        Ok(())
    }

    /// All known volumes, in registration order.
    pub fn volumes(&self) -> Result<Vec<VolumeRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, fs_uuid, root_id, last_tracked_generation,
                    last_tracked_size_cutoff, size_cutoff, last_seen_path, online
             FROM volumes ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], volume_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop a volume's inode records and reset its watermark.
    pub fn forget_volume(&mut self, vol_id: i64) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM inodes WHERE vol_id = ?1", params![vol_id])?;
        tx.execute(
            "UPDATE volumes
             SET last_tracked_generation = 0, last_tracked_size_cutoff = NULL
             WHERE id = ?1",
            params![vol_id],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    // ──────────────────── inode index ────────────────────

    /// Absorb one scan atomically: upsert the records and advance the
    /// watermark in the same transaction, so the watermark never runs ahead
    /// of the rows backing it.
    pub fn commit_scan(
        &mut self,
        vol_id: i64,
        records: &[ScannedInode],
        watermark: u64,
        cutoff: u64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO inodes (vol_id, ino, size, mtime_sec, mtime_nsec, generation)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(vol_id, ino) DO UPDATE SET
                     size = excluded.size,
                     mtime_sec = excluded.mtime_sec,
                     mtime_nsec = excluded.mtime_nsec,
                     generation = MAX(inodes.generation, excluded.generation)",
            )?;
            for record in records {
                upsert.execute(params![
                    vol_id,
                    record.ino as i64,
                    record.size as i64,
                    record.mtime_sec,
                    record.mtime_nsec,
                    record.generation as i64,
                ])?;
            }
        }
        tx.execute(
            "UPDATE volumes
             SET last_tracked_generation = MAX(last_tracked_generation, ?1),
                 last_tracked_size_cutoff = ?2
             WHERE id = ?3",
            params![watermark as i64, cutoff as i64, vol_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Forget an inode the scanner or orchestrator found to be gone.
    pub fn remove_inode(&self, vol_id: i64, ino: u64) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM inodes WHERE vol_id = ?1 AND ino = ?2")?
            .execute(params![vol_id, ino as i64])?;
        Ok(())
    }

    /// Record that an inode was cloned or verified equal at its current
    /// generation; it drops out of class formation until it changes again.
    pub fn mark_compared(&self, vol_id: i64, ino: u64) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE inodes SET last_compared_generation = generation
                 WHERE vol_id = ?1 AND ino = ?2",
            )?
            .execute(params![vol_id, ino as i64])?;
        Ok(())
    }

    /// Same-size equivalence classes across the selected volumes.
    ///
    /// A class needs at least two members, a non-zero size of at least
    /// `min_size`, and at least one member with work pending (its generation
    /// moved past the last comparison). Classes come back in descending size
    /// order (bigger payoff first) and members in `(vol_id, ino)` order so
    /// passes are deterministic.
    pub fn size_classes(&self, vol_ids: &[i64], min_size: u64) -> Result<Vec<SizeClass>> {
        if vol_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; vol_ids.len()].join(",");

        let sizes: Vec<i64> = {
            let sql = format!(
                "SELECT size FROM inodes
                 WHERE vol_id IN ({placeholders}) AND size >= ?{n} AND size > 0
                 GROUP BY size
                 HAVING COUNT(*) >= 2 AND MAX(generation > last_compared_generation) = 1
                 ORDER BY size DESC",
                n = vol_ids.len() + 1,
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut bound: Vec<i64> = vol_ids.to_vec();
            bound.push(min_size as i64);
            stmt.query_map(rusqlite::params_from_iter(bound), |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let member_sql = format!(
            "SELECT vol_id, ino, size, mtime_sec, mtime_nsec, generation,
                    last_compared_generation
             FROM inodes
             WHERE vol_id IN ({placeholders}) AND size = ?{n}
             ORDER BY vol_id ASC, ino ASC",
            n = vol_ids.len() + 1,
        );
        let mut member_stmt = self.conn.prepare(&member_sql)?;

        let mut classes = Vec::with_capacity(sizes.len());
        for size in sizes {
            let mut bound: Vec<i64> = vol_ids.to_vec();
            bound.push(size);
            let members = member_stmt
                .query_map(rusqlite::params_from_iter(bound), inode_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            classes.push(SizeClass {
                size: size as u64,
                members,
            });
        }
        Ok(classes)
    }

    /// All records for one volume, for diagnostics and tests.
    pub fn inodes_for_volume(&self, vol_id: i64) -> Result<Vec<InodeRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT vol_id, ino, size, mtime_sec, mtime_nsec, generation,
                    last_compared_generation
             FROM inodes WHERE vol_id = ?1 ORDER BY ino ASC",
        )?;
        let rows = stmt
            .query_map(params![vol_id], inode_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── dedup event log ────────────────────

    /// Append one dedup event with its participating inodes.
    pub fn log_dedup_event(
        &mut self,
        fs_uuid: &str,
        item_size: u64,
        participants: &[(i64, u64)],
    ) -> Result<()> {
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let tx = self.conn.transaction()?;
        tx.prepare_cached(
            "INSERT INTO dedup_events (fs_uuid, item_size, created) VALUES (?1, ?2, ?3)",
        )?
        .execute(params![fs_uuid, item_size as i64, created])?;
        let event_id = tx.last_insert_rowid();
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO dedup_event_inodes (event_id, vol_id, ino) VALUES (?1, ?2, ?3)",
            )?;
            for (vol_id, ino) in participants {
                insert.execute(params![event_id, vol_id, *ino as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// `(event count, estimated reclaimed bytes)` for one filesystem.
    ///
    /// Each event of size S with N participants reclaimed about S*(N-1).
    pub fn event_totals(&self, fs_uuid: &str) -> Result<(u64, u64)> {
        let (events, bytes): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(item_size * (participants - 1)), 0)
             FROM (
                SELECT e.item_size AS item_size,
                       (SELECT COUNT(*) FROM dedup_event_inodes i
                        WHERE i.event_id = e.id) AS participants
                FROM dedup_events e WHERE e.fs_uuid = ?1
             )",
            params![fs_uuid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((events as u64, bytes.max(0) as u64))
    }
}

fn volume_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VolumeRow> {
    Ok(VolumeRow {
        id: row.get(0)?,
        fs_uuid: row.get(1)?,
        root_id: row.get::<_, i64>(2)? as u64,
        last_tracked_generation: row.get::<_, i64>(3)? as u64,
        last_tracked_size_cutoff: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        size_cutoff: row.get::<_, i64>(5)? as u64,
        last_seen_path: row.get(6)?,
        online: row.get::<_, i64>(7)? != 0,
    })
}

fn inode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InodeRecord> {
    Ok(InodeRecord {
        vol_id: row.get(0)?,
        ino: row.get::<_, i64>(1)? as u64,
        size: row.get::<_, i64>(2)? as u64,
        mtime_sec: row.get(3)?,
        mtime_nsec: row.get::<_, i64>(4)? as u32,
        generation: row.get::<_, i64>(5)? as u64,
        last_compared_generation: row.get::<_, i64>(6)? as u64,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -8000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS volumes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fs_uuid TEXT NOT NULL CHECK(fs_uuid != ''),
            root_id INTEGER NOT NULL,
            last_tracked_generation INTEGER NOT NULL DEFAULT 0,
            last_tracked_size_cutoff INTEGER,
            size_cutoff INTEGER NOT NULL,
            last_seen_path TEXT,
            online INTEGER NOT NULL DEFAULT 1,
            UNIQUE(fs_uuid, root_id)
        );

        CREATE TABLE IF NOT EXISTS inodes (
            vol_id INTEGER NOT NULL REFERENCES volumes(id),
            ino INTEGER NOT NULL,
            size INTEGER NOT NULL CHECK(size >= 0),
            mtime_sec INTEGER NOT NULL DEFAULT 0,
            mtime_nsec INTEGER NOT NULL DEFAULT 0,
            generation INTEGER NOT NULL,
            last_compared_generation INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (vol_id, ino)
        );

        CREATE INDEX IF NOT EXISTS idx_inodes_size ON inodes(size);

        CREATE TABLE IF NOT EXISTS dedup_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fs_uuid TEXT NOT NULL,
            item_size INTEGER NOT NULL,
            created TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dedup_event_inodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER NOT NULL REFERENCES dedup_events(id),
            vol_id INTEGER NOT NULL,
            ino INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_fs ON dedup_events(fs_uuid);
        CREATE INDEX IF NOT EXISTS idx_event_inodes_event ON dedup_event_inodes(event_id);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, TrackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(&dir.path().join("tracking.db")).unwrap();
        (dir, store)
    }

    fn scanned(ino: u64, size: u64, generation: u64) -> ScannedInode {
        ScannedInode {
            ino,
            size,
            generation,
            mtime_sec: 1_700_000_000,
            mtime_nsec: 0,
        }
    }

    #[test]
    fn volume_registration_is_stable_across_remounts() {
        let (_dir, store) = temp_store();
        let a = store
            .get_or_create_volume("uuid-1", 256, None, 8 << 20)
            .unwrap();
        store.set_volume_seen(a.id, "/mnt/one").unwrap();
        // Same identity re-observed at a different mount path.
        let b = store
            .get_or_create_volume("uuid-1", 256, None, 8 << 20)
            .unwrap();
        assert_eq!(a.id, b.id);
        store.set_volume_seen(b.id, "/mnt/two").unwrap();

        let vols = store.volumes().unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].last_seen_path.as_deref(), Some("/mnt/two"));
    }

    #[test]
    fn cutoff_override_updates_existing_volume() {
        let (_dir, store) = temp_store();
        let v = store
            .get_or_create_volume("uuid-1", 256, None, 8 << 20)
            .unwrap();
        assert_eq!(v.size_cutoff, 8 << 20);
        let v = store
            .get_or_create_volume("uuid-1", 256, Some(4096), 8 << 20)
            .unwrap();
        assert_eq!(v.size_cutoff, 4096);
    }

    #[test]
    fn commit_scan_is_atomic_over_records_and_watermark() {
        let (_dir, mut store) = temp_store();
        let vol = store
            .get_or_create_volume("uuid-1", 256, None, 0)
            .unwrap();

        store
            .commit_scan(vol.id, &[scanned(300, 4096, 10), scanned(301, 4096, 11)], 12, 0)
            .unwrap();

        let vols = store.volumes().unwrap();
        assert_eq!(vols[0].last_tracked_generation, 12);
        assert_eq!(vols[0].last_tracked_size_cutoff, Some(0));
        assert_eq!(store.inodes_for_volume(vol.id).unwrap().len(), 2);
    }

    #[test]
    fn watermark_never_decreases() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store.commit_scan(vol.id, &[], 50, 0).unwrap();
        store.commit_scan(vol.id, &[], 20, 0).unwrap();
        assert_eq!(store.volumes().unwrap()[0].last_tracked_generation, 50);
    }

    #[test]
    fn generation_is_monotonic_per_inode() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 10)], 10, 0)
            .unwrap();
        // A stale record must not lower the stored generation.
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 5)], 11, 0)
            .unwrap();
        let records = store.inodes_for_volume(vol.id).unwrap();
        assert_eq!(records[0].generation, 10);
    }

    #[test]
    fn upsert_preserves_comparison_state() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 10)], 10, 0)
            .unwrap();
        store.mark_compared(vol.id, 300).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 20)], 20, 0)
            .unwrap();
        let records = store.inodes_for_volume(vol.id).unwrap();
        assert_eq!(records[0].generation, 20);
        assert_eq!(records[0].last_compared_generation, 10);
    }

    #[test]
    fn size_classes_exclude_singletons_and_zero() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(
                vol.id,
                &[
                    scanned(300, 4096, 1),
                    scanned(301, 4096, 1),
                    scanned(302, 8192, 1), // singleton
                    scanned(303, 0, 1),    // empty
                    scanned(304, 0, 1),
                ],
                1,
                0,
            )
            .unwrap();

        let classes = store.size_classes(&[vol.id], 0).unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].size, 4096);
        let inos: Vec<u64> = classes[0].members.iter().map(|m| m.ino).collect();
        assert_eq!(inos, vec![300, 301]);
    }

    #[test]
    fn classes_come_back_largest_first() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(
                vol.id,
                &[
                    scanned(300, 4096, 1),
                    scanned(301, 4096, 1),
                    scanned(310, 1 << 20, 1),
                    scanned(311, 1 << 20, 1),
                ],
                1,
                0,
            )
            .unwrap();
        let classes = store.size_classes(&[vol.id], 0).unwrap();
        let sizes: Vec<u64> = classes.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![1 << 20, 4096]);
    }

    #[test]
    fn min_size_filter_applies() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(
                vol.id,
                &[
                    scanned(300, 4096, 1),
                    scanned(301, 4096, 1),
                    scanned(310, 1 << 20, 1),
                    scanned(311, 1 << 20, 1),
                ],
                1,
                0,
            )
            .unwrap();
        let classes = store.size_classes(&[vol.id], 8192).unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].size, 1 << 20);
    }

    #[test]
    fn fully_compared_class_is_not_formed_again() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 7), scanned(301, 4096, 7)], 7, 0)
            .unwrap();

        assert_eq!(store.size_classes(&[vol.id], 0).unwrap().len(), 1);

        store.mark_compared(vol.id, 300).unwrap();
        store.mark_compared(vol.id, 301).unwrap();
        // Second pass over an unmodified tree: nothing to do.
        assert!(store.size_classes(&[vol.id], 0).unwrap().is_empty());

        // One member changes again: the whole class comes back.
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 9)], 9, 0)
            .unwrap();
        let classes = store.size_classes(&[vol.id], 0).unwrap();
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].members.len(), 2);
    }

    #[test]
    fn classes_span_selected_volumes_only() {
        let (_dir, mut store) = temp_store();
        let a = store.get_or_create_volume("u", 256, None, 0).unwrap();
        let b = store.get_or_create_volume("u", 257, None, 0).unwrap();
        let c = store.get_or_create_volume("u", 258, None, 0).unwrap();
        store.commit_scan(a.id, &[scanned(300, 4096, 1)], 1, 0).unwrap();
        store.commit_scan(b.id, &[scanned(400, 4096, 1)], 1, 0).unwrap();
        store.commit_scan(c.id, &[scanned(500, 4096, 1)], 1, 0).unwrap();

        let classes = store.size_classes(&[a.id, b.id], 0).unwrap();
        assert_eq!(classes.len(), 1);
        let keys: Vec<(i64, u64)> = classes[0].members.iter().map(|m| (m.vol_id, m.ino)).collect();
        assert_eq!(keys, vec![(a.id, 300), (b.id, 400)]);
    }

    #[test]
    fn remove_inode_deletes_the_record() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 1)], 1, 0)
            .unwrap();
        store.remove_inode(vol.id, 300).unwrap();
        assert!(store.inodes_for_volume(vol.id).unwrap().is_empty());
    }

    #[test]
    fn forget_volume_resets_tracking() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .commit_scan(vol.id, &[scanned(300, 4096, 9)], 9, 4096)
            .unwrap();
        let removed = store.forget_volume(vol.id).unwrap();
        assert_eq!(removed, 1);
        let v = store.volumes().unwrap().remove(0);
        assert_eq!(v.last_tracked_generation, 0);
        assert_eq!(v.last_tracked_size_cutoff, None);
    }

    #[test]
    fn event_log_totals() {
        let (_dir, mut store) = temp_store();
        let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
        store
            .log_dedup_event("u", 1 << 20, &[(vol.id, 300), (vol.id, 301), (vol.id, 302)])
            .unwrap();
        store
            .log_dedup_event("u", 4096, &[(vol.id, 400), (vol.id, 401)])
            .unwrap();

        let (events, bytes) = store.event_totals("u").unwrap();
        assert_eq!(events, 2);
        assert_eq!(bytes, 2 * (1 << 20) + 4096);
        assert_eq!(store.event_totals("other").unwrap(), (0, 0));
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tracking.db");
        {
            let mut store = TrackingStore::open(&db_path).unwrap();
            let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();
            store
                .commit_scan(vol.id, &[scanned(300, 4096, 3)], 3, 0)
                .unwrap();
        }
        let store = TrackingStore::open(&db_path).unwrap();
        let vols = store.volumes().unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].last_tracked_generation, 3);
        assert_eq!(store.inodes_for_volume(vols[0].id).unwrap().len(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Replaying any interleaving of scans keeps per-inode
            /// generations non-decreasing and keys unique.
            #[test]
            fn generations_never_regress(
                scans in proptest::collection::vec(
                    proptest::collection::vec((300u64..310, 1u64..5000, 1u64..100), 0..8),
                    1..6,
                )
            ) {
                let dir = tempfile::tempdir().unwrap();
                let mut store = TrackingStore::open(&dir.path().join("p.db")).unwrap();
                let vol = store.get_or_create_volume("u", 256, None, 0).unwrap();

                let mut highest: std::collections::HashMap<u64, u64> =
                    std::collections::HashMap::new();
                for (pass, scan) in scans.iter().enumerate() {
                    let records: Vec<ScannedInode> = scan
                        .iter()
                        .map(|&(ino, size, generation)| ScannedInode {
                            ino, size, generation, mtime_sec: 0, mtime_nsec: 0,
                        })
                        .collect();
                    store.commit_scan(vol.id, &records, pass as u64, 0).unwrap();
                    for r in &records {
                        let entry = highest.entry(r.ino).or_insert(0);
                        *entry = (*entry).max(r.generation);
                    }
                }

                let stored = store.inodes_for_volume(vol.id).unwrap();
                let mut seen = std::collections::HashSet::new();
                for record in &stored {
                    prop_assert!(seen.insert(record.ino), "duplicate key");
                    prop_assert_eq!(record.generation, highest[&record.ino]);
                }
            }
        }
    }
}
