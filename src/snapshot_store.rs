//! Persistence of backup snapshots and the failure records of apply runs.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rusqlite::{params, OptionalExtension};

use crate::db_manager::DbManager;
use crate::error::StoreError;
use crate::protocol::{
    ArtistField, BackupSnapshot, FailureRecord, SnapshotEntry, SnapshotSummary, WriteErrorKind,
};

/// SQLite-backed snapshot history. Snapshots are written once and never
/// updated or deleted.
pub struct SnapshotStore {
    db: DbManager,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: DbManager::open(path)?,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: DbManager::open_in_memory()?,
        })
    }

    /// Writes the snapshot header and all entries in one transaction.
    pub fn save_snapshot(&mut self, snapshot: &BackupSnapshot) -> Result<(), StoreError> {
        let tx = self.db.connection_mut().transaction()?;
        tx.execute(
            "INSERT INTO backup_snapshots (id, created_at) VALUES (?1, ?2)",
            params![
                snapshot.id,
                snapshot
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshot_entries
                    (snapshot_id, position, track_external_id, localized_name, field, previous_artist_name, new_artist_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (position, entry) in snapshot.entries.iter().enumerate() {
                stmt.execute(params![
                    snapshot.id,
                    position as i64,
                    entry.track_external_id,
                    entry.localized_name,
                    entry.field.as_str(),
                    entry.previous_artist_name,
                    entry.new_artist_name,
                ])?;
            }
        }
        tx.commit()?;
        debug!(
            "Snapshot[{}]: persisted {} entries",
            snapshot.id,
            snapshot.entries.len()
        );
        Ok(())
    }

    pub fn load_snapshot(&self, snapshot_id: &str) -> Result<BackupSnapshot, StoreError> {
        let created_at: Option<String> = self
            .db
            .connection()
            .query_row(
                "SELECT created_at FROM backup_snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(created_at) = created_at else {
            return Err(StoreError::SnapshotNotFound(snapshot_id.to_string()));
        };

        let mut stmt = self.db.connection().prepare(
            "SELECT track_external_id, localized_name, field, previous_artist_name, new_artist_name
             FROM snapshot_entries WHERE snapshot_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (track_external_id, localized_name, field, previous_artist_name, new_artist_name) =
                row?;
            let field = ArtistField::parse(&field).ok_or(StoreError::Corrupt {
                column: "field",
                value: field.clone(),
            })?;
            entries.push(SnapshotEntry {
                track_external_id,
                localized_name,
                field,
                previous_artist_name,
                new_artist_name,
            });
        }

        Ok(BackupSnapshot {
            id: snapshot_id.to_string(),
            created_at: parse_timestamp(&created_at)?,
            entries,
        })
    }

    /// Stored snapshots, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, StoreError> {
        let mut stmt = self.db.connection().prepare(
            "SELECT s.id, s.created_at,
                (SELECT COUNT(*) FROM snapshot_entries e WHERE e.snapshot_id = s.id),
                (SELECT COUNT(*) FROM apply_failures f WHERE f.snapshot_id = s.id)
             FROM backup_snapshots s ORDER BY s.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, created_at, entry_count, failure_count) = row?;
            summaries.push(SnapshotSummary {
                id,
                created_at: parse_timestamp(&created_at)?,
                entry_count: entry_count.max(0) as usize,
                failure_count: failure_count.max(0) as usize,
            });
        }
        Ok(summaries)
    }

    /// Appends failure records to a stored snapshot.
    pub fn save_failures(
        &mut self,
        snapshot_id: &str,
        failures: &[FailureRecord],
    ) -> Result<(), StoreError> {
        if failures.is_empty() {
            return Ok(());
        }
        let tx = self.db.connection_mut().transaction()?;
        let next_position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM apply_failures WHERE snapshot_id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO apply_failures
                    (snapshot_id, position, track_external_id, attempted_name, error_kind, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (offset, failure) in failures.iter().enumerate() {
                stmt.execute(params![
                    snapshot_id,
                    next_position + offset as i64,
                    failure.track_external_id,
                    failure.attempted_name,
                    failure.error_kind.as_str(),
                    failure.message,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn failures_for(&self, snapshot_id: &str) -> Result<Vec<FailureRecord>, StoreError> {
        let mut stmt = self.db.connection().prepare(
            "SELECT track_external_id, attempted_name, error_kind, message
             FROM apply_failures WHERE snapshot_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut failures = Vec::new();
        for row in rows {
            let (track_external_id, attempted_name, error_kind, message) = row?;
            let error_kind = WriteErrorKind::parse(&error_kind).ok_or(StoreError::Corrupt {
                column: "error_kind",
                value: error_kind.clone(),
            })?;
            failures.push(FailureRecord {
                track_external_id,
                attempted_name,
                error_kind,
                message,
            });
        }
        Ok(failures)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &rusqlite::Connection {
        self.db.connection()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column: "created_at",
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::SnapshotStore;
    use crate::error::StoreError;
    use crate::protocol::{
        ArtistField, BackupSnapshot, FailureRecord, SnapshotEntry, WriteErrorKind,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn entry(id: &str) -> SnapshotEntry {
        SnapshotEntry {
            track_external_id: id.to_string(),
            localized_name: "イエス".to_string(),
            field: ArtistField::Artist,
            previous_artist_name: "イエス".to_string(),
            new_artist_name: "Yes".to_string(),
        }
    }

    fn snapshot(seconds: u32, entries: Vec<SnapshotEntry>) -> BackupSnapshot {
        let created_at = Utc
            .with_ymd_and_hms(2026, 3, 14, 9, 26, seconds)
            .single()
            .expect("valid timestamp");
        BackupSnapshot::new(created_at, entries)
    }

    #[test]
    fn test_saved_snapshot_loads_with_entry_order() {
        let mut store = SnapshotStore::open_in_memory().expect("store should open");
        let mut album_entry = entry("t1");
        album_entry.field = ArtistField::AlbumArtist;
        album_entry.previous_artist_name = "イエス ".to_string();
        let saved = snapshot(1, vec![entry("t3"), entry("t1"), album_entry, entry("t2")]);
        store.save_snapshot(&saved).expect("snapshot should save");

        let loaded = store.load_snapshot(&saved.id).expect("snapshot should load");
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_snapshot_with_sub_microsecond_clock_loads_equal() {
        let mut store = SnapshotStore::open_in_memory().expect("store should open");
        let created_at = Utc
            .with_ymd_and_hms(2026, 10, 19, 13, 51, 56)
            .single()
            .expect("valid timestamp")
            + Duration::nanoseconds(614_315_502);
        let saved = BackupSnapshot::new(created_at, vec![entry("t1")]);
        store.save_snapshot(&saved).expect("snapshot should save");

        let loaded = store.load_snapshot(&saved.id).expect("snapshot should load");
        assert_eq!(loaded, saved);
        let listing = store.list_snapshots().expect("list should load");
        assert_eq!(listing[0].created_at, saved.created_at);
    }

    #[test]
    fn test_unknown_snapshot_is_an_error() {
        let store = SnapshotStore::open_in_memory().expect("store should open");
        let result = store.load_snapshot("20260101T000000.000000Z");
        assert!(matches!(result, Err(StoreError::SnapshotNotFound(_))));
    }

    #[test]
    fn test_failed_entry_insert_leaves_no_partial_snapshot() {
        let mut store = SnapshotStore::open_in_memory().expect("store should open");
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_t2 BEFORE INSERT ON snapshot_entries
                 WHEN NEW.track_external_id = 't2'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .expect("trigger should install");

        let failing = snapshot(2, vec![entry("t1"), entry("t2")]);
        assert!(store.save_snapshot(&failing).is_err());
        assert!(store.list_snapshots().expect("list should load").is_empty());
    }

    #[test]
    fn test_failures_append_and_show_in_listing() {
        let mut store = SnapshotStore::open_in_memory().expect("store should open");
        let first = snapshot(3, vec![entry("t1"), entry("t2")]);
        let second = snapshot(4, vec![entry("t3")]);
        store.save_snapshot(&first).expect("snapshot should save");
        store.save_snapshot(&second).expect("snapshot should save");

        let failure = |id: &str| FailureRecord {
            track_external_id: id.to_string(),
            attempted_name: "Yes".to_string(),
            error_kind: WriteErrorKind::WriteRejected,
            message: "read-only".to_string(),
        };
        store
            .save_failures(&first.id, &[failure("t1")])
            .expect("failures should save");
        store
            .save_failures(&first.id, &[failure("t2")])
            .expect("failures should save");

        let failures = store.failures_for(&first.id).expect("failures should load");
        assert_eq!(failures, vec![failure("t1"), failure("t2")]);

        let listing = store.list_snapshots().expect("list should load");
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].id, first.id);
        assert_eq!(listing[0].entry_count, 2);
        assert_eq!(listing[0].failure_count, 2);
        assert_eq!(listing[1].failure_count, 0);
    }
}
