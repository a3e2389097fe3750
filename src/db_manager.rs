//! SQLite connection ownership and schema management.

use std::path::Path;

use rusqlite::Connection;

use crate::error::StoreError;

const SCHEMA_VERSION: i32 = 2;

/// Owns one SQLite connection with the pipeline schema applied.
pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::from_connection(Connection::open(path)?)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        // FULL makes every committed statement durable before it returns.
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = FULL;",
        )?;
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        db_manager.migrate()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS resolution_records (
                localized_name TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                canonical_name TEXT,
                source TEXT NOT NULL,
                resolved_at TEXT NOT NULL,
                registry_id TEXT
            );
            CREATE TABLE IF NOT EXISTS backup_snapshots (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS snapshot_entries (
                snapshot_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                track_external_id TEXT NOT NULL,
                localized_name TEXT NOT NULL,
                previous_artist_name TEXT NOT NULL,
                new_artist_name TEXT NOT NULL,
                PRIMARY KEY(snapshot_id, position),
                FOREIGN KEY(snapshot_id) REFERENCES backup_snapshots(id)
            );
            CREATE TABLE IF NOT EXISTS apply_failures (
                snapshot_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                track_external_id TEXT NOT NULL,
                attempted_name TEXT NOT NULL,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                PRIMARY KEY(snapshot_id, position),
                FOREIGN KEY(snapshot_id) REFERENCES backup_snapshots(id)
            );",
        )
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1 separated transient lookup failures from confident misses.
        if !self.has_column("resolution_records", "transient_failure")? {
            self.conn.execute(
                "ALTER TABLE resolution_records ADD COLUMN transient_failure INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }
        // Version 2 backs up album artist fields next to track artists.
        if !self.has_column("snapshot_entries", "field")? {
            self.conn.execute(
                "ALTER TABLE snapshot_entries ADD COLUMN field TEXT NOT NULL DEFAULT 'artist'",
                [],
            )?;
        }

        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for existing in columns {
            if existing? == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
