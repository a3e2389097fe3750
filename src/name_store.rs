//! Durable cache of resolution records keyed by localized artist name.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::{params, OptionalExtension, Row};
use serde::Deserialize;

use crate::db_manager::DbManager;
use crate::error::StoreError;
use crate::protocol::{ApplyCandidate, ResolutionRecord, ResolutionSource, ResolutionStatus};

const RECORD_COLUMNS: &str =
    "localized_name, status, canonical_name, source, resolved_at, registry_id, transient_failure";

const LEGACY_CACHE_VERSION: &str = "1.0";

/// Number of stored records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub matched_identical: usize,
    pub matched_different: usize,
    pub not_found: usize,
    /// Subset of `not_found` caused by exhausted lookup retries.
    pub transient: usize,
    pub pending: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.matched_identical + self.matched_different + self.not_found + self.pending
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegacyImportSummary {
    pub imported: usize,
    /// Entries ignored because the store already holds a record for the name.
    pub already_present: usize,
    /// Entries that could not be turned into a valid record.
    pub invalid: usize,
}

#[derive(Debug, Deserialize)]
struct LegacyCacheFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    entries: HashMap<String, LegacyCacheEntry>,
}

#[derive(Debug, Deserialize)]
struct LegacyCacheEntry {
    action: String,
    #[serde(default)]
    musicbrainz_name: Option<String>,
    #[serde(default)]
    mbid: Option<String>,
    #[serde(default)]
    checked_at: Option<String>,
}

struct RawRecord {
    localized_name: String,
    status: String,
    canonical_name: Option<String>,
    source: String,
    resolved_at: String,
    registry_id: Option<String>,
    transient_failure: bool,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            localized_name: row.get(0)?,
            status: row.get(1)?,
            canonical_name: row.get(2)?,
            source: row.get(3)?,
            resolved_at: row.get(4)?,
            registry_id: row.get(5)?,
            transient_failure: row.get::<_, i64>(6)? != 0,
        })
    }

    fn into_record(self) -> Result<ResolutionRecord, StoreError> {
        let status = ResolutionStatus::parse(&self.status).ok_or(StoreError::Corrupt {
            column: "status",
            value: self.status.clone(),
        })?;
        let source = ResolutionSource::parse(&self.source).ok_or(StoreError::Corrupt {
            column: "source",
            value: self.source.clone(),
        })?;
        let resolved_at = DateTime::parse_from_rfc3339(&self.resolved_at)
            .map_err(|_| StoreError::Corrupt {
                column: "resolved_at",
                value: self.resolved_at.clone(),
            })?
            .with_timezone(&Utc);
        Ok(ResolutionRecord {
            localized_name: self.localized_name,
            status,
            canonical_name: self.canonical_name,
            source,
            resolved_at,
            registry_id: self.registry_id,
            transient_failure: self.transient_failure,
        })
    }
}

/// SQLite-backed cache of resolution records.
///
/// Every write is a single autocommit statement, so a record is either fully
/// stored or absent, and a stored record survives a crash.
pub struct NameStore {
    db: DbManager,
}

impl NameStore {
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

    pub fn get(&self, localized_name: &str) -> Result<Option<ResolutionRecord>, StoreError> {
        let raw = self
            .db
            .connection()
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM resolution_records WHERE localized_name = ?1"),
                params![localized_name],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Inserts or replaces the record for its localized name.
    pub fn put(&self, record: &ResolutionRecord) -> Result<(), StoreError> {
        if let Some(reason) = record.invariant_violation() {
            return Err(StoreError::InvalidRecord {
                localized_name: record.localized_name.clone(),
                reason,
            });
        }
        self.db.connection().execute(
            "INSERT INTO resolution_records
                (localized_name, status, canonical_name, source, resolved_at, registry_id, transient_failure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(localized_name) DO UPDATE SET
                status = excluded.status,
                canonical_name = excluded.canonical_name,
                source = excluded.source,
                resolved_at = excluded.resolved_at,
                registry_id = excluded.registry_id,
                transient_failure = excluded.transient_failure",
            params![
                record.localized_name,
                record.status.as_str(),
                record.canonical_name,
                record.source.as_str(),
                record
                    .resolved_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
                record.registry_id,
                record.transient_failure as i64,
            ],
        )?;
        debug!(
            "NameStore[{}]: stored status={} source={}",
            record.localized_name,
            record.status.as_str(),
            record.source.as_str()
        );
        Ok(())
    }

    /// All records, ordered by localized name.
    pub fn all(&self) -> Result<Vec<ResolutionRecord>, StoreError> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM resolution_records ORDER BY localized_name ASC"),
            &[],
        )
    }

    pub fn remove(&self, localized_name: &str) -> Result<bool, StoreError> {
        let removed = self.db.connection().execute(
            "DELETE FROM resolution_records WHERE localized_name = ?1",
            params![localized_name],
        )?;
        Ok(removed > 0)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        Ok(self
            .db
            .connection()
            .execute("DELETE FROM resolution_records", [])?)
    }

    /// Every `not_found` record, transient or not.
    pub fn unresolved(&self) -> Result<Vec<ResolutionRecord>, StoreError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM resolution_records WHERE status = ?1 ORDER BY localized_name ASC"
            ),
            &[&ResolutionStatus::NotFound.as_str()],
        )
    }

    /// Rename proposals for names that still appear in the library.
    ///
    /// `live_counts` maps a library artist name to its track count. Records
    /// whose name is absent or has no tracks are not surfaced.
    pub fn apply_candidates(
        &self,
        live_counts: &HashMap<String, usize>,
    ) -> Result<Vec<ApplyCandidate>, StoreError> {
        let records = self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM resolution_records WHERE status = ?1 ORDER BY localized_name ASC"
            ),
            &[&ResolutionStatus::MatchedDifferent.as_str()],
        )?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let track_count = live_counts
                    .get(&record.localized_name)
                    .copied()
                    .unwrap_or(0);
                if track_count == 0 {
                    return None;
                }
                let canonical_name = record.canonical_name?;
                Some(ApplyCandidate {
                    localized_name: record.localized_name,
                    canonical_name,
                    track_count,
                })
            })
            .collect())
    }

    pub fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut stmt = self.db.connection().prepare(
            "SELECT status, transient_failure, COUNT(*) FROM resolution_records GROUP BY status, transient_failure",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? != 0,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, transient, count) = row?;
            let count = count.max(0) as usize;
            match ResolutionStatus::parse(&status) {
                Some(ResolutionStatus::MatchedIdentical) => counts.matched_identical += count,
                Some(ResolutionStatus::MatchedDifferent) => counts.matched_different += count,
                Some(ResolutionStatus::NotFound) => {
                    counts.not_found += count;
                    if transient {
                        counts.transient += count;
                    }
                }
                Some(ResolutionStatus::Pending) => counts.pending += count,
                None => {
                    return Err(StoreError::Corrupt {
                        column: "status",
                        value: status,
                    })
                }
            }
        }
        Ok(counts)
    }

    /// Ingests a JSON cache written by the earlier script-based tool.
    ///
    /// Names that already have a record keep it. `convert` and `skip`
    /// entries are reclassified from their names, `manual` keeps its
    /// provenance, and `not_found` stays a confident miss.
    pub fn import_legacy_cache(&self, path: &Path) -> Result<LegacyImportSummary, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let cache: LegacyCacheFile = serde_json::from_str(&content)?;
        match cache.version.as_deref() {
            Some(LEGACY_CACHE_VERSION) => {}
            other => {
                return Err(StoreError::UnsupportedLegacyCache(format!(
                    "{} has version {:?}, expected {}",
                    path.display(),
                    other,
                    LEGACY_CACHE_VERSION
                )))
            }
        }

        let mut names: Vec<&String> = cache.entries.keys().collect();
        names.sort();

        let mut summary = LegacyImportSummary::default();
        for name in names {
            let entry = &cache.entries[name];
            let localized_name = name.trim();
            if self.get(localized_name)?.is_some() {
                summary.already_present += 1;
                continue;
            }
            let Some(mut record) = legacy_entry_to_record(localized_name, entry) else {
                warn!(
                    "NameStore[{}]: skipping legacy entry action={}",
                    localized_name, entry.action
                );
                summary.invalid += 1;
                continue;
            };
            if let Some(checked_at) = entry.checked_at.as_deref().and_then(parse_legacy_timestamp)
            {
                record.resolved_at = checked_at;
            }
            match self.put(&record) {
                Ok(()) => summary.imported += 1,
                Err(StoreError::InvalidRecord { reason, .. }) => {
                    warn!(
                        "NameStore[{}]: legacy entry rejected: {}",
                        localized_name, reason
                    );
                    summary.invalid += 1;
                }
                Err(err) => return Err(err),
            }
        }
        info!(
            "NameStore: legacy import from {} imported={} already_present={} invalid={}",
            path.display(),
            summary.imported,
            summary.already_present,
            summary.invalid
        );
        Ok(summary)
    }

    fn query_records(
        &self,
        sql: &str,
        query_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ResolutionRecord>, StoreError> {
        let mut stmt = self.db.connection().prepare(sql)?;
        let raw_iter = stmt.query_map(query_params, RawRecord::from_row)?;
        let mut records = Vec::new();
        for raw in raw_iter {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }
}

fn legacy_entry_to_record(localized_name: &str, entry: &LegacyCacheEntry) -> Option<ResolutionRecord> {
    if localized_name.is_empty() {
        return None;
    }
    let musicbrainz_name = entry
        .musicbrainz_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty());
    match entry.action.as_str() {
        "convert" => Some(ResolutionRecord::matched(
            localized_name,
            musicbrainz_name?,
            ResolutionSource::Registry,
            entry.mbid.clone(),
        )),
        "skip" => Some(ResolutionRecord::matched(
            localized_name,
            musicbrainz_name.unwrap_or(localized_name),
            ResolutionSource::Registry,
            entry.mbid.clone(),
        )),
        "manual" => Some(ResolutionRecord::matched(
            localized_name,
            musicbrainz_name?,
            ResolutionSource::Manual,
            None,
        )),
        "not_found" => Some(ResolutionRecord::not_found(localized_name, false)),
        _ => None,
    }
}

/// Legacy timestamps are naive local ISO-8601 strings.
fn parse_legacy_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
