//! Snapshot-then-mutate application of reviewed renames, and restore.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::error::ApplyError;
use crate::library::MediaLibrary;
use crate::protocol::{
    ApplyCandidate, ArtistField, BackupSnapshot, FailureRecord, SnapshotEntry, SnapshotSummary,
    WriteErrorKind,
};
use crate::snapshot_store::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Planning,
    Snapshotting,
    Mutating,
    Completed,
    CompletedWithFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Completed,
    CompletedWithFailures,
}

/// A track whose artist was rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTrack {
    pub track_external_id: String,
    pub localized_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<AppliedTrack>,
    pub failed: Vec<FailureRecord>,
    /// Localized names with no remaining tracks in the library.
    pub stale: Vec<String>,
    /// `None` when no track needed a change.
    pub snapshot: Option<BackupSnapshot>,
    pub outcome: ApplyOutcome,
    pub dry_run: bool,
    /// False when the failure records of this run could not be stored.
    pub failures_persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot_id: String,
    pub restored: Vec<String>,
    pub failed: Vec<FailureRecord>,
}

/// Applies rename candidates to a library behind a persisted backup.
pub struct ApplyEngine {
    snapshots: SnapshotStore,
    deadline: Option<Instant>,
}

impl ApplyEngine {
    pub fn new(snapshots: SnapshotStore) -> Self {
        Self {
            snapshots,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Renames every live track of each candidate to its canonical name.
    ///
    /// The snapshot is stored before the first write; if that fails nothing
    /// is touched. Per-track failures are collected, never fatal.
    pub fn apply(
        &mut self,
        library: &mut dyn MediaLibrary,
        candidates: &[ApplyCandidate],
        dry_run: bool,
    ) -> Result<ApplyReport, ApplyError> {
        enter_phase(ApplyPhase::Planning, dry_run);
        let mut entries = Vec::new();
        let mut stale = Vec::new();
        for candidate in candidates {
            let tracks = library.tracks_by_artist(&candidate.localized_name)?;
            if tracks.is_empty() {
                debug!(
                    "Apply[{}]: no live tracks, skipping as stale",
                    candidate.localized_name
                );
                stale.push(candidate.localized_name.clone());
                continue;
            }
            if tracks.len() != candidate.track_count {
                debug!(
                    "Apply[{}]: track count changed since review {} -> {}",
                    candidate.localized_name,
                    candidate.track_count,
                    tracks.len()
                );
            }
            for track in &tracks {
                for (field, previous) in track.fields_named(&candidate.localized_name) {
                    entries.push(SnapshotEntry {
                        track_external_id: track.external_id.clone(),
                        localized_name: candidate.localized_name.clone(),
                        field,
                        previous_artist_name: previous.to_string(),
                        new_artist_name: candidate.canonical_name.clone(),
                    });
                }
            }
        }

        if entries.is_empty() {
            info!("Apply: nothing to change, stale={}", stale.len());
            return Ok(ApplyReport {
                applied: Vec::new(),
                failed: Vec::new(),
                stale,
                snapshot: None,
                outcome: ApplyOutcome::Completed,
                dry_run,
                failures_persisted: true,
            });
        }

        enter_phase(ApplyPhase::Snapshotting, dry_run);
        let snapshot = BackupSnapshot::new(Utc::now(), entries);
        if dry_run {
            info!(
                "Apply: dry run planned {} field write(s) across {} candidate(s)",
                snapshot.entries.len(),
                candidates.len() - stale.len()
            );
            return Ok(ApplyReport {
                applied: Vec::new(),
                failed: Vec::new(),
                stale,
                snapshot: Some(snapshot),
                outcome: ApplyOutcome::Completed,
                dry_run,
                failures_persisted: true,
            });
        }
        if let Err(err) = self.snapshots.save_snapshot(&snapshot) {
            error!("Apply: snapshot could not be stored, aborting: {}", err);
            return Err(ApplyError::SnapshotPersistence(err));
        }
        info!(
            "Apply[{}]: snapshot stored with {} entries",
            snapshot.id,
            snapshot.entries.len()
        );

        enter_phase(ApplyPhase::Mutating, dry_run);
        let mut failed = Vec::new();
        for entry in &snapshot.entries {
            if let Err(failure) = self.write_field(
                library,
                &entry.track_external_id,
                entry.field,
                &entry.new_artist_name,
            ) {
                failed.push(failure);
            }
        }
        let applied = completed_tracks(&snapshot.entries, &failed)
            .map(|entry| AppliedTrack {
                track_external_id: entry.track_external_id.clone(),
                localized_name: entry.localized_name.clone(),
            })
            .collect::<Vec<_>>();

        let failures_persisted = match self.snapshots.save_failures(&snapshot.id, &failed) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Apply[{}]: failed to store {} failure record(s): {}",
                    snapshot.id,
                    failed.len(),
                    err
                );
                false
            }
        };

        let outcome = if failed.is_empty() {
            enter_phase(ApplyPhase::Completed, dry_run);
            ApplyOutcome::Completed
        } else {
            enter_phase(ApplyPhase::CompletedWithFailures, dry_run);
            ApplyOutcome::CompletedWithFailures
        };
        info!(
            "Apply[{}]: applied={} failed={} stale={}",
            snapshot.id,
            applied.len(),
            failed.len(),
            stale.len()
        );
        Ok(ApplyReport {
            applied,
            failed,
            stale,
            snapshot: Some(snapshot),
            outcome,
            dry_run,
            failures_persisted,
        })
    }

    /// Writes every previous artist name of a snapshot back to the library.
    ///
    /// The snapshot itself is left untouched, so restoring twice gives the
    /// same library state.
    pub fn restore(
        &mut self,
        library: &mut dyn MediaLibrary,
        snapshot_id: &str,
    ) -> Result<RestoreReport, ApplyError> {
        let snapshot = self.snapshots.load_snapshot(snapshot_id)?;
        info!(
            "Restore[{}]: restoring {} track(s)",
            snapshot.id,
            snapshot.entries.len()
        );

        let mut failed = Vec::new();
        for entry in &snapshot.entries {
            if let Err(failure) = self.write_field(
                library,
                &entry.track_external_id,
                entry.field,
                &entry.previous_artist_name,
            ) {
                failed.push(failure);
            }
        }
        let restored = completed_tracks(&snapshot.entries, &failed)
            .map(|entry| entry.track_external_id.clone())
            .collect::<Vec<_>>();
        info!(
            "Restore[{}]: restored={} failed={}",
            snapshot.id,
            restored.len(),
            failed.len()
        );
        Ok(RestoreReport {
            snapshot_id: snapshot.id,
            restored,
            failed,
        })
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>, ApplyError> {
        Ok(self.snapshots.list_snapshots()?)
    }

    pub fn load_snapshot(&self, snapshot_id: &str) -> Result<BackupSnapshot, ApplyError> {
        Ok(self.snapshots.load_snapshot(snapshot_id)?)
    }

    pub fn failures_for(&self, snapshot_id: &str) -> Result<Vec<FailureRecord>, ApplyError> {
        // Surfaces SnapshotNotFound for unknown ids instead of an empty list.
        self.snapshots.load_snapshot(snapshot_id)?;
        Ok(self.snapshots.failures_for(snapshot_id)?)
    }

    fn write_field(
        &self,
        library: &mut dyn MediaLibrary,
        track_external_id: &str,
        field: ArtistField,
        new_name: &str,
    ) -> Result<(), FailureRecord> {
        let failure = |error_kind: WriteErrorKind, message: String| FailureRecord {
            track_external_id: track_external_id.to_string(),
            attempted_name: new_name.to_string(),
            error_kind,
            message,
        };
        if self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(failure(
                WriteErrorKind::Timeout,
                "deadline reached before write".to_string(),
            ));
        }
        library
            .set_field(track_external_id, field, new_name)
            .map_err(|write_failure| {
                warn!(
                    "Apply[{}]: write of {}='{}' failed kind={} error={}",
                    track_external_id,
                    field.as_str(),
                    new_name,
                    write_failure.kind.as_str(),
                    write_failure.message
                );
                failure(write_failure.kind, write_failure.message)
            })
    }
}

/// First entry of every track whose field writes all succeeded, in entry order.
fn completed_tracks<'e>(
    entries: &'e [SnapshotEntry],
    failed: &[FailureRecord],
) -> impl Iterator<Item = &'e SnapshotEntry> {
    let failed_tracks: HashSet<String> = failed
        .iter()
        .map(|failure| failure.track_external_id.clone())
        .collect();
    let mut seen = HashSet::new();
    entries.iter().filter(move |&entry| {
        !failed_tracks.contains(&entry.track_external_id)
            && seen.insert(entry.track_external_id.as_str())
    })
}

fn enter_phase(phase: ApplyPhase, dry_run: bool) {
    info!("Apply: entering {:?} dry_run={}", phase, dry_run);
}

#[cfg(test)]
mod tests {
    use super::{ApplyEngine, ApplyOutcome};
    use crate::error::{ApplyError, StoreError};
    use crate::library::memory::InMemoryLibrary;
    use crate::protocol::{ApplyCandidate, ArtistField, WriteErrorKind};
    use crate::snapshot_store::SnapshotStore;
    use std::time::Instant;

    fn engine() -> ApplyEngine {
        ApplyEngine::new(SnapshotStore::open_in_memory().expect("store should open"))
    }

    fn candidate(localized_name: &str, canonical_name: &str, track_count: usize) -> ApplyCandidate {
        ApplyCandidate {
            localized_name: localized_name.to_string(),
            canonical_name: canonical_name.to_string(),
            track_count,
        }
    }

    #[test]
    fn test_apply_renames_all_tracks_behind_a_stored_snapshot() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 12, "yes");
        library.add_tracks("木村カエラ", 3, "kaela");
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 12)], false)
            .expect("apply should succeed");
        assert_eq!(report.outcome, ApplyOutcome::Completed);
        assert_eq!(report.applied.len(), 12);
        assert_eq!(library.write_calls, 12);
        assert!(report.failed.is_empty());
        assert!(report
            .applied
            .iter()
            .all(|track| track.localized_name == "イエス"));

        let snapshot = report.snapshot.expect("snapshot should be reported");
        assert_eq!(snapshot.entries.len(), 12);
        assert!(snapshot
            .entries
            .iter()
            .all(|entry| entry.previous_artist_name == "イエス" && entry.new_artist_name == "Yes"));
        assert_eq!(
            engine
                .load_snapshot(&snapshot.id)
                .expect("snapshot should load"),
            snapshot
        );
        assert_eq!(library.artist_of("yes-000"), Some("Yes"));
        assert_eq!(library.artist_of("kaela-000"), Some("木村カエラ"));
    }

    #[test]
    fn test_single_failed_write_is_recorded_and_restore_recovers_every_track() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 48, "yes");
        library.fail_next_write("yes-017");
        let original = library.snapshot_state();
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 48)], false)
            .expect("apply should succeed");
        assert_eq!(report.outcome, ApplyOutcome::CompletedWithFailures);
        assert_eq!(report.applied.len(), 47);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].track_external_id, "yes-017");
        assert_eq!(report.failed[0].error_kind, WriteErrorKind::WriteRejected);
        assert!(report.failures_persisted);
        assert_eq!(library.artist_of("yes-017"), Some("イエス"));

        let snapshot = report.snapshot.expect("snapshot should be reported");
        assert_eq!(snapshot.entries.len(), 48);
        let stored_failures = engine
            .failures_for(&snapshot.id)
            .expect("failures should load");
        assert_eq!(stored_failures, report.failed);

        let restore = engine
            .restore(&mut library, &snapshot.id)
            .expect("restore should succeed");
        assert_eq!(restore.restored.len(), 48);
        assert!(restore.failed.is_empty());
        assert_eq!(library.snapshot_state(), original);
    }

    #[test]
    fn test_restore_twice_yields_same_library_and_unchanged_snapshot() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 4, "yes");
        let original = library.snapshot_state();
        let mut engine = engine();
        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 4)], false)
            .expect("apply should succeed");
        let snapshot = report.snapshot.expect("snapshot should be reported");

        engine
            .restore(&mut library, &snapshot.id)
            .expect("first restore should succeed");
        let after_first = library.snapshot_state();
        engine
            .restore(&mut library, &snapshot.id)
            .expect("second restore should succeed");

        assert_eq!(after_first, original);
        assert_eq!(library.snapshot_state(), after_first);
        assert_eq!(
            engine
                .load_snapshot(&snapshot.id)
                .expect("snapshot should load"),
            snapshot
        );
    }

    #[test]
    fn test_dry_run_plans_without_writing_or_storing() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 12, "yes");
        let original = library.snapshot_state();
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 12)], true)
            .expect("dry run should succeed");
        assert!(report.dry_run);
        assert!(report.applied.is_empty());
        assert_eq!(
            report
                .snapshot
                .expect("planned snapshot should be reported")
                .entries
                .len(),
            12
        );
        assert_eq!(library.write_calls, 0);
        assert_eq!(library.snapshot_state(), original);
        assert!(engine
            .list_snapshots()
            .expect("listing should load")
            .is_empty());
    }

    #[test]
    fn test_candidates_without_live_tracks_are_stale_not_failures() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 2, "yes");
        let mut engine = engine();

        let report = engine
            .apply(
                &mut library,
                &[
                    candidate("ビートルズ", "The Beatles", 5),
                    candidate("イエス", "Yes", 2),
                ],
                false,
            )
            .expect("apply should succeed");
        assert_eq!(report.stale, vec!["ビートルズ".to_string()]);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.outcome, ApplyOutcome::Completed);

        let only_stale = engine
            .apply(&mut library, &[candidate("ビートルズ", "The Beatles", 5)], false)
            .expect("apply should succeed");
        assert!(only_stale.snapshot.is_none());
        assert_eq!(
            engine.list_snapshots().expect("listing should load").len(),
            1
        );
    }

    #[test]
    fn test_snapshot_persistence_failure_aborts_before_any_write() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 3, "yes");
        let original = library.snapshot_state();
        let mut engine = engine();
        engine
            .snapshots
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_entries BEFORE INSERT ON snapshot_entries
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .expect("trigger should install");

        let result = engine.apply(&mut library, &[candidate("イエス", "Yes", 3)], false);
        assert!(matches!(result, Err(ApplyError::SnapshotPersistence(_))));
        assert_eq!(library.write_calls, 0);
        assert_eq!(library.snapshot_state(), original);
        assert!(engine
            .list_snapshots()
            .expect("listing should load")
            .is_empty());
    }

    #[test]
    fn test_library_read_error_aborts_planning() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 3, "yes");
        library.set_unavailable(true);
        let mut engine = engine();

        let result = engine.apply(&mut library, &[candidate("イエス", "Yes", 3)], false);
        assert!(matches!(result, Err(ApplyError::Library(_))));
        assert_eq!(library.write_calls, 0);
    }

    #[test]
    fn test_expired_deadline_turns_writes_into_timeouts() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 3, "yes");
        let mut engine = engine().with_deadline(Instant::now());

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 3)], false)
            .expect("apply should succeed");
        assert_eq!(report.outcome, ApplyOutcome::CompletedWithFailures);
        assert_eq!(report.failed.len(), 3);
        assert!(report
            .failed
            .iter()
            .all(|failure| failure.error_kind == WriteErrorKind::Timeout));
        assert_eq!(library.write_calls, 0);
    }

    #[test]
    fn test_track_removed_after_planning_is_reported_not_found() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 2, "yes");
        library.fail_writes("yes-001", WriteErrorKind::NotFoundInLibrary);
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 2)], false)
            .expect("apply should succeed");
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed[0].error_kind, WriteErrorKind::NotFoundInLibrary);
    }

    #[test]
    fn test_restore_of_unknown_snapshot_is_an_error() {
        let mut library = InMemoryLibrary::new();
        let mut engine = engine();

        let result = engine.restore(&mut library, "20260101T000000.000000Z");
        assert!(matches!(
            result,
            Err(ApplyError::Store(StoreError::SnapshotNotFound(_)))
        ));
    }

    #[test]
    fn test_album_artist_fields_are_rewritten_and_restored_verbatim() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 2, "yes");
        library.add_tracks("ジョン・アンダーソン", 1, "jon");
        library.set_album_artist("yes-000", "イエス ");
        library.set_album_artist("jon-000", "イエス");
        let original = library.snapshot_state();
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 3)], false)
            .expect("apply should succeed");
        let snapshot = report.snapshot.expect("snapshot should be reported");
        let fields: Vec<(&str, ArtistField, &str)> = snapshot
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.track_external_id.as_str(),
                    entry.field,
                    entry.previous_artist_name.as_str(),
                )
            })
            .collect();
        assert_eq!(
            fields,
            vec![
                ("yes-000", ArtistField::Artist, "イエス"),
                ("yes-000", ArtistField::AlbumArtist, "イエス "),
                ("yes-001", ArtistField::Artist, "イエス"),
                ("jon-000", ArtistField::AlbumArtist, "イエス"),
            ]
        );
        assert_eq!(library.write_calls, 4);
        let applied: Vec<&str> = report
            .applied
            .iter()
            .map(|track| track.track_external_id.as_str())
            .collect();
        assert_eq!(applied, vec!["yes-000", "yes-001", "jon-000"]);
        assert_eq!(library.album_artist_of("yes-000"), Some("Yes"));
        assert_eq!(library.artist_of("jon-000"), Some("ジョン・アンダーソン"));
        assert_eq!(library.album_artist_of("jon-000"), Some("Yes"));
        assert_eq!(
            engine
                .load_snapshot(&snapshot.id)
                .expect("snapshot should load"),
            snapshot
        );

        let restore = engine
            .restore(&mut library, &snapshot.id)
            .expect("restore should succeed");
        assert_eq!(restore.restored, vec!["yes-000", "yes-001", "jon-000"]);
        assert_eq!(library.snapshot_state(), original);
    }

    #[test]
    fn test_track_with_one_failed_field_is_not_counted_as_applied() {
        let mut library = InMemoryLibrary::new();
        library.add_tracks("イエス", 2, "yes");
        library.set_album_artist("yes-000", "イエス");
        library.fail_next_write("yes-000");
        let mut engine = engine();

        let report = engine
            .apply(&mut library, &[candidate("イエス", "Yes", 2)], false)
            .expect("apply should succeed");
        assert_eq!(report.outcome, ApplyOutcome::CompletedWithFailures);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].track_external_id, "yes-001");
        assert_eq!(library.artist_of("yes-000"), Some("イエス"));
        assert_eq!(library.album_artist_of("yes-000"), Some("Yes"));
    }
}
