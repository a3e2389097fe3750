//! Data model shared by the resolution and apply components.
//!
//! Records here are plain values: the name store owns resolution records, and
//! the apply engine owns the snapshots and failure records of its runs.

use chrono::{DateTime, SubsecRound, Utc};

use crate::matching;

/// Decision cached for one localized artist name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    MatchedIdentical,
    MatchedDifferent,
    NotFound,
    Pending,
}

impl ResolutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatchedIdentical => "matched_identical",
            Self::MatchedDifferent => "matched_different",
            Self::NotFound => "not_found",
            Self::Pending => "pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "matched_identical" => Some(Self::MatchedIdentical),
            "matched_different" => Some(Self::MatchedDifferent),
            "not_found" => Some(Self::NotFound),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn is_matched(self) -> bool {
        matches!(self, Self::MatchedIdentical | Self::MatchedDifferent)
    }
}

/// Provenance of a canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Registry,
    LlmAssist,
    Manual,
}

impl ResolutionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::LlmAssist => "llm_assist",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "registry" => Some(Self::Registry),
            "llm_assist" => Some(Self::LlmAssist),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Cached resolution for one distinct localized artist name.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ResolutionRecord {
    pub localized_name: String,
    pub status: ResolutionStatus,
    /// Present only for matched statuses.
    pub canonical_name: Option<String>,
    pub source: ResolutionSource,
    pub resolved_at: DateTime<Utc>,
    /// Registry identifier, absent for assisted and manual names.
    pub registry_id: Option<String>,
    /// Set on `not_found` records produced by exhausted lookup retries.
    pub transient_failure: bool,
}

impl ResolutionRecord {
    /// Builds a matched record, deciding identical vs different from the names.
    ///
    /// When the names only differ in ways normalization erases, the record is
    /// `matched_identical` and keeps the localized spelling as canonical name.
    pub fn matched(
        localized_name: impl Into<String>,
        canonical_name: impl Into<String>,
        source: ResolutionSource,
        registry_id: Option<String>,
    ) -> Self {
        let localized_name = localized_name.into();
        let canonical_name = canonical_name.into();
        let status = matching::classify(&localized_name, &canonical_name);
        let canonical_name = match status {
            ResolutionStatus::MatchedIdentical => localized_name.clone(),
            _ => canonical_name,
        };
        let registry_id = match source {
            ResolutionSource::Registry => registry_id,
            ResolutionSource::LlmAssist | ResolutionSource::Manual => None,
        };
        Self {
            localized_name,
            status,
            canonical_name: Some(canonical_name),
            source,
            resolved_at: Utc::now(),
            registry_id,
            transient_failure: false,
        }
    }

    pub fn not_found(localized_name: impl Into<String>, transient_failure: bool) -> Self {
        Self {
            localized_name: localized_name.into(),
            status: ResolutionStatus::NotFound,
            canonical_name: None,
            source: ResolutionSource::Registry,
            resolved_at: Utc::now(),
            registry_id: None,
            transient_failure,
        }
    }

    pub fn pending(localized_name: impl Into<String>) -> Self {
        Self {
            localized_name: localized_name.into(),
            status: ResolutionStatus::Pending,
            canonical_name: None,
            source: ResolutionSource::Registry,
            resolved_at: Utc::now(),
            registry_id: None,
            transient_failure: false,
        }
    }

    /// Whether the next resolution run should look this name up again.
    pub fn needs_lookup(&self) -> bool {
        match self.status {
            ResolutionStatus::Pending => true,
            ResolutionStatus::NotFound => self.transient_failure,
            ResolutionStatus::MatchedIdentical | ResolutionStatus::MatchedDifferent => false,
        }
    }

    /// Describes the first status/name invariant this record breaks, if any.
    pub fn invariant_violation(&self) -> Option<String> {
        if self.localized_name.trim().is_empty() {
            return Some("localized name is empty".to_string());
        }
        if self.transient_failure && self.status != ResolutionStatus::NotFound {
            return Some("transient flag set on a non not_found record".to_string());
        }
        match (self.status, self.canonical_name.as_deref()) {
            (ResolutionStatus::MatchedIdentical, Some(canonical))
                if canonical == self.localized_name =>
            {
                None
            }
            (ResolutionStatus::MatchedIdentical, _) => {
                Some("matched_identical requires canonical name == localized name".to_string())
            }
            (ResolutionStatus::MatchedDifferent, Some(canonical))
                if canonical != self.localized_name && !canonical.trim().is_empty() =>
            {
                None
            }
            (ResolutionStatus::MatchedDifferent, _) => Some(
                "matched_different requires a non-empty canonical name != localized name"
                    .to_string(),
            ),
            (ResolutionStatus::NotFound | ResolutionStatus::Pending, None) => None,
            (ResolutionStatus::NotFound | ResolutionStatus::Pending, Some(_)) => {
                Some(format!("{} must not carry a canonical name", self.status.as_str()))
            }
        }
    }
}

/// Reviewed rename proposal, derived from `matched_different` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCandidate {
    pub localized_name: String,
    pub canonical_name: String,
    pub track_count: usize,
}

/// Kind of a failed library write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteErrorKind {
    NotFoundInLibrary,
    WriteRejected,
    Timeout,
}

impl WriteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFoundInLibrary => "not_found_in_library",
            Self::WriteRejected => "write_rejected",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_found_in_library" => Some(Self::NotFoundInLibrary),
            "write_rejected" => Some(Self::WriteRejected),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Track tag field carrying an artist name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtistField {
    Artist,
    AlbumArtist,
}

impl ArtistField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Artist => "artist",
            Self::AlbumArtist => "album_artist",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "artist" => Some(Self::Artist),
            "album_artist" => Some(Self::AlbumArtist),
            _ => None,
        }
    }
}

/// One pre-mutation capture inside a backup snapshot: a single field of a
/// single track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub track_external_id: String,
    /// Localized artist name of the candidate this track was planned under.
    pub localized_name: String,
    pub field: ArtistField,
    /// Raw tag value, written back verbatim on restore.
    pub previous_artist_name: String,
    pub new_artist_name: String,
}

/// Immutable pre-mutation capture of every track touched by one apply run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSnapshot {
    /// Creation timestamp rendered as `YYYYMMDDTHHMMSS.ffffffZ`.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
}

impl BackupSnapshot {
    /// `created_at` is truncated to the microseconds kept in the id and store.
    pub fn new(created_at: DateTime<Utc>, entries: Vec<SnapshotEntry>) -> Self {
        let created_at = created_at.trunc_subsecs(6);
        Self {
            id: snapshot_id_for(created_at),
            created_at,
            entries,
        }
    }
}

pub fn snapshot_id_for(created_at: DateTime<Utc>) -> String {
    created_at.format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

/// Per-track failure accumulated during an apply or restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub track_external_id: String,
    pub attempted_name: String,
    pub error_kind: WriteErrorKind,
    pub message: String,
}

/// Listing row for stored snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
    pub failure_count: usize,
}
