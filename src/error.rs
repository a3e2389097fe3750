//! Error types shared by the resolution and apply pipeline.

use thiserror::Error;

/// Persistence failures for the name store and snapshot store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid resolution record for '{localized_name}': {reason}")]
    InvalidRecord {
        localized_name: String,
        reason: String,
    },

    #[error("Corrupt stored value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Unsupported legacy cache: {0}")]
    UnsupportedLegacyCache(String),
}

/// Failure reported by a registry lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Timeout, 5xx, rate limiting, or an unreadable payload. Worth retrying.
    #[error("Transient lookup failure: {0}")]
    Transient(String),

    /// The service refused the request. Not retried within the run.
    #[error("Lookup rejected: {0}")]
    Rejected(String),
}

/// Failure enumerating the live library.
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Library unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-aborting failures of a resolution run.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Failed to persist resolution record: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request pacing: {0}")]
    Pacing(String),
}

/// Run-aborting failures of an apply or restore run.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The backup could not be written, so no mutation was attempted.
    #[error("Snapshot could not be persisted, nothing was changed: {0}")]
    SnapshotPersistence(StoreError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures reading or writing assist exchange files.
#[derive(Error, Debug)]
pub enum AssistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No mappings found in {0}")]
    NoMappings(String),
}

/// Failures loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine a {0} directory")]
    MissingDirectory(&'static str),
}
