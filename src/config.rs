//! Persistent application configuration model and defaults.

/// Root configuration persisted to `artist-deloc.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Where the name store and snapshots live.
    pub storage: StorageConfig,
    #[serde(default)]
    /// Registry lookup pacing and retry behavior.
    pub lookup: LookupConfig,
    #[serde(default)]
    /// Local library folders.
    pub library: LibraryConfig,
    #[serde(default)]
    /// Assist export/import file locations.
    pub assist: AssistConfig,
}

/// Storage location preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StorageConfig {
    /// Data directory override. Empty means the platform data directory.
    #[serde(default)]
    pub data_dir: String,
}

/// Registry lookup settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LookupConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Minimum spacing between two registry requests.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
    /// Attempts per name before a transient failure is recorded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_result_limit")]
    pub result_limit: u32,
    /// Lowest registry score accepted without exact name evidence.
    #[serde(default = "default_min_score")]
    pub min_score: u8,
}

/// Library folder preferences.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    #[serde(default)]
    pub folders: Vec<String>,
}

/// Assist exchange file locations. Empty means inside the data directory.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AssistConfig {
    #[serde(default)]
    pub unresolved_path: String,
    #[serde(default)]
    pub mappings_path: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            request_interval_ms: default_request_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            result_limit: default_result_limit(),
            min_score: default_min_score(),
        }
    }
}

/// Clamps values that would break pacing or retry guarantees.
pub fn sanitize_config(mut config: Config) -> Config {
    let lookup = &mut config.lookup;
    lookup.request_interval_ms = lookup.request_interval_ms.max(MIN_REQUEST_INTERVAL_MS);
    lookup.max_attempts = lookup.max_attempts.clamp(1, 10);
    lookup.backoff_cap_ms = lookup.backoff_cap_ms.max(lookup.backoff_base_ms);
    lookup.connect_timeout_ms = lookup.connect_timeout_ms.max(500);
    lookup.read_timeout_ms = lookup.read_timeout_ms.max(500);
    lookup.result_limit = lookup.result_limit.clamp(1, 100);
    lookup.min_score = lookup.min_score.min(100);
    if lookup.base_url.trim().is_empty() {
        lookup.base_url = default_base_url();
    }
    if lookup.user_agent.trim().is_empty() {
        lookup.user_agent = default_user_agent();
    }
    config
        .library
        .folders
        .retain(|folder| !folder.trim().is_empty());
    config
}

/// MusicBrainz asks anonymous clients for at most one request per second.
const MIN_REQUEST_INTERVAL_MS: u64 = 1_000;

fn default_base_url() -> String {
    "https://musicbrainz.org/ws/2".to_string()
}

fn default_user_agent() -> String {
    format!(
        "artist-deloc/{} (https://github.com/artist-deloc/artist-deloc)",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_request_interval_ms() -> u64 {
    MIN_REQUEST_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    8_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_result_limit() -> u32 {
    5
}

fn default_min_score() -> u8 {
    crate::matching::DEFAULT_MIN_SCORE
}
