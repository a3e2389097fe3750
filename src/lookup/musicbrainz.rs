//! MusicBrainz artist search over `ureq`.
//!
//! One `search` call is one HTTP request. Pacing and retries belong to the
//! resolution coordinator, so failures are only classified here.

use std::time::Duration;

use log::debug;
use serde::Deserialize;

use super::{LookupCandidate, LookupService};
use crate::config::LookupConfig;
use crate::error::LookupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpFailureKind {
    Timeout,
    RateLimited,
    Network,
    Hard,
}

#[derive(Debug, Deserialize)]
struct ArtistSearchResponse {
    #[serde(default)]
    artists: Vec<MbArtist>,
}

#[derive(Debug, Deserialize)]
struct MbArtist {
    id: String,
    name: String,
    #[serde(default)]
    score: u32,
    #[serde(default)]
    aliases: Vec<MbAlias>,
}

#[derive(Debug, Deserialize)]
struct MbAlias {
    name: String,
}

/// Artist search client for the MusicBrainz web service.
pub struct MusicBrainzLookup {
    http_client: ureq::Agent,
    base_url: String,
    user_agent: String,
    result_limit: u32,
}

impl MusicBrainzLookup {
    pub fn new(config: &LookupConfig) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.read_timeout_ms))
            .timeout_write(Duration::from_millis(config.read_timeout_ms))
            .build();
        Self {
            http_client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            result_limit: config.result_limit,
        }
    }

    fn search_url(&self, query: &str) -> String {
        let lucene_query = artist_query(query);
        format!(
            "{}/artist?query={}&limit={}&fmt=json",
            self.base_url,
            urlencoding::encode(&lucene_query),
            self.result_limit
        )
    }
}

impl LookupService for MusicBrainzLookup {
    fn search(&self, query: &str) -> Result<Vec<LookupCandidate>, LookupError> {
        let url = self.search_url(query);
        debug!("MusicBrainz: GET {}", url);
        let response = self
            .http_client
            .get(&url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", "application/json")
            .call()
            .map_err(|error| {
                let message = format!("Request failed: {error}");
                match classify_ureq_failure(&error) {
                    HttpFailureKind::Hard => LookupError::Rejected(message),
                    HttpFailureKind::Timeout
                    | HttpFailureKind::RateLimited
                    | HttpFailureKind::Network => LookupError::Transient(message),
                }
            })?;
        let body = response.into_string().map_err(|error| {
            LookupError::Transient(format!("Failed to read response: {error}"))
        })?;
        parse_search_payload(&body)
    }
}

/// Lucene query matching the name either as an alias or as the artist name.
fn artist_query(name: &str) -> String {
    let escaped = escape_lucene_phrase(name.trim());
    format!("alias:\"{escaped}\" OR artist:\"{escaped}\"")
}

fn escape_lucene_phrase(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn classify_status(code: u16) -> HttpFailureKind {
    match code {
        429 | 503 => HttpFailureKind::RateLimited,
        408 | 500..=599 => HttpFailureKind::Timeout,
        _ => HttpFailureKind::Hard,
    }
}

fn classify_ureq_failure(error: &ureq::Error) -> HttpFailureKind {
    match error {
        ureq::Error::Status(code, _) => classify_status(*code),
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            if lowered.contains("timed out") || lowered.contains("timeout") {
                HttpFailureKind::Timeout
            } else {
                HttpFailureKind::Network
            }
        }
    }
}

/// Turns a search response body into ranked candidates.
///
/// A body that is not the expected JSON is a transient failure: MusicBrainz
/// answers with HTML error pages while overloaded.
fn parse_search_payload(body: &str) -> Result<Vec<LookupCandidate>, LookupError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(LookupError::Transient("Empty response body".to_string()));
    }
    let parsed: ArtistSearchResponse = serde_json::from_str(trimmed).map_err(|error| {
        let snippet: String = trimmed.chars().take(120).collect();
        LookupError::Transient(format!("Invalid JSON response: {error}; prefix={snippet}"))
    })?;

    Ok(parsed
        .artists
        .into_iter()
        .filter(|artist| !artist.name.trim().is_empty())
        .map(|artist| LookupCandidate {
            primary_name: artist.name.trim().to_string(),
            aliases: artist
                .aliases
                .into_iter()
                .map(|alias| alias.name.trim().to_string())
                .filter(|alias| !alias.is_empty())
                .collect(),
            registry_id: artist.id,
            score: artist.score.min(100) as u8,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{
        artist_query, classify_status, parse_search_payload, HttpFailureKind, MusicBrainzLookup,
    };
    use crate::config::LookupConfig;
    use crate::error::LookupError;

    #[test]
    fn test_parse_search_payload_keeps_order_scores_and_aliases() {
        let body = r#"{
            "created": "2026-01-01T00:00:00.000Z",
            "count": 2,
            "artists": [
                {"id": "c1d4f2ba", "name": "Yes", "sort-name": "Yes", "score": 100,
                 "aliases": [{"name": "イエス", "sort-name": "イエス", "locale": "ja"}]},
                {"id": "0a1b", "name": "Yes Sir", "score": 61}
            ]
        }"#;
        let candidates = parse_search_payload(body).expect("payload should parse");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].primary_name, "Yes");
        assert_eq!(candidates[0].aliases, vec!["イエス".to_string()]);
        assert_eq!(candidates[0].registry_id, "c1d4f2ba");
        assert_eq!(candidates[0].score, 100);
        assert!(candidates[1].aliases.is_empty());
        assert_eq!(candidates[1].score, 61);
    }

    #[test]
    fn test_parse_search_payload_without_artists_is_empty() {
        let candidates = parse_search_payload(r#"{"count": 0}"#).expect("payload should parse");
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_parse_search_payload_treats_html_as_transient() {
        let result = parse_search_payload("<html><body>503</body></html>");
        assert!(matches!(result, Err(LookupError::Transient(_))));
        assert!(matches!(parse_search_payload("  "), Err(LookupError::Transient(_))));
    }

    #[test]
    fn test_artist_query_escapes_quotes() {
        assert_eq!(
            artist_query(" Say \"Hi\" "),
            "alias:\"Say \\\"Hi\\\"\" OR artist:\"Say \\\"Hi\\\"\""
        );
    }

    #[test]
    fn test_status_classification_separates_retryable_codes() {
        assert_eq!(classify_status(503), HttpFailureKind::RateLimited);
        assert_eq!(classify_status(429), HttpFailureKind::RateLimited);
        assert_eq!(classify_status(502), HttpFailureKind::Timeout);
        assert_eq!(classify_status(408), HttpFailureKind::Timeout);
        assert_eq!(classify_status(400), HttpFailureKind::Hard);
        assert_eq!(classify_status(404), HttpFailureKind::Hard);
    }

    #[test]
    fn test_every_server_error_is_retryable() {
        for code in 500..=599u16 {
            assert_ne!(
                classify_status(code),
                HttpFailureKind::Hard,
                "status {code} should be retryable"
            );
        }
        assert_eq!(classify_status(501), HttpFailureKind::Timeout);
        assert_eq!(classify_status(522), HttpFailureKind::Timeout);
    }

    #[test]
    fn test_search_url_encodes_query_and_limit() {
        let config = LookupConfig {
            base_url: "https://musicbrainz.org/ws/2/".to_string(),
            result_limit: 5,
            ..LookupConfig::default()
        };
        let lookup = MusicBrainzLookup::new(&config);
        let url = lookup.search_url("イエス");
        assert!(url.starts_with("https://musicbrainz.org/ws/2/artist?query=alias%3A%22"));
        assert!(url.ends_with("&limit=5&fmt=json"));
    }
}
