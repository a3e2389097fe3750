//! Registry lookup abstractions and the MusicBrainz implementation.

pub mod musicbrainz;

use crate::error::LookupError;

/// Registry record returned by a lookup, in the service's ranking order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupCandidate {
    /// Authoritative name of the artist.
    pub primary_name: String,
    /// Alternative spellings, including storefront transliterations.
    pub aliases: Vec<String>,
    pub registry_id: String,
    /// Relevance score reported by the service, 0-100.
    pub score: u8,
}

/// Interface implemented by authoritative-name registries.
///
/// Callers own pacing: implementations issue exactly one request per call and
/// never retry on their own.
pub trait LookupService {
    fn search(&self, query: &str) -> Result<Vec<LookupCandidate>, LookupError>;
}
