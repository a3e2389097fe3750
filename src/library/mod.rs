//! Media library abstractions and the tag-file implementation.

#[cfg(test)]
pub mod memory;
pub mod tag_library;

use std::collections::BTreeMap;

use crate::error::LibraryError;
use crate::protocol::{ArtistField, WriteErrorKind};

/// Distinct artist name in the library with its track count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistSummary {
    pub name: String,
    pub track_count: usize,
}

/// One track as seen by the library. Tag values are kept as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryTrack {
    /// Stable identifier used for writes and restores.
    pub external_id: String,
    pub artist: String,
    pub album_artist: Option<String>,
}

impl LibraryTrack {
    pub fn field_value(&self, field: ArtistField) -> Option<&str> {
        match field {
            ArtistField::Artist => Some(self.artist.as_str()),
            ArtistField::AlbumArtist => self.album_artist.as_deref(),
        }
    }

    /// Fields whose value, ignoring surrounding whitespace, equals `name`.
    pub fn fields_named(&self, name: &str) -> Vec<(ArtistField, &str)> {
        let name = name.trim();
        [ArtistField::Artist, ArtistField::AlbumArtist]
            .into_iter()
            .filter_map(|field| {
                let value = self.field_value(field)?;
                (!name.is_empty() && value.trim() == name).then_some((field, value))
            })
            .collect()
    }

    /// Trimmed, non-empty artist names on this track, without duplicates.
    pub fn artist_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(2);
        for value in [Some(self.artist.as_str()), self.album_artist.as_deref()]
            .into_iter()
            .flatten()
        {
            let trimmed = value.trim();
            if !trimmed.is_empty() && !names.contains(&trimmed) {
                names.push(trimmed);
            }
        }
        names
    }
}

/// Per-name track counts, sorted by name. A track counts once per name.
pub fn summarize_artists<'a>(
    tracks: impl IntoIterator<Item = &'a LibraryTrack>,
) -> Vec<ArtistSummary> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for track in tracks {
        for name in track.artist_names() {
            *counts.entry(name).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(name, track_count)| ArtistSummary {
            name: name.to_string(),
            track_count,
        })
        .collect()
}

/// Per-track write failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteFailure {
    pub fn new(kind: WriteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Read side of a media library.
pub trait LibraryReader {
    /// Names from both artist and album artist fields.
    fn list_artists(&self) -> Result<Vec<ArtistSummary>, LibraryError>;
    /// Tracks whose artist or album artist, trimmed, equals `artist_name`.
    fn tracks_by_artist(&self, artist_name: &str) -> Result<Vec<LibraryTrack>, LibraryError>;
}

/// Write side of a media library. Setting the current value again succeeds.
pub trait LibraryWriter {
    fn set_artist_name(&mut self, track_external_id: &str, new_name: &str)
        -> Result<(), WriteFailure>;

    fn set_album_artist_name(
        &mut self,
        track_external_id: &str,
        new_name: &str,
    ) -> Result<(), WriteFailure>;

    fn set_field(
        &mut self,
        track_external_id: &str,
        field: ArtistField,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        match field {
            ArtistField::Artist => self.set_artist_name(track_external_id, new_name),
            ArtistField::AlbumArtist => self.set_album_artist_name(track_external_id, new_name),
        }
    }
}

pub trait MediaLibrary: LibraryReader + LibraryWriter {}

impl<T: LibraryReader + LibraryWriter> MediaLibrary for T {}
