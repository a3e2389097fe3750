//! In-memory library used by apply and restore tests.

use std::collections::{HashMap, HashSet};

use super::{
    summarize_artists, ArtistSummary, LibraryReader, LibraryTrack, LibraryWriter, WriteFailure,
};
use crate::error::LibraryError;
use crate::protocol::{ArtistField, WriteErrorKind};

#[derive(Debug, Default)]
pub struct InMemoryLibrary {
    tracks: Vec<LibraryTrack>,
    failing_writes: HashMap<String, WriteErrorKind>,
    fail_once: HashSet<String>,
    unavailable: bool,
    pub write_calls: usize,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tracks(&mut self, artist: &str, count: usize, id_prefix: &str) {
        for index in 0..count {
            self.tracks.push(LibraryTrack {
                external_id: format!("{id_prefix}-{index:03}"),
                artist: artist.to_string(),
                album_artist: None,
            });
        }
    }

    pub fn set_album_artist(&mut self, track_external_id: &str, album_artist: &str) {
        if let Some(track) = self
            .tracks
            .iter_mut()
            .find(|track| track.external_id == track_external_id)
        {
            track.album_artist = Some(album_artist.to_string());
        }
    }

    /// Every write to `track_external_id` fails with `kind`.
    pub fn fail_writes(&mut self, track_external_id: &str, kind: WriteErrorKind) {
        self.failing_writes
            .insert(track_external_id.to_string(), kind);
    }

    /// The next write to `track_external_id` is rejected, later ones succeed.
    pub fn fail_next_write(&mut self, track_external_id: &str) {
        self.fail_once.insert(track_external_id.to_string());
    }

    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    pub fn artist_of(&self, track_external_id: &str) -> Option<&str> {
        self.track(track_external_id).map(|track| track.artist.as_str())
    }

    pub fn album_artist_of(&self, track_external_id: &str) -> Option<&str> {
        self.track(track_external_id)
            .and_then(|track| track.album_artist.as_deref())
    }

    pub fn snapshot_state(&self) -> Vec<LibraryTrack> {
        self.tracks.clone()
    }

    fn track(&self, track_external_id: &str) -> Option<&LibraryTrack> {
        self.tracks
            .iter()
            .find(|track| track.external_id == track_external_id)
    }

    fn ensure_available(&self) -> Result<(), LibraryError> {
        if self.unavailable {
            return Err(LibraryError::Unavailable("library offline".to_string()));
        }
        Ok(())
    }

    fn write(
        &mut self,
        track_external_id: &str,
        field: ArtistField,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        self.write_calls += 1;
        if let Some(kind) = self.failing_writes.get(track_external_id) {
            return Err(WriteFailure::new(*kind, "scripted failure"));
        }
        if self.fail_once.remove(track_external_id) {
            return Err(WriteFailure::new(
                WriteErrorKind::WriteRejected,
                "scripted one-time failure",
            ));
        }
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|track| track.external_id == track_external_id)
        else {
            return Err(WriteFailure::new(
                WriteErrorKind::NotFoundInLibrary,
                format!("unknown track {track_external_id}"),
            ));
        };
        match field {
            ArtistField::Artist => track.artist = new_name.to_string(),
            ArtistField::AlbumArtist => track.album_artist = Some(new_name.to_string()),
        }
        Ok(())
    }
}

impl LibraryReader for InMemoryLibrary {
    fn list_artists(&self) -> Result<Vec<ArtistSummary>, LibraryError> {
        self.ensure_available()?;
        Ok(summarize_artists(&self.tracks))
    }

    fn tracks_by_artist(&self, artist_name: &str) -> Result<Vec<LibraryTrack>, LibraryError> {
        self.ensure_available()?;
        Ok(self
            .tracks
            .iter()
            .filter(|track| !track.fields_named(artist_name).is_empty())
            .cloned()
            .collect())
    }
}

impl LibraryWriter for InMemoryLibrary {
    fn set_artist_name(
        &mut self,
        track_external_id: &str,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        self.write(track_external_id, ArtistField::Artist, new_name)
    }

    fn set_album_artist_name(
        &mut self,
        track_external_id: &str,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        self.write(track_external_id, ArtistField::AlbumArtist, new_name)
    }
}
