//! Library of local audio files whose artist lives in embedded tags (`lofty`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::read_from_path;
use lofty::tag::{ItemKey, Tag};
use log::{debug, info};

use super::{
    summarize_artists, ArtistSummary, LibraryReader, LibraryTrack, LibraryWriter, WriteFailure,
};
use crate::error::LibraryError;
use crate::protocol::{ArtistField, WriteErrorKind};

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 8] =
    ["mp3", "wav", "ogg", "flac", "aac", "m4a", "mp4", "opus"];

pub fn is_supported_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Recursively collects supported audio files below `folder_path`, sorted.
pub fn collect_audio_files_from_folder(folder_path: &Path) -> Vec<PathBuf> {
    let mut pending_directories = vec![folder_path.to_path_buf()];
    let mut tracks = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Failed to read directory {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                debug!("Failed to inspect {}", path.display());
                continue;
            };
            if file_type.is_dir() {
                pending_directories.push(path);
            } else if file_type.is_file() && is_supported_audio_file(&path) {
                tracks.push(path);
            }
        }
    }

    tracks.sort_unstable();
    tracks
}

fn non_blank(value: &str) -> Option<String> {
    (!value.trim().is_empty()).then(|| value.to_string())
}

/// Artist and album artist as stored, primary tag first and then the others.
///
/// Files without a non-blank artist are not part of the library.
fn read_track_tags(path: &Path, external_id: &str) -> Option<LibraryTrack> {
    let tagged_file = read_from_path(path).ok()?;
    let tags = tagged_file
        .primary_tag()
        .into_iter()
        .chain(tagged_file.tags().iter());
    let mut artist = None;
    let mut album_artist = None;
    for tag in tags {
        if artist.is_none() {
            artist = tag.artist().and_then(|value| non_blank(&value));
        }
        if album_artist.is_none() {
            album_artist = tag.get_string(ItemKey::AlbumArtist).and_then(non_blank);
        }
    }
    Some(LibraryTrack {
        external_id: external_id.to_string(),
        artist: artist?,
        album_artist,
    })
}

/// Tag-file library rooted at one or more folders.
///
/// Folders are scanned once on open; writes keep the in-memory index in step
/// with the files.
pub struct TagFileLibrary {
    tracks: BTreeMap<String, LibraryTrack>,
}

impl TagFileLibrary {
    pub fn open(folders: &[PathBuf]) -> Result<Self, LibraryError> {
        if folders.is_empty() {
            return Err(LibraryError::Unavailable(
                "no library folders configured".to_string(),
            ));
        }

        let mut tracks = BTreeMap::new();
        let mut untagged = 0usize;
        for folder in folders {
            if !folder.is_dir() {
                return Err(LibraryError::Unavailable(format!(
                    "library folder is not a directory: {}",
                    folder.display()
                )));
            }
            for path in collect_audio_files_from_folder(folder) {
                let external_id = path.to_string_lossy().into_owned();
                match read_track_tags(&path, &external_id) {
                    Some(track) => {
                        tracks.insert(external_id, track);
                    }
                    None => untagged += 1,
                }
            }
        }
        info!(
            "Library: scanned {} folder(s) tracks={} without_artist={}",
            folders.len(),
            tracks.len(),
            untagged
        );
        Ok(Self { tracks })
    }

    fn write_field(
        &mut self,
        track_external_id: &str,
        field: ArtistField,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        let path = Path::new(track_external_id);
        if !path.is_file() {
            return Err(WriteFailure::new(
                WriteErrorKind::NotFoundInLibrary,
                format!("File no longer exists: {}", path.display()),
            ));
        }

        let mut tagged_file = read_from_path(path).map_err(|error| {
            WriteFailure::new(
                WriteErrorKind::WriteRejected,
                format!("Failed to read tags: {error}"),
            )
        })?;
        let tag_type = tagged_file.primary_tag_type();
        if tagged_file.tag(tag_type).is_none() {
            tagged_file.insert_tag(Tag::new(tag_type));
        }
        let tag = tagged_file.tag_mut(tag_type).ok_or_else(|| {
            WriteFailure::new(
                WriteErrorKind::WriteRejected,
                format!("No writable tag available for {:?}", tag_type),
            )
        })?;
        match field {
            ArtistField::Artist => tag.set_artist(new_name.to_string()),
            ArtistField::AlbumArtist => {
                tag.remove_key(ItemKey::AlbumArtist);
                tag.insert_text(ItemKey::AlbumArtist, new_name.to_string());
            }
        }
        tagged_file
            .save_to_path(path, WriteOptions::default())
            .map_err(|error| {
                WriteFailure::new(
                    WriteErrorKind::WriteRejected,
                    format!("Failed to write tags: {error}"),
                )
            })?;

        match read_track_tags(path, track_external_id) {
            Some(track) => {
                self.tracks.insert(track_external_id.to_string(), track);
            }
            None => {
                debug!(
                    "Library: {} has no artist after writing {}",
                    track_external_id,
                    field.as_str()
                );
                self.tracks.remove(track_external_id);
            }
        }
        Ok(())
    }
}

impl LibraryReader for TagFileLibrary {
    fn list_artists(&self) -> Result<Vec<ArtistSummary>, LibraryError> {
        Ok(summarize_artists(self.tracks.values()))
    }

    fn tracks_by_artist(&self, artist_name: &str) -> Result<Vec<LibraryTrack>, LibraryError> {
        Ok(self
            .tracks
            .values()
            .filter(|track| !track.fields_named(artist_name).is_empty())
            .cloned()
            .collect())
    }
}

impl LibraryWriter for TagFileLibrary {
    fn set_artist_name(
        &mut self,
        track_external_id: &str,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        self.write_field(track_external_id, ArtistField::Artist, new_name)
    }

    fn set_album_artist_name(
        &mut self,
        track_external_id: &str,
        new_name: &str,
    ) -> Result<(), WriteFailure> {
        self.write_field(track_external_id, ArtistField::AlbumArtist, new_name)
    }
}
