use std::path::Path;
use std::time::Duration;

use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::tag::Tag;
use thiserror::Error;

/// Tags read from one audio file. Absent or blank tags are `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unreadable container: {0}")]
    Lofty(#[from] LoftyError),
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction aborted: {0}")]
    Panicked(String),
}

pub trait TagReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Metadata, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyReader;

impl TagReader for LoftyReader {
    fn read(&self, path: &Path) -> Result<Metadata, MetadataError> {
        read_tags(path)
    }
}

pub fn read_tags(path: &Path) -> Result<Metadata, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = Metadata {
        duration_seconds: whole_seconds(properties.duration()),
        ..Metadata::default()
    };

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag_text(tag, &ItemKey::TrackTitle);
        info.album = tag_text(tag, &ItemKey::AlbumTitle);
        info.artist =
            tag_text(tag, &ItemKey::TrackArtist).or_else(|| tag_text(tag, &ItemKey::AlbumArtist));
    }

    Ok(info)
}

/// Rounds down; zero means the container did not report a length.
pub fn whole_seconds(duration: Duration) -> Option<u64> {
    match duration.as_secs() {
        0 => None,
        secs => Some(secs),
    }
}

fn tag_text(tag: &Tag, key: &ItemKey) -> Option<String> {
    tag.get_string(key).and_then(clean_text)
}

fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn whole_seconds_rounds_down() {
        assert_eq!(whole_seconds(Duration::from_millis(215_999)), Some(215));
        assert_eq!(whole_seconds(Duration::from_millis(1_000)), Some(1));
        assert_eq!(whole_seconds(Duration::from_millis(999)), None);
        assert_eq!(whole_seconds(Duration::ZERO), None);
    }

    #[test]
    fn clean_text_drops_blank_values() {
        assert_eq!(clean_text("  Hurricane "), Some("Hurricane".to_string()));
        assert_eq!(clean_text("Bob Dylan\0"), Some("Bob Dylan".to_string()));
        assert_eq!(clean_text("   "), None);
        assert_eq!(clean_text(""), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        fs::write(&path, b"this is definitely not a flac stream").unwrap();

        let err = LoftyReader.read(&path).unwrap_err();
        assert!(matches!(err, MetadataError::Lofty(_) | MetadataError::Io(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_tags(&dir.path().join("absent.mp3"));
        assert!(result.is_err());
    }
}
