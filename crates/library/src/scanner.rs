use std::path::{Path, PathBuf};

use common::{is_supported_audio, unix_millis, FileDescriptor};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{LibraryError, Result};

/// Walks a library root and yields the audio files below it.
#[derive(Clone, Debug)]
pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            return Err(LibraryError::Configuration(format!(
                "library root {:?} does not exist",
                root
            )));
        }
        if !root.is_dir() {
            return Err(LibraryError::Configuration(format!(
                "library root {:?} is not a directory",
                root
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy; traversal order is unspecified and symlinks are not followed.
    pub fn files(&self) -> impl Iterator<Item = FileDescriptor> {
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping unreadable entry: {}", err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_supported_audio(entry.path()))
            .filter_map(|entry| {
                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!("Skipping {:?}: {}", entry.path(), err);
                        return None;
                    }
                };
                let modified_time = meta.modified().map(unix_millis).unwrap_or(0);
                Some(FileDescriptor {
                    path: entry.into_path(),
                    size: meta.len(),
                    modified_time,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn yields_only_supported_audio() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Artist").join("Album");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("01 Song.mp3"), b"abc").unwrap();
        fs::write(nested.join("02 Song.FLAC"), b"abcd").unwrap();
        fs::write(nested.join("cover.jpg"), b"img").unwrap();
        fs::write(dir.path().join("notes.txt"), b"txt").unwrap();

        let scanner = Scanner::new(dir.path()).unwrap();
        let mut files: Vec<_> = scanner.files().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, nested.join("01 Song.mp3"));
        assert_eq!(files[0].size, 3);
        assert_eq!(files[1].size, 4);
        assert!(files[0].modified_time > 0);
    }

    #[test]
    fn empty_root_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = Scanner::new(dir.path()).unwrap();
        assert_eq!(scanner.files().count(), 0);
    }

    #[test]
    fn missing_root_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scanner::new(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, LibraryError::Configuration(_)));
    }

    #[test]
    fn file_root_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.mp3");
        fs::write(&file, b"abc").unwrap();
        let err = Scanner::new(&file).unwrap_err();
        assert!(matches!(err, LibraryError::Configuration(_)));
    }
}
