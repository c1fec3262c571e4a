use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Extensions (lowercase, without the dot) the scanner treats as audio.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "ogg", "wav", "aac", "wma"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Indexed,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Local,
    Fetched,
}

/// Cheap change-detection key for a file on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSignature {
    pub file_size: u64,
    pub modified_time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified_time: u64,
}

impl FileDescriptor {
    pub fn signature(&self) -> FileSignature {
        FileSignature {
            file_size: self.size,
            modified_time: self.modified_time,
        }
    }

    pub fn key(&self) -> String {
        path_key(&self.path)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub path: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<u64>,
    pub file_size: u64,
    pub modified_time: u64,
    pub indexed_at: Option<u64>,
    pub status: TrackStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub normalized_title: String,
    pub normalized_artist: String,
    pub normalized_album: String,
    pub source: TrackSource,
    #[serde(default)]
    pub removed_at: Option<u64>,
}

impl Track {
    pub fn new(path: impl Into<String>, title: impl Into<String>, source: TrackSource) -> Self {
        let path = path.into();
        let mut track = Self {
            id: stable_id(&path),
            path,
            title: String::new(),
            artist: None,
            album: None,
            duration_seconds: None,
            file_size: 0,
            modified_time: 0,
            indexed_at: None,
            status: TrackStatus::Indexed,
            last_error: None,
            normalized_title: String::new(),
            normalized_artist: String::new(),
            normalized_album: String::new(),
            source,
            removed_at: None,
        };
        track.set_tags(title.into(), None, None);
        track
    }

    /// Replaces the searchable text fields and recomputes their normalized copies.
    pub fn set_tags(&mut self, title: String, artist: Option<String>, album: Option<String>) {
        self.normalized_title = normalize(&title);
        self.normalized_artist = normalize(artist.as_deref().unwrap_or(""));
        self.normalized_album = normalize(album.as_deref().unwrap_or(""));
        self.title = title;
        self.artist = artist;
        self.album = album;
    }

    pub fn set_signature(&mut self, signature: FileSignature) {
        self.file_size = signature.file_size;
        self.modified_time = signature.modified_time;
    }

    pub fn signature(&self) -> FileSignature {
        FileSignature {
            file_size: self.file_size,
            modified_time: self.modified_time,
        }
    }

    pub fn is_live(&self) -> bool {
        self.removed_at.is_none()
    }

    /// Live and extracted successfully at least once.
    pub fn is_searchable(&self) -> bool {
        self.is_live() && self.indexed_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Incremental,
    Full,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub scanned: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    #[serde(default)]
    pub removed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexRun {
    pub id: u64,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub mode: IndexMode,
    pub cleanup: bool,
    pub interrupted: bool,
    pub counts: RunCounts,
}

pub fn normalize(value: &str) -> String {
    value.to_lowercase()
}

pub fn normalize_query(value: &str) -> String {
    normalize(value.trim())
}

/// Comparison form for case-insensitive matching. Unlike `normalize`, it
/// also equates characters whose case mappings expand, such as `ß` and `SS`.
pub fn fold_case(value: &str) -> String {
    value.to_uppercase().to_lowercase()
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown Track".to_string())
}

pub fn is_supported_audio(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

pub fn unix_millis(time: SystemTime) -> u64 {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    millis.min(u128::from(u64::MAX)) as u64
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
