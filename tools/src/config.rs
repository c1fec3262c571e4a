use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_results: usize,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1".to_string(),
            timeout_secs: 30,
            max_results: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub enabled: bool,
    pub command: String,
    pub timeout_secs: u64,
    /// How long a caller waits before the fetch continues in the background.
    pub wait_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "yt-dlp".to_string(),
            timeout_secs: 300,
            wait_secs: 120,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JukeboxConfig {
    pub version: u32,
    pub music_root: String,
    pub index_path: String,
    pub download_dir: String,
    /// Zero means one worker per CPU.
    pub index_workers: usize,
    pub extract_timeout_secs: u64,
    pub cleanup: bool,
    pub search_limit: usize,
    pub suggestions: SuggestionConfig,
    pub fetch: FetchConfig,
}

impl Default for JukeboxConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            index_path: "jukebox.redb".to_string(),
            download_dir: "downloads".to_string(),
            index_workers: 0,
            extract_timeout_secs: 30,
            cleanup: true,
            search_limit: library::DEFAULT_SEARCH_LIMIT,
            suggestions: SuggestionConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("JUKEBOX_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Returns the config and whether it was just created with defaults.
pub fn load_or_create_config(path: &Path) -> Result<(JukeboxConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: JukeboxConfig = serde_yaml::from_str(&contents)?;
        let defaults = JukeboxConfig::default();
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = defaults.index_path;
        }
        if config.download_dir.trim().is_empty() {
            config.download_dir = defaults.download_dir;
        }
        if config.extract_timeout_secs == 0 {
            config.extract_timeout_secs = defaults.extract_timeout_secs;
        }
        if config.search_limit == 0 {
            config.search_limit = defaults.search_limit;
        }
        if config.suggestions.timeout_secs == 0 {
            config.suggestions.timeout_secs = defaults.suggestions.timeout_secs;
        }
        if config.fetch.timeout_secs == 0 {
            config.fetch.timeout_secs = defaults.fetch.timeout_secs;
        }
        return Ok((config, false));
    }

    let config = JukeboxConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &JukeboxConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.yaml");

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config, JukeboxConfig::default());
        assert!(path.exists());

        let (reloaded, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded, config);
    }

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 0\nmusic_root: /srv/music\nindex_path: ''\nsuggestions:\n  model: mistral\n",
        )
        .unwrap();

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.music_root, "/srv/music");
        assert_eq!(config.index_path, "jukebox.redb");
        assert_eq!(config.suggestions.model, "mistral");
        assert_eq!(config.suggestions.base_url, "http://127.0.0.1:11434");
        assert!(config.cleanup);
        assert!(!config.fetch.enabled);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "cleanup: [not, a, bool").unwrap();
        let err = load_or_create_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert!(err.to_string().starts_with("yaml error: "));
    }

    #[test]
    fn unwritable_location_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let err = load_or_create_config(&blocker.join("config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
        assert!(err.to_string().starts_with("io error: "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let config_path = Path::new("/etc/jukebox/config.yaml");
        assert_eq!(
            resolve_path(config_path, "jukebox.redb"),
            PathBuf::from("/etc/jukebox/jukebox.redb")
        );
        assert_eq!(resolve_path(config_path, "/var/music"), PathBuf::from("/var/music"));
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "data"),
            PathBuf::from("./data")
        );
        assert_eq!(resolve_music_root(config_path, "   "), None);
    }
}
