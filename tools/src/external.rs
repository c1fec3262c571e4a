use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use library::{
    FetchFailed, FetchRequest, FetchedAudio, MoodSuggester, SongDescriptor, SuggestionUnavailable,
    TrackFetcher,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct OllamaSuggester {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    limit: usize,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct RawSong {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    artist: Option<String>,
}

impl OllamaSuggester {
    pub fn new(
        client: Client,
        base_url: &str,
        model: &str,
        timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            limit,
        }
    }
}

#[async_trait]
impl MoodSuggester for OllamaSuggester {
    async fn suggest(&self, phrase: &str) -> Result<Vec<SongDescriptor>, SuggestionUnavailable> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: song_prompt(phrase, self.limit),
            stream: false,
            options: GenerateOptions {
                temperature: 0.7,
                num_predict: 500,
            },
        };
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| SuggestionUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SuggestionUnavailable(format!(
                "ollama responded with status {}",
                response.status()
            )));
        }
        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| SuggestionUnavailable(err.to_string()))?;
        let songs = parse_song_list(&payload.response)?;
        debug!("Ollama suggested {} songs for {:?}", songs.len(), phrase);
        Ok(songs)
    }
}

fn song_prompt(phrase: &str, limit: usize) -> String {
    format!(
        "You are a music expert helping curate a playlist.\n\n\
         MOOD: {phrase}\n\n\
         Suggest {limit} specific, well-known songs that match this mood.\n\
         Respond with only a JSON array like this:\n\
         [\n  {{\"title\": \"Song Name\", \"artist\": \"Artist Name\"}}\n]"
    )
}

/// Extracts the JSON song array from a model reply, ignoring code fences,
/// reasoning blocks and surrounding prose.
pub fn parse_song_list(text: &str) -> Result<Vec<SongDescriptor>, SuggestionUnavailable> {
    let text = match text.rfind("</think>") {
        Some(end) => &text[end + "</think>".len()..],
        None => text,
    };
    let start = text.find('[');
    let end = text.rfind(']');
    let array = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => {
            return Err(SuggestionUnavailable(
                "reply did not contain a song list".to_string(),
            ))
        }
    };
    let entries: Vec<serde_json::Value> = serde_json::from_str(array)
        .map_err(|err| SuggestionUnavailable(format!("unparseable song list: {}", err)))?;

    let songs = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<RawSong>(entry).ok())
        .filter_map(|raw| {
            let title = raw.title?.trim().to_string();
            if title.is_empty() {
                return None;
            }
            let artist = raw
                .artist
                .map(|artist| artist.trim().to_string())
                .filter(|artist| !artist.is_empty());
            Some(SongDescriptor { title, artist })
        })
        .collect();
    Ok(songs)
}

/// Downloads audio through a yt-dlp compatible command line tool.
#[derive(Clone, Debug)]
pub struct CommandFetcher {
    command: String,
    download_dir: PathBuf,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(command: &str, download_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            download_dir,
            timeout,
        }
    }
}

#[async_trait]
impl TrackFetcher for CommandFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedAudio, FetchFailed> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|err| FetchFailed::Remote(format!("{:?}: {}", self.download_dir, err)))?;

        let stem = download_stem(request);
        let template = self.download_dir.join(format!("{}.%(ext)s", stem));
        let query = match &request.artist {
            Some(artist) => format!("ytsearch1:{} {}", artist, request.title),
            None => format!("ytsearch1:{}", request.title),
        };

        let mut command = tokio::process::Command::new(&self.command);
        command
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--no-playlist")
            .arg("--quiet")
            .arg("--output")
            .arg(&template)
            .arg(&query)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(FetchFailed::Remote(format!(
                    "failed to run {}: {}",
                    self.command, err
                )))
            }
            Err(_) => return Err(FetchFailed::TimedOut(self.timeout)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchFailed::Remote(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let path = self.download_dir.join(format!("{}.mp3", stem));
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(FetchFailed::NotFound(request.title.clone()));
        }

        let tag_path = path.clone();
        let read = tokio::task::spawn_blocking(move || metadata::read_tags(&tag_path));
        let duration_seconds = match read.await {
            Ok(Ok(tags)) => tags.duration_seconds,
            Ok(Err(err)) => {
                warn!("Downloaded file {:?} has unreadable tags: {}", path, err);
                None
            }
            Err(_) => None,
        };

        Ok(FetchedAudio {
            path,
            title: Some(request.title.clone()),
            artist: request.artist.clone(),
            album: None,
            duration_seconds,
        })
    }
}

fn download_stem(request: &FetchRequest) -> String {
    let title = sanitize_file_name(&request.title);
    let stem = match request.artist.as_deref().map(sanitize_file_name) {
        Some(artist) if !artist.is_empty() => format!("{} - {}", artist, title),
        _ => title,
    };
    if stem.trim().is_empty() {
        "download".to_string()
    } else {
        stem
    }
}

fn sanitize_file_name(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}
