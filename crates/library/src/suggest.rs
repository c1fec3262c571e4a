use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Track;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::search::{SearchEngine, SearchScope};

pub const DEFAULT_MAX_SUGGESTIONS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongDescriptor {
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("suggestion service unavailable: {0}")]
pub struct SuggestionUnavailable(pub String);

#[async_trait]
pub trait MoodSuggester: Send + Sync {
    async fn suggest(&self, phrase: &str) -> Result<Vec<SongDescriptor>, SuggestionUnavailable>;
}

/// Turns a mood phrase into tracks that exist in the local index.
#[derive(Clone)]
pub struct SuggestionExpander {
    search: SearchEngine,
    suggester: Arc<dyn MoodSuggester>,
    timeout: Duration,
    max_results: usize,
}

impl SuggestionExpander {
    pub fn new(search: SearchEngine, suggester: Arc<dyn MoodSuggester>, timeout: Duration) -> Self {
        Self {
            search,
            suggester,
            timeout,
            max_results: DEFAULT_MAX_SUGGESTIONS,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub async fn suggest_by_mood(&self, phrase: &str) -> Vec<Track> {
        let phrase = phrase.trim();
        if phrase.is_empty() || self.max_results == 0 {
            return Vec::new();
        }

        let request = self.suggester.suggest(phrase);
        let descriptors = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(descriptors)) => descriptors,
            Ok(Err(err)) => {
                warn!("No suggestions for {:?}: {}", phrase, err);
                return Vec::new();
            }
            Err(_) => {
                warn!("Suggestions for {:?} timed out after {:?}", phrase, self.timeout);
                return Vec::new();
            }
        };
        debug!("{} descriptors for {:?}", descriptors.len(), phrase);

        let mut seen = HashSet::new();
        let mut tracks = Vec::new();
        for descriptor in descriptors {
            // Only the best-ranked local match stands in for a suggestion.
            let hits = self.search.search(&descriptor.title, SearchScope::All, 1);
            let Some(track) = hits.into_iter().next() else {
                debug!("No local match for suggestion {:?}", descriptor.title);
                continue;
            };
            if seen.insert(track.path.clone()) {
                tracks.push(track);
                if tracks.len() >= self.max_results {
                    break;
                }
            }
        }
        tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexStore;
    use common::TrackSource;

    struct FixedSuggester(Vec<SongDescriptor>);

    #[async_trait]
    impl MoodSuggester for FixedSuggester {
        async fn suggest(
            &self,
            _phrase: &str,
        ) -> Result<Vec<SongDescriptor>, SuggestionUnavailable> {
            Ok(self.0.clone())
        }
    }

    struct OfflineSuggester;

    #[async_trait]
    impl MoodSuggester for OfflineSuggester {
        async fn suggest(
            &self,
            _phrase: &str,
        ) -> Result<Vec<SongDescriptor>, SuggestionUnavailable> {
            Err(SuggestionUnavailable("connection refused".to_string()))
        }
    }

    struct StalledSuggester;

    #[async_trait]
    impl MoodSuggester for StalledSuggester {
        async fn suggest(
            &self,
            _phrase: &str,
        ) -> Result<Vec<SongDescriptor>, SuggestionUnavailable> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn song(title: &str, artist: Option<&str>) -> SongDescriptor {
        SongDescriptor {
            title: title.to_string(),
            artist: artist.map(str::to_string),
        }
    }

    fn engine(dir: &tempfile::TempDir, tracks: &[(&str, &str, &str)]) -> SearchEngine {
        let store = IndexStore::open(&dir.path().join("index.redb")).unwrap();
        for (path, title, artist) in tracks {
            let mut track = Track::new(*path, *title, TrackSource::Local);
            track.set_tags(title.to_string(), Some(artist.to_string()), None);
            track.indexed_at = Some(1);
            store.upsert(&track).unwrap();
        }
        SearchEngine::new(store)
    }

    fn expander(
        search: SearchEngine,
        suggester: impl MoodSuggester + 'static,
    ) -> SuggestionExpander {
        SuggestionExpander::new(search, Arc::new(suggester), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn mood_maps_to_local_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(&dir, &[("/m/funk.mp3", "Uptown Funk", "Mark Ronson")]);
        let expander = expander(
            search,
            FixedSuggester(vec![song("Uptown Funk", Some("Mark Ronson ft. Bruno Mars"))]),
        );

        let tracks = expander.suggest_by_mood("upbeat dance").await;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].path, "/m/funk.mp3");
    }

    #[tokio::test]
    async fn absent_suggestions_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(&dir, &[("/m/other.mp3", "Hurricane", "Bob Dylan")]);
        let expander = expander(search, FixedSuggester(vec![song("Uptown Funk", None)]));
        assert!(expander.suggest_by_mood("upbeat dance").await.is_empty());
    }

    #[tokio::test]
    async fn first_local_match_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(
            &dir,
            &[
                ("/m/a.mp3", "Hurricane", "Thirty Seconds To Mars"),
                ("/m/b.mp3", "Hurricane", "Bob Dylan"),
            ],
        );
        let suggester = FixedSuggester(vec![song("Hurricane", Some("Bob Dylan"))]);
        let tracks = expander(search, suggester).suggest_by_mood("protest").await;
        let paths: Vec<_> = tracks.iter().map(|track| track.path.as_str()).collect();
        assert_eq!(paths, vec!["/m/a.mp3"]);
    }

    #[tokio::test]
    async fn results_are_unique_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(
            &dir,
            &[
                ("/m/1.mp3", "Uptown Funk", "Mark Ronson"),
                ("/m/2.mp3", "Get Lucky", "Daft Punk"),
                ("/m/3.mp3", "September", "Earth, Wind & Fire"),
            ],
        );
        let suggester = FixedSuggester(vec![
            song("Uptown Funk", None),
            song("uptown funk", Some("Mark Ronson")),
            song("Get Lucky", None),
            song("September", None),
        ]);
        let expander = expander(search, suggester).with_max_results(2);

        let paths: Vec<_> = expander
            .suggest_by_mood("party")
            .await
            .into_iter()
            .map(|track| track.path)
            .collect();
        assert_eq!(paths, vec!["/m/1.mp3".to_string(), "/m/2.mp3".to_string()]);
    }

    #[tokio::test]
    async fn unavailable_or_slow_suggester_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(&dir, &[("/m/funk.mp3", "Uptown Funk", "Mark Ronson")]);

        let offline = expander(search.clone(), OfflineSuggester);
        assert!(offline.suggest_by_mood("upbeat dance").await.is_empty());

        let stalled =
            SuggestionExpander::new(search, Arc::new(StalledSuggester), Duration::from_millis(20));
        assert!(stalled.suggest_by_mood("upbeat dance").await.is_empty());
    }

    #[tokio::test]
    async fn blank_phrase_skips_the_suggester() {
        let dir = tempfile::tempdir().unwrap();
        let search = engine(&dir, &[]);
        let expander = expander(search, StalledSuggester);
        assert!(expander.suggest_by_mood("   ").await.is_empty());
    }
}
