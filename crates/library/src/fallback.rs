use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{
    fold_case, normalize_query, now_secs, path_key, unix_millis, FileSignature, Track, TrackSource,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::search::{find_by_artist, SearchEngine, SearchScope};
use crate::store::IndexStore;

const CANDIDATE_LIMIT: usize = 25;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub title: String,
    pub artist: Option<String>,
}

/// A file the fetcher placed on local disk, plus whatever tags it learned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchedAudio {
    pub path: PathBuf,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<u64>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchFailed {
    #[error("no remote match for {0:?}")]
    NotFound(String),
    #[error("remote fetch failed: {0}")]
    Remote(String),
    #[error("fetch did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("fetched file is unusable: {0}")]
    InvalidResult(String),
    #[error("could not record fetched track: {0}")]
    Store(String),
}

#[async_trait]
pub trait TrackFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedAudio, FetchFailed>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolveStatus {
    Ready(Track),
    Fetching,
    Failed(FetchFailed),
}

type SharedFetch = Shared<BoxFuture<'static, Result<Track, FetchFailed>>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FetchKey {
    title: String,
    artist: String,
}

impl FetchKey {
    fn new(title: &str, artist: Option<&str>) -> Self {
        Self {
            title: fold_case(&normalize_query(title)),
            artist: artist
                .map(|artist| fold_case(&normalize_query(artist)))
                .unwrap_or_default(),
        }
    }

    fn artist(&self) -> Option<&str> {
        (!self.artist.is_empty()).then_some(self.artist.as_str())
    }
}

struct InFlight {
    fetch: SharedFetch,
    /// Set once `poll_resolve` has seen this fetch. Only polled fetches keep
    /// their failure.
    polled: bool,
}

#[derive(Default)]
struct FetchTable {
    in_flight: HashMap<FetchKey, InFlight>,
    resolved: HashMap<FetchKey, String>,
    failures: HashMap<FetchKey, FetchFailed>,
}

enum Lookup {
    Local(Track),
    Pending(SharedFetch),
    Failed(FetchFailed),
}

struct Inner {
    store: IndexStore,
    search: SearchEngine,
    fetcher: Arc<dyn TrackFetcher>,
    table: Mutex<FetchTable>,
    wait_timeout: Duration,
}

/// Finds a track locally, or acquires it through the fetcher at most once per
/// `(title, artist)` no matter how many callers ask concurrently.
#[derive(Clone)]
pub struct RemoteFallbackResolver {
    inner: Arc<Inner>,
}

impl RemoteFallbackResolver {
    pub fn new(
        store: IndexStore,
        search: SearchEngine,
        fetcher: Arc<dyn TrackFetcher>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                search,
                fetcher,
                table: Mutex::new(FetchTable::default()),
                wait_timeout,
            }),
        }
    }

    pub async fn resolve_or_fetch(
        &self,
        title: &str,
        artist: Option<&str>,
    ) -> Result<Track, FetchFailed> {
        let key = FetchKey::new(title, artist);
        if key.title.is_empty() {
            return Err(FetchFailed::NotFound(title.to_string()));
        }
        let pending = match self.lookup_or_start(&key, title, artist, false) {
            Lookup::Local(track) => return Ok(track),
            Lookup::Pending(pending) => pending,
            Lookup::Failed(err) => return Err(err),
        };
        match tokio::time::timeout(self.inner.wait_timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Still fetching {:?}; caller gave up waiting", key.title);
                Err(FetchFailed::TimedOut(self.inner.wait_timeout))
            }
        }
    }

    /// Non-blocking variant. Starts a fetch when nothing is in flight and
    /// reports a finished fetch's failure to one caller.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, because a new fetch is
    /// spawned onto the current one.
    pub fn poll_resolve(&self, title: &str, artist: Option<&str>) -> ResolveStatus {
        let key = FetchKey::new(title, artist);
        if key.title.is_empty() {
            return ResolveStatus::Failed(FetchFailed::NotFound(title.to_string()));
        }
        match self.lookup_or_start(&key, title, artist, true) {
            Lookup::Local(track) => ResolveStatus::Ready(track),
            Lookup::Pending(_) => ResolveStatus::Fetching,
            Lookup::Failed(err) => ResolveStatus::Failed(err),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.table.lock().in_flight.len()
    }

    fn lookup_or_start(
        &self,
        key: &FetchKey,
        title: &str,
        artist: Option<&str>,
        poll: bool,
    ) -> Lookup {
        loop {
            let seen = self.inner.table.lock().resolved.get(key).cloned();
            if let Some(track) = self.inner.lookup_with(key, seen.as_ref()) {
                return Lookup::Local(track);
            }

            let mut table = self.inner.table.lock();
            if let Some(entry) = table.in_flight.get_mut(key) {
                entry.polled |= poll;
                return Lookup::Pending(entry.fetch.clone());
            }
            // A fetch landed while the lookup ran unlocked.
            if table.resolved.get(key) != seen.as_ref() {
                continue;
            }
            if let Some(err) = table.failures.remove(key) {
                if poll {
                    return Lookup::Failed(err);
                }
            }
            let fetch = self.start_fetch(key.clone(), title, artist);
            table.in_flight.insert(
                key.clone(),
                InFlight {
                    fetch: fetch.clone(),
                    polled: poll,
                },
            );
            return Lookup::Pending(fetch);
        }
    }

    /// Caller must hold the table lock and insert the result into `in_flight`.
    fn start_fetch(&self, key: FetchKey, title: &str, artist: Option<&str>) -> SharedFetch {
        let request = FetchRequest {
            title: title.trim().to_string(),
            artist: artist
                .map(str::trim)
                .filter(|artist| !artist.is_empty())
                .map(str::to_string),
        };
        info!("No local match for {:?}; fetching remotely", request.title);
        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_fetch(key, request));
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(FetchFailed::Remote(format!("fetch task failed: {}", err))),
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    /// Must run without the table lock held.
    fn lookup_with(&self, key: &FetchKey, resolved: Option<&String>) -> Option<Track> {
        if let Some(path) = resolved {
            match self.store.get(path) {
                Ok(Some(track)) if track.is_searchable() => return Some(track),
                Ok(_) => {}
                Err(err) => warn!("Failed to load fetched track {:?}: {}", path, err),
            }
        }
        let candidates = self.search.search(&key.title, SearchScope::Title, CANDIDATE_LIMIT);
        find_by_artist(candidates, key.artist())
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: FetchKey,
        request: FetchRequest,
    ) -> Result<Track, FetchFailed> {
        let result = self.fetch_and_record(&request).await;
        {
            let mut table = self.table.lock();
            let polled = table
                .in_flight
                .remove(&key)
                .is_some_and(|entry| entry.polled);
            match &result {
                Ok(track) => {
                    table.resolved.insert(key, track.path.clone());
                }
                Err(err) if polled => {
                    table.failures.insert(key, err.clone());
                }
                Err(_) => {}
            }
        }
        match &result {
            Ok(track) => info!("Fetched {:?} into {:?}", track.title, track.path),
            Err(err) => warn!("Fetch for {:?} failed: {}", request.title, err),
        }
        result
    }

    async fn fetch_and_record(&self, request: &FetchRequest) -> Result<Track, FetchFailed> {
        let audio = self.fetcher.fetch(request).await?;
        let meta = tokio::fs::metadata(&audio.path)
            .await
            .map_err(|err| FetchFailed::InvalidResult(format!("{:?}: {}", audio.path, err)))?;
        if !meta.is_file() {
            return Err(FetchFailed::InvalidResult(format!(
                "{:?} is not a file",
                audio.path
            )));
        }

        let title = audio.title.unwrap_or_else(|| request.title.clone());
        let mut track = Track::new(path_key(&audio.path), title.clone(), TrackSource::Fetched);
        track.set_tags(title, audio.artist.or_else(|| request.artist.clone()), audio.album);
        track.duration_seconds = audio.duration_seconds;
        track.set_signature(FileSignature {
            file_size: meta.len(),
            modified_time: meta.modified().map(unix_millis).unwrap_or(0),
        });
        track.indexed_at = Some(now_secs());

        let store = self.store.clone();
        let row = track.clone();
        tokio::task::spawn_blocking(move || store.upsert(&row))
            .await
            .map_err(|err| FetchFailed::Store(err.to_string()))?
            .map_err(|err| FetchFailed::Store(err.to_string()))?;
        Ok(track)
    }
}
