use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use common::{fold_case, normalize_query, Track};
use thiserror::Error;
use tracing::warn;

use crate::error::Result;
use crate::store::{IndexStore, SearchField};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SearchScope {
    Title,
    Artist,
    Album,
    #[default]
    All,
}

impl SearchScope {
    fn fields(self) -> &'static [SearchField] {
        match self {
            SearchScope::Title => &[SearchField::Title],
            SearchScope::Artist => &[SearchField::Artist],
            SearchScope::Album => &[SearchField::Album],
            SearchScope::All => &SearchField::ALL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SearchScope::Title => "title",
            SearchScope::Artist => "artist",
            SearchScope::Album => "album",
            SearchScope::All => "all",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown search scope {0:?} (expected title, artist, album or all)")]
pub struct ParseScopeError(String);

impl FromStr for SearchScope {
    type Err = ParseScopeError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(SearchScope::Title),
            "artist" => Ok(SearchScope::Artist),
            "album" => Ok(SearchScope::Album),
            "all" => Ok(SearchScope::All),
            _ => Err(ParseScopeError(value.to_string())),
        }
    }
}

/// Lower is better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRank {
    Exact,
    Prefix,
    Substring,
}

/// `query` must already be passed through `fold_case`; `candidate` is a
/// stored normalized value and is folded here.
pub fn match_rank(query: &str, candidate: &str) -> Option<MatchRank> {
    if query.is_empty() || candidate.is_empty() {
        return None;
    }
    let folded;
    let candidate = if candidate.is_ascii() {
        candidate
    } else {
        folded = fold_case(candidate);
        folded.as_str()
    };
    if candidate == query {
        Some(MatchRank::Exact)
    } else if candidate.starts_with(query) {
        Some(MatchRank::Prefix)
    } else if candidate.contains(query) {
        Some(MatchRank::Substring)
    } else {
        None
    }
}

/// First track whose artist contains `artist`, ignoring case. Without an
/// artist hint this is simply the first track.
pub fn find_by_artist(tracks: Vec<Track>, artist: Option<&str>) -> Option<Track> {
    let artist = artist
        .map(|artist| fold_case(&normalize_query(artist)))
        .unwrap_or_default();
    if artist.is_empty() {
        return tracks.into_iter().next();
    }
    tracks
        .into_iter()
        .find(|track| fold_case(&track.normalized_artist).contains(&artist))
}

/// Read-only query path over the index. Each query reads one snapshot.
#[derive(Clone)]
pub struct SearchEngine {
    store: IndexStore,
}

impl SearchEngine {
    pub fn new(store: IndexStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn search(&self, query: &str, scope: SearchScope, limit: usize) -> Vec<Track> {
        match self.try_search(query, scope, limit) {
            Ok(tracks) => tracks,
            Err(err) => {
                warn!("Search for {:?} ({}) failed: {}", query, scope, err);
                Vec::new()
            }
        }
    }

    pub fn try_search(
        &self,
        query: &str,
        scope: SearchScope,
        limit: usize,
    ) -> Result<Vec<Track>> {
        let query = fold_case(&normalize_query(query));
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let snapshot = self.store.snapshot()?;
        let mut best: HashMap<String, MatchRank> = HashMap::new();
        for field in scope.fields() {
            snapshot.scan_index(*field, |value, path| {
                let Some(rank) = match_rank(&query, value) else {
                    return;
                };
                best.entry(path.to_string())
                    .and_modify(|current| *current = (*current).min(rank))
                    .or_insert(rank);
            })?;
        }

        let mut hits = Vec::with_capacity(best.len());
        for (path, rank) in best {
            if let Some(track) = snapshot.get(&path)? {
                if track.is_searchable() {
                    hits.push((rank, track));
                }
            }
        }
        hits.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_a
                .cmp(rank_b)
                .then_with(|| a.normalized_title.cmp(&b.normalized_title))
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.path.cmp(&b.path))
        });
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(_, track)| track).collect())
    }
}
