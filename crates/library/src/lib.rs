mod error;
mod fallback;
mod indexer;
mod reconcile;
mod scanner;
mod search;
mod store;
mod suggest;

pub use error::{LibraryError, Result};
pub use fallback::{
    FetchFailed, FetchRequest, FetchedAudio, RemoteFallbackResolver, ResolveStatus, TrackFetcher,
};
pub use indexer::{IndexOptions, Indexer};
pub use reconcile::{Classification, Reconciler};
pub use scanner::Scanner;
pub use search::{
    find_by_artist, match_rank, MatchRank, ParseScopeError, SearchEngine, SearchScope,
    DEFAULT_SEARCH_LIMIT,
};
pub use store::{
    ExtractionOutcome, IndexStore, LibraryStats, SearchField, Snapshot, UpsertOutcome,
};
pub use suggest::{
    MoodSuggester, SongDescriptor, SuggestionExpander, SuggestionUnavailable,
    DEFAULT_MAX_SUGGESTIONS,
};
