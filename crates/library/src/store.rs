use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{
    file_stem, now_secs, FileDescriptor, FileSignature, IndexMode, IndexRun, RunCounts, Track,
    TrackSource, TrackStatus,
};
use metadata::Metadata;
use redb::{
    Database, Durability, ReadTransaction, ReadableTable, TableDefinition, TableError,
    WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LibraryError, Result};

const INDEX_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
const TITLE_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_title");
const ARTIST_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_artist");
const ALBUM_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_album");
const RUNS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("index_runs");

const META_VERSION_KEY: &str = "version";

/// One of the three normalized, secondary-indexed text fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchField {
    Title,
    Artist,
    Album,
}

impl SearchField {
    pub const ALL: [SearchField; 3] = [SearchField::Title, SearchField::Artist, SearchField::Album];

    fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            SearchField::Title => TITLE_INDEX_TABLE,
            SearchField::Artist => ARTIST_INDEX_TABLE,
            SearchField::Album => ALBUM_INDEX_TABLE,
        }
    }

    pub fn value(self, track: &Track) -> &str {
        match self {
            SearchField::Title => &track.normalized_title,
            SearchField::Artist => &track.normalized_artist,
            SearchField::Album => &track.normalized_album,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Inserted,
    Updated,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub tracks: usize,
    pub unique_artists: usize,
    pub unique_albums: usize,
    pub total_duration_seconds: u64,
    pub total_size_bytes: u64,
    pub last_indexed_at: Option<u64>,
    pub errors: usize,
    pub removed: usize,
    pub fetched: usize,
}

/// Durable track index. Cloning is cheap; every clone shares one database.
#[derive(Clone)]
pub struct IndexStore {
    db: Arc<Database>,
}

impl IndexStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = open_or_create_db(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_schema()?;
        info!("Opened index at {:?}", path);
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        match read_version(&self.db)? {
            Some(version) if version == INDEX_VERSION => Ok(()),
            Some(version) => {
                warn!("Index version mismatch ({}); clearing index", version);
                self.clear()
            }
            None => self.write(Durability::Immediate, init_tables),
        }
    }

    /// A consistent read view; later commits are invisible to it.
    pub fn snapshot(&self) -> Result<Snapshot<'_>> {
        Ok(Snapshot {
            txn: self.db.begin_read()?,
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<Track>> {
        self.snapshot()?.get(path)
    }

    pub fn upsert(&self, track: &Track) -> Result<UpsertOutcome> {
        self.write(Durability::Immediate, |txn| write_track(txn, track))
    }

    /// Applies one extraction attempt for a scanned file in a single transaction.
    pub fn record_extraction(
        &self,
        descriptor: &FileDescriptor,
        outcome: std::result::Result<Metadata, String>,
        source: TrackSource,
    ) -> Result<ExtractionOutcome> {
        self.write(Durability::Eventual, |txn| {
            let key = descriptor.key();
            let existing = read_track(txn, &key)?;
            let was_live = existing.as_ref().map(Track::is_live).unwrap_or(false);
            let mut track = existing
                .unwrap_or_else(|| Track::new(key, file_stem(&descriptor.path), source));
            track.set_signature(descriptor.signature());
            track.removed_at = None;

            let result = match outcome {
                Ok(metadata) => {
                    let title = metadata
                        .title
                        .unwrap_or_else(|| file_stem(&descriptor.path));
                    track.set_tags(title, metadata.artist, metadata.album);
                    track.duration_seconds = metadata.duration_seconds;
                    track.indexed_at = Some(now_secs());
                    track.status = TrackStatus::Indexed;
                    track.last_error = None;
                    if was_live {
                        ExtractionOutcome::Updated
                    } else {
                        ExtractionOutcome::Inserted
                    }
                }
                Err(message) => {
                    track.status = TrackStatus::Error;
                    track.last_error = Some(message);
                    ExtractionOutcome::Failed
                }
            };

            write_track(txn, &track)?;
            Ok(result)
        })
    }

    pub fn mark_removed(&self, path: &str) -> Result<bool> {
        let removed = self.mark_removed_many(&[path.to_string()])?;
        Ok(removed > 0)
    }

    /// Soft-deletes every live path in `paths`; returns how many changed.
    pub fn mark_removed_many(&self, paths: &[String]) -> Result<u64> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.write(Durability::Immediate, |txn| {
            let now = now_secs();
            let mut removed = 0u64;
            for path in paths {
                let Some(mut track) = read_track(txn, path)? else {
                    continue;
                };
                if !track.is_live() {
                    continue;
                }
                track.removed_at = Some(now);
                write_track(txn, &track)?;
                removed += 1;
            }
            Ok(removed)
        })
    }

    /// Signatures of every live track, keyed by path.
    pub fn live_signatures(&self) -> Result<HashMap<String, FileSignature>> {
        let mut out = HashMap::new();
        self.snapshot()?.for_each_track(|track| {
            if track.is_live() {
                out.insert(track.path.clone(), track.signature());
            }
        })?;
        Ok(out)
    }

    pub fn begin_run(&self, mode: IndexMode, cleanup: bool) -> Result<IndexRun> {
        self.write(Durability::Immediate, |txn| {
            let mut table = txn.open_table(RUNS_TABLE)?;
            let id = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            let run = IndexRun {
                id,
                started_at: now_secs(),
                completed_at: None,
                mode,
                cleanup,
                interrupted: false,
                counts: RunCounts::default(),
            };
            let bytes = encode_value(&run)?;
            table.insert(id, bytes.as_slice())?;
            Ok(run)
        })
    }

    /// Persists the final run record. This commit also makes earlier
    /// eventual-durability track writes durable.
    pub fn finish_run(&self, run: &IndexRun) -> Result<()> {
        self.write(Durability::Immediate, |txn| {
            let mut table = txn.open_table(RUNS_TABLE)?;
            let bytes = encode_value(run)?;
            table.insert(run.id, bytes.as_slice())?;
            Ok(())
        })
    }

    pub fn last_run(&self) -> Result<Option<IndexRun>> {
        Ok(self.list_runs(1)?.into_iter().next())
    }

    /// Most recent first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<IndexRun>> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(RUNS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut runs = Vec::new();
        for entry in table.iter()?.rev().take(limit) {
            let entry = entry?;
            runs.push(decode_value(entry.1.value())?);
        }
        Ok(runs)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let mut stats = LibraryStats::default();
        let mut artists = HashSet::new();
        let mut albums = HashSet::new();
        self.snapshot()?.for_each_track(|track| {
            if !track.is_live() {
                stats.removed += 1;
                return;
            }
            if track.status == TrackStatus::Error {
                stats.errors += 1;
            }
            if !track.is_searchable() {
                return;
            }
            stats.tracks += 1;
            if track.source == TrackSource::Fetched {
                stats.fetched += 1;
            }
            if !track.normalized_artist.is_empty() {
                artists.insert(track.normalized_artist.clone());
            }
            if !track.normalized_album.is_empty() {
                albums.insert(track.normalized_album.clone());
            }
            stats.total_duration_seconds += track.duration_seconds.unwrap_or(0);
            stats.total_size_bytes += track.file_size;
            stats.last_indexed_at = stats.last_indexed_at.max(track.indexed_at);
        })?;
        stats.unique_artists = artists.len();
        stats.unique_albums = albums.len();
        Ok(stats)
    }

    /// Hard-deletes every track and run record.
    pub fn clear(&self) -> Result<()> {
        self.write(Durability::Immediate, |txn| {
            clear_table(txn, META_TABLE)?;
            clear_table(txn, TRACKS_TABLE)?;
            clear_table(txn, TITLE_INDEX_TABLE)?;
            clear_table(txn, ARTIST_INDEX_TABLE)?;
            clear_table(txn, ALBUM_INDEX_TABLE)?;
            match txn.delete_table(RUNS_TABLE) {
                Ok(_) | Err(TableError::TableDoesNotExist(_)) => {}
                Err(err) => return Err(err.into()),
            }
            init_tables(txn)
        })?;
        info!("Index cleared");
        Ok(())
    }

    fn write<T>(
        &self,
        durability: Durability,
        apply: impl FnOnce(&WriteTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(durability);
        let value = apply(&write_txn)?;
        write_txn.commit()?;
        Ok(value)
    }
}

pub struct Snapshot<'db> {
    txn: ReadTransaction<'db>,
}

impl Snapshot<'_> {
    pub fn get(&self, path: &str) -> Result<Option<Track>> {
        let table = match self.txn.open_table(TRACKS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let track = match table.get(path)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    pub fn for_each_track(&self, mut visit: impl FnMut(&Track)) -> Result<()> {
        let table = match self.txn.open_table(TRACKS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in table.iter()? {
            let entry = entry?;
            let track: Track = decode_value(entry.1.value())?;
            visit(&track);
        }
        Ok(())
    }

    /// Visits `(normalized value, path)` for every secondary-index entry of `field`.
    pub fn scan_index(&self, field: SearchField, mut visit: impl FnMut(&str, &str)) -> Result<()> {
        let table = match self.txn.open_table(field.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            let path = std::str::from_utf8(entry.1.value())
                .map_err(|_| LibraryError::KeyParse(key.to_string()))?;
            let normalized = split_index_key(key, path)?;
            visit(normalized, path);
        }
        Ok(())
    }
}

fn open_or_create_db(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_version(db: &Database) -> Result<Option<u32>> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

fn init_tables(txn: &WriteTransaction) -> Result<()> {
    {
        let mut meta = txn.open_table(META_TABLE)?;
        let version_bytes = encode_value(&INDEX_VERSION)?;
        meta.insert(META_VERSION_KEY, version_bytes.as_slice())?;
    }
    let _ = txn.open_table(TRACKS_TABLE)?;
    for field in SearchField::ALL {
        let _ = txn.open_table(field.table())?;
    }
    let _ = txn.open_table(RUNS_TABLE)?;
    debug!("Initialised index tables (version {})", INDEX_VERSION);
    Ok(())
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<()> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn read_track(txn: &WriteTransaction, path: &str) -> Result<Option<Track>> {
    let table = txn.open_table(TRACKS_TABLE)?;
    let track = match table.get(path)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(track)
}

/// Writes the row and keeps the secondary indexes in step with it.
fn write_track(txn: &WriteTransaction, track: &Track) -> Result<UpsertOutcome> {
    let previous = read_track(txn, &track.path)?;
    for field in SearchField::ALL {
        let mut index = txn.open_table(field.table())?;
        if let Some(previous) = &previous {
            let value = field.value(previous);
            if !value.is_empty() {
                index.remove(index_key(value, &previous.path).as_str())?;
            }
        }
        if track.is_searchable() {
            let value = field.value(track);
            if !value.is_empty() {
                index.insert(index_key(value, &track.path).as_str(), track.path.as_bytes())?;
            }
        }
    }

    let mut table = txn.open_table(TRACKS_TABLE)?;
    let bytes = encode_value(track)?;
    table.insert(track.path.as_str(), bytes.as_slice())?;

    Ok(if previous.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

fn index_key(normalized: &str, path: &str) -> String {
    let mut out = String::with_capacity(normalized.len() + path.len() + 1);
    out.push_str(normalized);
    out.push(KEY_SEP);
    out.push_str(path);
    out
}

fn split_index_key<'k>(key: &'k str, path: &str) -> Result<&'k str> {
    key.strip_suffix(path)
        .and_then(|rest| rest.strip_suffix(KEY_SEP))
        .ok_or_else(|| LibraryError::KeyParse(key.to_string()))
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn open_store(dir: &tempfile::TempDir) -> IndexStore {
        IndexStore::open(&dir.path().join("index.redb")).unwrap()
    }

    fn indexed(path: &str, title: &str, artist: Option<&str>) -> Track {
        let mut track = Track::new(path, title, TrackSource::Local);
        track.set_tags(title.to_string(), artist.map(str::to_string), None);
        track.indexed_at = Some(1);
        track
    }

    fn descriptor(path: &str, size: u64, modified_time: u64) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            size,
            modified_time,
        }
    }

    fn index_values(store: &IndexStore, field: SearchField) -> Vec<(String, String)> {
        let mut out = Vec::new();
        store
            .snapshot()
            .unwrap()
            .scan_index(field, |value, path| out.push((value.to_string(), path.to_string())))
            .unwrap();
        out
    }

    #[test]
    fn upsert_is_idempotent_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let track = indexed("/music/a.mp3", "Hurricane", Some("Bob Dylan"));

        assert_eq!(store.upsert(&track).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&track).unwrap(), UpsertOutcome::Updated);

        assert_eq!(store.get("/music/a.mp3").unwrap(), Some(track));
        assert_eq!(store.live_signatures().unwrap().len(), 1);
        assert_eq!(index_values(&store, SearchField::Title).len(), 1);
    }

    #[test]
    fn retagging_replaces_secondary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut track = indexed("/music/a.mp3", "Hurricane", Some("Bob Dylan"));
        store.upsert(&track).unwrap();

        track.set_tags("Isis".to_string(), None, None);
        store.upsert(&track).unwrap();

        assert_eq!(
            index_values(&store, SearchField::Title),
            vec![("isis".to_string(), "/music/a.mp3".to_string())]
        );
        assert!(index_values(&store, SearchField::Artist).is_empty());
    }

    #[test]
    fn failed_extraction_keeps_previous_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let first = descriptor("/music/a.mp3", 10, 100);
        let tags = Metadata {
            title: Some("Hurricane".to_string()),
            artist: Some("Bob Dylan".to_string()),
            album: Some("Desire".to_string()),
            duration_seconds: Some(513),
        };
        let outcome = store
            .record_extraction(&first, Ok(tags), TrackSource::Local)
            .unwrap();
        assert_eq!(outcome, ExtractionOutcome::Inserted);

        let changed = descriptor("/music/a.mp3", 12, 200);
        let outcome = store
            .record_extraction(&changed, Err("corrupt frame".to_string()), TrackSource::Local)
            .unwrap();
        assert_eq!(outcome, ExtractionOutcome::Failed);

        let track = store.get("/music/a.mp3").unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Error);
        assert_eq!(track.title, "Hurricane");
        assert_eq!(track.artist.as_deref(), Some("Bob Dylan"));
        assert_eq!(track.duration_seconds, Some(513));
        assert_eq!(track.last_error.as_deref(), Some("corrupt frame"));
        assert_eq!(track.signature(), changed.signature());
        assert!(track.is_searchable());
    }

    #[test]
    fn failed_first_extraction_records_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let file = descriptor("/music/B.flac", 4, 5);
        store
            .record_extraction(&file, Err("bad header".to_string()), TrackSource::Local)
            .unwrap();

        let track = store.get("/music/B.flac").unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Error);
        assert_eq!(track.title, "B");
        assert_eq!(track.indexed_at, None);
        assert!(index_values(&store, SearchField::Title).is_empty());
        assert!(store.live_signatures().unwrap().contains_key("/music/B.flac"));
    }

    #[test]
    fn mark_removed_soft_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .upsert(&indexed("/music/a.mp3", "Hurricane", Some("Bob Dylan")))
            .unwrap();

        assert!(store.mark_removed("/music/a.mp3").unwrap());
        assert!(!store.mark_removed("/music/a.mp3").unwrap());

        let track = store.get("/music/a.mp3").unwrap().unwrap();
        assert!(track.removed_at.is_some());
        assert!(index_values(&store, SearchField::Title).is_empty());
        assert!(index_values(&store, SearchField::Artist).is_empty());
        assert!(store.live_signatures().unwrap().is_empty());
        assert_eq!(store.stats().unwrap().removed, 1);
    }

    #[test]
    fn snapshot_does_not_observe_later_commits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert(&indexed("/music/a.mp3", "Before", None)).unwrap();

        let snapshot = store.snapshot().unwrap();
        store.upsert(&indexed("/music/a.mp3", "After", None)).unwrap();

        assert_eq!(snapshot.get("/music/a.mp3").unwrap().unwrap().title, "Before");
        assert_eq!(store.get("/music/a.mp3").unwrap().unwrap().title, "After");
    }

    #[test]
    fn clear_hard_deletes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.upsert(&indexed("/music/a.mp3", "Hurricane", None)).unwrap();
        let run = store.begin_run(IndexMode::Full, true).unwrap();
        store.finish_run(&run).unwrap();

        store.clear().unwrap();

        assert_eq!(store.get("/music/a.mp3").unwrap(), None);
        assert!(store.last_run().unwrap().is_none());
        assert_eq!(store.stats().unwrap(), LibraryStats::default());
    }

    #[test]
    fn runs_are_numbered_and_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let first = store.begin_run(IndexMode::Incremental, true).unwrap();
        let mut second = store.begin_run(IndexMode::Full, false).unwrap();
        assert_eq!(first.id + 1, second.id);

        second.counts.new = 3;
        second.completed_at = Some(second.started_at);
        store.finish_run(&second).unwrap();

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], second);
        assert_eq!(store.last_run().unwrap(), Some(second));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.upsert(&indexed("/music/a.mp3", "Hurricane", None)).unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get("/music/a.mp3").unwrap().unwrap().title, "Hurricane");
    }

    #[test]
    fn stats_summarise_searchable_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut a = indexed("/music/a.mp3", "Hurricane", Some("Bob Dylan"));
        a.duration_seconds = Some(100);
        a.file_size = 1_000;
        a.indexed_at = Some(50);
        let mut b = indexed("/music/b.mp3", "Isis", Some("BOB DYLAN"));
        b.duration_seconds = Some(20);
        b.file_size = 10;
        b.indexed_at = Some(70);
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();
        store
            .record_extraction(
                &descriptor("/music/c.flac", 1, 1),
                Err("bad".to_string()),
                TrackSource::Local,
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.tracks, 2);
        assert_eq!(stats.unique_artists, 1);
        assert_eq!(stats.unique_albums, 0);
        assert_eq!(stats.total_duration_seconds, 120);
        assert_eq!(stats.total_size_bytes, 1_010);
        assert_eq!(stats.last_indexed_at, Some(70));
        assert_eq!(stats.errors, 1);
    }
}
