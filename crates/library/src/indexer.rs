use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{now_secs, FileDescriptor, IndexMode, IndexRun, RunCounts, TrackSource};
use metadata::{MetadataError, TagReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reconcile::{Classification, Reconciler};
use crate::scanner::Scanner;
use crate::store::{ExtractionOutcome, IndexStore};

const SCAN_QUEUE_DEPTH: usize = 256;

#[derive(Clone, Debug)]
pub struct IndexOptions {
    pub mode: IndexMode,
    /// Soft-delete indexed paths the pass no longer sees.
    pub cleanup: bool,
    pub extract_timeout: Duration,
    pub workers: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            mode: IndexMode::Incremental,
            cleanup: true,
            extract_timeout: Duration::from_secs(30),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

pub struct Indexer {
    store: IndexStore,
    reader: Arc<dyn TagReader>,
    options: IndexOptions,
}

impl Indexer {
    pub fn new(store: IndexStore, reader: Arc<dyn TagReader>, options: IndexOptions) -> Self {
        Self {
            store,
            reader,
            options,
        }
    }

    /// Runs one pass over `root`. Per-file failures are counted, not returned;
    /// only setup and store failures abort the run.
    pub async fn run(&self, root: &Path, cancel: CancellationToken) -> Result<IndexRun> {
        let scanner = Scanner::new(root)?;
        let mode = self.options.mode;

        let store = self.store.clone();
        let live = tokio::task::spawn_blocking(move || store.live_signatures()).await??;
        let mut run = self.store.begin_run(mode, self.options.cleanup)?;
        info!(
            "Index run {} started on {:?} ({:?}, {} known tracks)",
            run.id,
            root,
            mode,
            live.len()
        );

        let mut reconciler = Reconciler::new(live, scanner.root(), mode);
        let (tx, mut rx) = mpsc::channel::<FileDescriptor>(SCAN_QUEUE_DEPTH);
        let walk_cancel = cancel.clone();
        let walker = tokio::task::spawn_blocking(move || {
            for file in scanner.files() {
                if walk_cancel.is_cancelled() || tx.blocking_send(file).is_err() {
                    break;
                }
            }
        });

        let workers = self.options.workers.max(1);
        let mut jobs: JoinSet<Result<ExtractionOutcome>> = JoinSet::new();
        loop {
            let file = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                file = rx.recv() => match file {
                    Some(file) => file,
                    None => break,
                },
            };

            run.counts.scanned += 1;
            let class = reconciler.observe(&file);
            debug!("{:?}: {:?}", class, file.path);
            if class == Classification::Unchanged {
                run.counts.skipped += 1;
                continue;
            }

            while jobs.len() >= workers {
                match jobs.join_next().await {
                    Some(joined) => tally(&mut run.counts, joined??),
                    None => break,
                }
            }
            jobs.spawn(index_file(
                self.store.clone(),
                self.reader.clone(),
                file,
                self.options.extract_timeout,
            ));
        }
        drop(rx);

        while let Some(joined) = jobs.join_next().await {
            tally(&mut run.counts, joined??);
        }
        walker.await?;

        run.interrupted = cancel.is_cancelled();
        let missing = reconciler.finish();
        if run.interrupted {
            warn!("Index run {} interrupted; skipping cleanup", run.id);
        } else if self.options.cleanup {
            let store = self.store.clone();
            run.counts.removed =
                tokio::task::spawn_blocking(move || store.mark_removed_many(&missing)).await??;
        } else if !missing.is_empty() {
            debug!("{} indexed paths not seen; cleanup disabled", missing.len());
        }

        run.completed_at = Some(now_secs());
        self.store.finish_run(&run)?;
        info!(
            "Index run {} finished: scanned={} new={} updated={} skipped={} errors={} removed={}",
            run.id,
            run.counts.scanned,
            run.counts.new,
            run.counts.updated,
            run.counts.skipped,
            run.counts.errors,
            run.counts.removed
        );
        Ok(run)
    }
}

fn tally(counts: &mut RunCounts, outcome: ExtractionOutcome) {
    match outcome {
        ExtractionOutcome::Inserted => counts.new += 1,
        ExtractionOutcome::Updated => counts.updated += 1,
        ExtractionOutcome::Failed => counts.errors += 1,
    }
}

async fn index_file(
    store: IndexStore,
    reader: Arc<dyn TagReader>,
    file: FileDescriptor,
    timeout: Duration,
) -> Result<ExtractionOutcome> {
    let path = file.path.clone();
    let read = tokio::task::spawn_blocking(move || reader.read(&path));
    // On timeout the blocking read is detached and its result dropped.
    let extracted = match tokio::time::timeout(timeout, read).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(MetadataError::Panicked(join_err.to_string())),
        Err(_) => Err(MetadataError::Timeout(timeout)),
    };
    let extracted = extracted.map_err(|err| {
        warn!("Failed to read tags for {:?}: {}", file.path, err);
        err.to_string()
    });

    let outcome = tokio::task::spawn_blocking(move || {
        store.record_extraction(&file, extracted, TrackSource::Local)
    })
    .await??;
    Ok(outcome)
}
