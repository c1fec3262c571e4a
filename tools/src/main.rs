mod config;
mod external;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use common::{IndexMode, IndexRun, Track};
use library::{
    IndexOptions, IndexStore, Indexer, LibraryStats, RemoteFallbackResolver, SearchEngine,
    SearchScope, SuggestionExpander,
};
use metadata::LoftyReader;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{
    config_path_from_env, load_or_create_config, resolve_music_root, resolve_path, JukeboxConfig,
};
use crate::external::{CommandFetcher, OllamaSuggester};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "jukebox", version, about = "Index and search a local music library")]
struct Cli {
    /// Config file; defaults to config.yaml next to the binary.
    #[arg(long, global = true, env = "JUKEBOX_CONFIG")]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the library and update the index.
    Index {
        /// Re-extract every file, changed or not.
        #[arg(long)]
        force: bool,
        /// Keep index entries for files that disappeared.
        #[arg(long)]
        no_cleanup: bool,
        /// Library root, overriding music_root from the config.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show index statistics without scanning.
    Stats,
    Search {
        query: String,
        #[arg(long, default_value = "all")]
        scope: SearchScope,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Ask the suggestion service for songs matching a mood.
    Suggest { phrase: String },
    /// Find a track locally or download it.
    Fetch {
        title: String,
        #[arg(long)]
        artist: Option<String>,
    },
    /// List recent index runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete every indexed track and run record.
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult {
    let config_path = cli.config.unwrap_or_else(config_path_from_env);
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    let store = IndexStore::open(&index_path)?;
    let app = App {
        config_path,
        config,
        store,
    };

    match cli.command {
        Command::Index {
            force,
            no_cleanup,
            path,
        } => app.index(force, no_cleanup, path).await,
        Command::Stats => app.stats(),
        Command::Search {
            query,
            scope,
            limit,
        } => {
            app.search(&query, scope, limit);
            Ok(())
        }
        Command::Suggest { phrase } => app.suggest(&phrase).await,
        Command::Fetch { title, artist } => app.fetch(&title, artist.as_deref()).await,
        Command::Runs { limit } => app.runs(limit),
        Command::Clear => {
            app.store.clear()?;
            println!("Index cleared");
            Ok(())
        }
    }
}

struct App {
    config_path: PathBuf,
    config: JukeboxConfig,
    store: IndexStore,
}

impl App {
    async fn index(&self, force: bool, no_cleanup: bool, path: Option<PathBuf>) -> CliResult {
        let root = path
            .or_else(|| resolve_music_root(&self.config_path, &self.config.music_root))
            .ok_or("music_root is not configured and no --path was given")?;
        let root = fs::canonicalize(&root).unwrap_or(root);

        let mut options = IndexOptions {
            mode: if force {
                IndexMode::Full
            } else {
                IndexMode::Incremental
            },
            cleanup: self.config.cleanup && !no_cleanup,
            extract_timeout: Duration::from_secs(self.config.extract_timeout_secs),
            ..IndexOptions::default()
        };
        if self.config.index_workers > 0 {
            options.workers = self.config.index_workers;
        }

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_cancel.cancel();
        });

        let indexer = Indexer::new(self.store.clone(), Arc::new(LoftyReader), options);
        let run = indexer.run(&root, cancel).await?;
        print_run(&run);
        Ok(())
    }

    fn stats(&self) -> CliResult {
        let stats = self.store.stats()?;
        print_stats(&stats);
        match self.store.last_run()? {
            Some(run) => {
                println!("Last run:");
                print_run(&run);
            }
            None => println!("Last run:        never"),
        }
        Ok(())
    }

    fn search(&self, query: &str, scope: SearchScope, limit: Option<usize>) {
        let limit = limit.unwrap_or(self.config.search_limit);
        let tracks = SearchEngine::new(self.store.clone()).search(query, scope, limit);
        if tracks.is_empty() {
            println!("No matches for {:?}", query);
        }
        for track in &tracks {
            print_track(track);
        }
    }

    async fn suggest(&self, phrase: &str) -> CliResult {
        let settings = &self.config.suggestions;
        if !settings.enabled {
            return Err("suggestions are disabled in the config".into());
        }
        let timeout = Duration::from_secs(settings.timeout_secs);
        let suggester = OllamaSuggester::new(
            reqwest::Client::new(),
            &settings.base_url,
            &settings.model,
            timeout,
            settings.max_results,
        );
        let expander = SuggestionExpander::new(
            SearchEngine::new(self.store.clone()),
            Arc::new(suggester),
            timeout,
        )
        .with_max_results(settings.max_results);

        let tracks = expander.suggest_by_mood(phrase).await;
        if tracks.is_empty() {
            println!("No local tracks match {:?}", phrase);
        }
        for track in &tracks {
            print_track(track);
        }
        Ok(())
    }

    async fn fetch(&self, title: &str, artist: Option<&str>) -> CliResult {
        let settings = &self.config.fetch;
        let search = SearchEngine::new(self.store.clone());
        if !settings.enabled {
            warn!("Remote fetch is disabled; searching locally only");
            let hits = search.search(title, SearchScope::Title, self.config.search_limit);
            return match library::find_by_artist(hits, artist) {
                Some(track) => {
                    print_track(&track);
                    Ok(())
                }
                None => Err(format!("no local match for {:?}", title).into()),
            };
        }

        let download_dir = resolve_path(&self.config_path, &self.config.download_dir);
        let fetcher = CommandFetcher::new(
            &settings.command,
            download_dir,
            Duration::from_secs(settings.timeout_secs),
        );
        let resolver = RemoteFallbackResolver::new(
            self.store.clone(),
            search,
            Arc::new(fetcher),
            Duration::from_secs(settings.wait_secs),
        );
        let track = resolver.resolve_or_fetch(title, artist).await?;
        print_track(&track);
        Ok(())
    }

    fn runs(&self, limit: usize) -> CliResult {
        let runs = self.store.list_runs(limit)?;
        if runs.is_empty() {
            println!("No index runs recorded");
        }
        for run in &runs {
            print_run(run);
        }
        Ok(())
    }
}

fn print_run(run: &IndexRun) {
    let state = if run.interrupted {
        "interrupted"
    } else if run.completed_at.is_some() {
        "completed"
    } else {
        "incomplete"
    };
    println!(
        "Run {} ({:?}, {}) started {}",
        run.id,
        run.mode,
        state,
        format_timestamp(run.started_at)
    );
    println!(
        "  scanned={} new={} updated={} skipped={} errors={} removed={}",
        run.counts.scanned,
        run.counts.new,
        run.counts.updated,
        run.counts.skipped,
        run.counts.errors,
        run.counts.removed
    );
}

fn print_stats(stats: &LibraryStats) {
    println!("Tracks:          {}", stats.tracks);
    println!("Artists:         {}", stats.unique_artists);
    println!("Albums:          {}", stats.unique_albums);
    println!("Total duration:  {}", format_duration(stats.total_duration_seconds));
    println!("Total size:      {}", format_size(stats.total_size_bytes));
    println!(
        "Last indexed:    {}",
        stats
            .last_indexed_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string())
    );
    println!("Errors:          {}", stats.errors);
    println!("Removed:         {}", stats.removed);
    println!("Fetched:         {}", stats.fetched);
}

fn print_track(track: &Track) {
    let artist = track.artist.as_deref().unwrap_or("Unknown Artist");
    let album = track.album.as_deref().unwrap_or("Unknown Album");
    let duration = track
        .duration_seconds
        .map(format_duration)
        .unwrap_or_else(|| "?".to_string());
    println!(
        "{} - {} [{}] ({})\n  {}",
        track.title, artist, album, duration, track.path
    );
}

fn format_timestamp(secs: u64) -> String {
    OffsetDateTime::from_unix_timestamp(secs as i64)
        .ok()
        .and_then(|time| time.format(&Rfc3339).ok())
        .unwrap_or_else(|| secs.to_string())
}

fn format_duration(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for ctrl-c: {}", err);
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Stopping after in-flight files finish");
}
