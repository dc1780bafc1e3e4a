//!
//! src/main.rs  Andrew Belles  Oct 12th, 2025
//!
//! Command surface of the etl: full runs, single stages, cache clears and
//! read-only views of the published data
//!

use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use tunemeld_etl::cache::KvCache;
use tunemeld_etl::config::{load_config, load_local_config};
use tunemeld_etl::errors::EtlError;
use tunemeld_etl::logging::init_logging;
use tunemeld_etl::persistent::Persistent;
use tunemeld_etl::pipeline::{Collaborators, Pipeline, RunOptions, Stage};
use tunemeld_etl::query::{play_counts_view, playlist_view, service_playlist_view};
use tunemeld_etl::schedule::{clear_raw_playlist_cache, CacheWindow};
use tunemeld_etl::sink::DiskZstdSink;
use tunemeld_etl::types::{Genre, Isrc, ServiceName};

#[derive(Parser)]
#[command(name = "tunemeld-etl")]
#[command(about = "Cross-service playlist etl")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command
}

#[derive(Args, Clone, Copy, Debug)]
struct RunArgs {
    /// Cap on tracks per chart and per enrichment stage
    #[arg(long)]
    limit: Option<usize>,
    /// Ignore cached raw payloads and the cache window
    #[arg(long)]
    force: bool
}

impl From<RunArgs> for RunOptions {
    fn from(a: RunArgs) -> Self {
        RunOptions { limit: a.limit, force: a.force }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run every stage and publish on success
    Run {
        #[command(flatten)]
        args: RunArgs
    },
    /// Run one stage against the newest run (extract starts a new one)
    Stage {
        #[arg(value_enum)]
        stage: Stage,
        #[command(flatten)]
        args: RunArgs
    },
    /// Clear cached raw playlists, only inside the cache window unless forced
    ClearCache {
        #[command(flatten)]
        args: RunArgs
    },
    /// Print the published consensus playlist, or one service's chart
    Playlist {
        genre: String,
        #[arg(long)]
        service: Option<String>,
        #[command(flatten)]
        args: RunArgs
    },
    /// Print the latest play counts of a track
    PlayCounts {
        isrc: String,
        #[command(flatten)]
        args: RunArgs
    }
}

fn parse_genre(raw: &str) -> Result<Genre, EtlError> {
    Genre::parse(raw).ok_or_else(|| EtlError::Config(format!("unknown genre {raw}")))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), EtlError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_pipeline(stage: Option<Stage>, opts: RunOptions) -> Result<(), EtlError> {
    let cfgs = load_config()?;
    let _logger = init_logging(&cfgs.logging)?;
    info!(service = "tunemeld-etl", version = %env!("CARGO_PKG_VERSION"), "starting");

    let db = Arc::new(Persistent::init(&cfgs.persistence.db_url).await?);
    let cache: Arc<dyn KvCache> = db.clone();
    let window = CacheWindow::new(&cfgs.schedule)?;
    let disk = cfgs.persistence.archive_raw.then(|| {
        DiskZstdSink::new(&cfgs.persistence.raw_store_root, cfgs.persistence.zstd_level)
    });
    let collab = Collaborators::live(&cfgs, cache.clone())?;

    let pipeline = Pipeline::new(
        cfgs.concurrency.clone(), cfgs.failure, window, db, cache, disk, collab
    );
    let signal = pipeline.watch_ctrl_c();

    let result = match stage {
        None => pipeline.run_full(&opts).await.map(|(run, _)| run),
        Some(stage) => pipeline.run_stage(stage, &opts).await.map(|(run, _)| run)
    };
    signal.abort();

    let run = result?;
    info!(run_id = %run, "exit");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), EtlError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { args } => run_pipeline(None, args.into()).await,
        Command::Stage { stage, args } => run_pipeline(Some(stage), args.into()).await,
        Command::ClearCache { args } => {
            let (persistence, schedule, logging) = load_local_config();
            let _logger = init_logging(&logging)?;
            let db = Persistent::init(&persistence.db_url).await?;
            let window = CacheWindow::new(&schedule)?;
            let outcome = clear_raw_playlist_cache(&db, &window, Utc::now(), args.force).await?;
            info!(?outcome, "cache.clear.exit");
            Ok(())
        }
        Command::Playlist { genre, service, args } => {
            let (persistence, _, logging) = load_local_config();
            let _logger = init_logging(&logging)?;
            let db = Persistent::init(&persistence.db_url).await?;
            let genre = parse_genre(&genre)?;

            match service {
                Some(raw) => {
                    let service = ServiceName::parse(&raw)
                        .ok_or_else(|| EtlError::Config(format!("unknown service {raw}")))?;
                    let mut view = service_playlist_view(&db, genre, service).await?;
                    if let (Some(v), Some(n)) = (view.as_mut(), args.limit) {
                        v.tracks.truncate(n);
                    }
                    print_json(&view)
                }
                None => {
                    let mut view = playlist_view(&db, genre).await?;
                    if let (Some(v), Some(n)) = (view.as_mut(), args.limit) {
                        v.tracks.truncate(n);
                    }
                    print_json(&view)
                }
            }
        }
        Command::PlayCounts { isrc, .. } => {
            let (persistence, _, logging) = load_local_config();
            let _logger = init_logging(&logging)?;
            let db = Persistent::init(&persistence.db_url).await?;
            let isrc = Isrc::parse(&isrc)
                .ok_or_else(|| EtlError::Config(format!("malformed isrc {isrc}")))?;
            print_json(&play_counts_view(&db, &isrc).await?)
        }
    }
}
