//!
//! src/pipeline.rs  Andrew Belles  Oct 12th, 2025
//!
//! Drives one etl run: extract, normalize, canonical, aggregate, youtube
//! and play counts, in that order. A run only retires the previous dataset
//! after every stage succeeded; a fatal error discards the run's own rows
//!

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::aggregate::aggregate_genre;
use crate::cache::KvCache;
use crate::config::{AppConfig, ConcurrencyConfig, FailureConfig};
use crate::counts::{collect_play_counts, PlayCountReport, PlayCountSource, ScrapedPlayCount, YouTubeViews};
use crate::enrich::{build_canonical, resolve_youtube, CanonicalReport, VideoSearch, YouTubeReport, YouTubeResolver, YouTubeSearch};
use crate::errors::EtlError;
use crate::fetch::{RapidApiClient, SpotifyClient, YouTubeClient};
use crate::identity::{CatalogSearch, IdentityResolver, SpotifyCatalog};
use crate::normalize::{IdentityCounts, Normalizer};
use crate::persistent::Persistent;
use crate::pool::{run_bounded, FailureStats};
use crate::schedule::{clear_raw_playlist_cache, CacheWindow, ClearOutcome};
use crate::scrape::PageScraper;
use crate::sink::DiskZstdSink;
use crate::sources::{PlaylistSource, RapidApiChartSource, SpotifyPlaylistSource};
use crate::types::{Genre, GenreConfig, Registry, RunId, ServiceName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum Stage {
    Extract,
    Normalize,
    Canonical,
    Aggregate,
    #[value(name = "youtube")]
    YouTube,
    PlayCounts
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Extract, Stage::Normalize, Stage::Canonical,
        Stage::Aggregate, Stage::YouTube, Stage::PlayCounts
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extract    => "extract",
            Stage::Normalize  => "normalize",
            Stage::Canonical  => "canonical",
            Stage::Aggregate  => "aggregate",
            Stage::YouTube    => "youtube",
            Stage::PlayCounts => "play_counts"
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Caps tracks per payload, youtube lookups and play count tracks
    pub limit: Option<usize>,
    /// Bypasses raw cache reads and the cache window
    pub force: bool
}

/// Counters logged at the end of every run
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub cache_cleared: Option<u64>,
    pub payloads: usize,
    pub tracks_kept: usize,
    pub tracks_dropped: usize,
    pub identity: IdentityCounts,
    pub consensus: BTreeMap<Genre, usize>,
    pub canonical: CanonicalReport,
    pub youtube: YouTubeReport,
    pub play_counts: PlayCountReport
}

impl RunStats {
    fn log(&self, run: &RunId, elapsed_ms: u128) {
        let consensus: Vec<String> = self.consensus.iter().map(|(g, n)| format!("{g}={n}")).collect();
        info!(
            run_id = %run,
            elapsed_ms = elapsed_ms as u64,
            cache_cleared = ?self.cache_cleared,
            payloads = self.payloads,
            tracks_kept = self.tracks_kept,
            tracks_dropped = self.tracks_dropped,
            identity_direct = self.identity.direct,
            identity_cache_hit = self.identity.cache_hit,
            identity_searched = self.identity.searched,
            identity_unresolved = self.identity.unresolved,
            identity_errors = self.identity.errors,
            consensus = %consensus.join(","),
            canonical = self.canonical.upserted,
            youtube_cache_hit = self.youtube.cache_hit,
            youtube_api_success = self.youtube.api_success,
            youtube_not_found = self.youtube.not_found,
            youtube_quota = self.youtube.quota,
            youtube_errors = self.youtube.errors,
            counts_fetched = self.play_counts.fetched,
            counts_failed = self.play_counts.failed,
            "etl.summary"
        );
    }
}

///
/// External collaborators behind their trait seams
///
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Vec<Arc<dyn PlaylistSource>>,
    pub catalog: Arc<dyn CatalogSearch>,
    pub video: Arc<dyn VideoSearch>,
    pub play_counts: Vec<Arc<dyn PlayCountSource>>,
    pub scraper: Option<Arc<PageScraper>>
}

impl Collaborators {
    /// Real http clients for every service
    pub fn live(cfg: &AppConfig, cache: Arc<dyn KvCache>) -> Result<Self, EtlError> {
        let spotify  = Arc::new(SpotifyClient::new(&cfg.http, &cfg.spotify)?);
        let rapidapi = Arc::new(RapidApiClient::new(&cfg.http, &cfg.rapidapi)?);
        let youtube  = Arc::new(YouTubeClient::new(&cfg.http, &cfg.youtube)?);
        let scraper  = Arc::new(PageScraper::new(&cfg.http, cfg.concurrency.scrape_sessions, cache.clone()));

        let sources: Vec<Arc<dyn PlaylistSource>> = vec![
            Arc::new(RapidApiChartSource::new(ServiceName::AppleMusic, rapidapi.clone(), scraper.clone(), cache.clone())?),
            Arc::new(RapidApiChartSource::new(ServiceName::SoundCloud, rapidapi, scraper.clone(), cache.clone())?),
            Arc::new(SpotifyPlaylistSource::new(spotify.clone(), cache.clone()))
        ];
        let play_counts: Vec<Arc<dyn PlayCountSource>> = vec![
            Arc::new(ScrapedPlayCount::new(ServiceName::Spotify, scraper.clone())),
            Arc::new(YouTubeViews::new(youtube.clone(), cache)),
            Arc::new(ScrapedPlayCount::new(ServiceName::SoundCloud, scraper.clone()))
        ];

        Ok( Self {
            sources,
            catalog: Arc::new(SpotifyCatalog::new(spotify)),
            video: Arc::new(YouTubeSearch::new(youtube)),
            play_counts,
            scraper: Some(scraper)
        })
    }
}

pub struct Pipeline {
    concurrency: ConcurrencyConfig,
    failure: FailureConfig,
    window: CacheWindow,
    db: Arc<Persistent>,
    cache: Arc<dyn KvCache>,
    sink: Option<Arc<DiskZstdSink>>,
    collab: Collaborators,
    shutdown: CancellationToken
}

impl Pipeline {
    pub fn new(
        concurrency: ConcurrencyConfig,
        failure: FailureConfig,
        window: CacheWindow,
        db: Arc<Persistent>,
        cache: Arc<dyn KvCache>,
        sink: Option<DiskZstdSink>,
        collab: Collaborators
    ) -> Self {
        Self {
            concurrency,
            failure,
            window,
            db,
            cache,
            sink: sink.map(Arc::new),
            collab,
            shutdown: CancellationToken::new()
        }
    }

    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels the pipeline on ctrl-c
    pub fn watch_ctrl_c(&self) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(msg = "cancelling etl run", "etl.signal");
                shutdown.cancel();
            }
        })
    }

    pub async fn clear_cache(&self, force: bool) -> Result<ClearOutcome, EtlError> {
        clear_raw_playlist_cache(self.cache.as_ref(), &self.window, Utc::now(), force).await
    }

    /// Full run with publication. Returns the run id on success
    pub async fn run_full(&self, opts: &RunOptions) -> Result<(RunId, RunStats), EtlError> {
        let run = RunId::mint();
        let span = info_span!("etl.run", run_id = %run);
        let started = Instant::now();

        async {
            info!(limit = ?opts.limit, force = opts.force, "etl.start");
            match self.all_stages(&run, opts).await {
                Ok(stats) => {
                    let retired = self.db.retire_other_runs(&run).await?;
                    info!(retired, "etl.publish");
                    stats.log(&run, started.elapsed().as_millis());
                    Ok((run.clone(), stats))
                }
                Err(e) => {
                    error!(error = %e, fatal = e.is_fatal(), "etl.failed");
                    match self.db.discard_run(&run).await {
                        Ok(discarded) => warn!(discarded, "etl.discard"),
                        Err(de) => error!(error = %de, "etl.discard.failed")
                    }
                    Err(e)
                }
            }
        }.instrument(span).await
    }

    async fn all_stages(&self, run: &RunId, opts: &RunOptions) -> Result<RunStats, EtlError> {
        let mut stats = RunStats::default();
        if let ClearOutcome::Cleared { entries } = self.clear_cache(opts.force).await? {
            stats.cache_cleared = Some(entries);
        }
        for stage in Stage::ALL {
            self.stage(stage, run, opts, &mut stats).await?;
        }
        Ok(stats)
    }

    /// A single stage without publication. Extract mints a fresh run; every
    /// other stage continues the newest run on record
    pub async fn run_stage(&self, stage: Stage, opts: &RunOptions) -> Result<(RunId, RunStats), EtlError> {
        let run = match stage {
            Stage::Extract => RunId::mint(),
            _ => self.db.run_ids().await?
                .pop()
                .ok_or_else(|| EtlError::Config(format!("no run to continue for stage {}", stage.as_str())))?
        };
        let span = info_span!("etl.run", run_id = %run);
        let mut stats = RunStats::default();
        self.stage(stage, &run, opts, &mut stats).instrument(span).await?;
        Ok((run, stats))
    }

    async fn stage(&self, stage: Stage, run: &RunId, opts: &RunOptions, stats: &mut RunStats) -> Result<(), EtlError> {
        if self.shutdown.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        let span = info_span!("etl.stage", stage = stage.as_str());
        async {
            let started = Instant::now();
            info!("stage.start");
            match stage {
                Stage::Extract    => self.extract(run, opts, stats).await?,
                Stage::Normalize  => self.normalize(run, opts, stats).await?,
                Stage::Canonical  => {
                    stats.canonical = build_canonical(
                        &self.db, run, self.collab.catalog.clone(),
                        self.concurrency.canonical_workers, &self.shutdown
                    ).await?;
                }
                Stage::Aggregate  => {
                    for genre in Registry.genres() {
                        let report = aggregate_genre(&self.db, run, genre).await?;
                        stats.consensus.insert(genre.genre, report.entries);
                    }
                }
                Stage::YouTube    => {
                    let resolver = Arc::new(YouTubeResolver::new(self.collab.video.clone(), self.cache.clone()));
                    let report = resolve_youtube(
                        &self.db, run, resolver, self.concurrency.youtube_workers, opts.limit, &self.shutdown
                    ).await?;
                    stats.youtube = report;
                    report.stats.check(stage.as_str(), &self.failure)?;
                }
                Stage::PlayCounts => {
                    let report = collect_play_counts(
                        &self.db, run, &self.collab.play_counts, self.concurrency.play_count_workers,
                        opts.limit, Utc::now().date_naive(), &self.shutdown
                    ).await?;
                    stats.play_counts = report;
                    report.stats.check(stage.as_str(), &self.failure)?;
                }
            }
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "stage.done");
            Ok::<_, EtlError>(())
        }.instrument(span).await
    }

    async fn extract(&self, run: &RunId, opts: &RunOptions, stats: &mut RunStats) -> Result<(), EtlError> {
        let matrix: Vec<(&'static GenreConfig, Arc<dyn PlaylistSource>)> = Registry.genres()
            .flat_map(|g| self.collab.sources.iter().map(move |s| (g, s.clone())))
            .collect();

        let refresh = opts.force;
        let results = run_bounded(
            "extract", matrix, self.concurrency.extract_workers, &self.shutdown,
            move |(genre, source): (&'static GenreConfig, Arc<dyn PlaylistSource>)| async move {
                source.fetch(genre, refresh).await
            }
        ).await?;

        let mut failures = FailureStats::default();
        for ((genre, source), result) in results {
            failures.record(&result);
            match result {
                Ok(raw) => {
                    self.db.insert_raw_playlist(run, &raw).await?;
                    if let Some(sink) = &self.sink {
                        if let Err(e) = sink.write_playlist(run, &raw) {
                            warn!(service = %raw.service, genre = %raw.genre, error = %e, "extract.archive");
                        }
                    }
                    stats.payloads += 1;
                }
                Err(e) => error!(
                    service = %source.service(), genre = %genre.genre, error = %e, "extract.failed"
                )
            }
        }

        // every (genre, service) chart is required for a publishable run
        if failures.failed > 0 {
            return Err(EtlError::FailureRate {
                stage: Stage::Extract.as_str().to_string(),
                failed: failures.failed,
                total: failures.total
            });
        }
        Ok(())
    }

    async fn normalize(&self, run: &RunId, opts: &RunOptions, stats: &mut RunStats) -> Result<(), EtlError> {
        let resolver = Arc::new(IdentityResolver::new(self.collab.catalog.clone(), self.cache.clone()));
        let normalizer = Normalizer::new(resolver, self.collab.scraper.clone(), self.concurrency.identity_workers);

        let mut failures = FailureStats::default();
        for raw in self.db.raw_playlists(run).await? {
            let out = normalizer.normalize(&raw, opts.limit, &self.shutdown).await?;
            self.db.replace_service_tracks(run, out.service, out.genre, &out.tracks).await?;

            stats.tracks_kept += out.tracks.len();
            stats.tracks_dropped += out.dropped();
            stats.identity.merge(out.identity);
            failures.merge(out.stats);
        }
        failures.check(Stage::Normalize.as_str(), &self.failure)
    }
}
