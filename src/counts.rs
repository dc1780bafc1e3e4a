//!
//! src/counts.rs  Andrew Belles  Oct 11th, 2025
//!
//! Daily play/view count snapshots and their week-over-week deltas.
//! Snapshots are keyed by (isrc, service, day) so a re-run on the same day
//! overwrites instead of appending
//!

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{cached, CachePrefix, KvCache};
use crate::errors::EtlError;
use crate::fetch::{youtube_video_id, YouTubeClient};
use crate::persistent::Persistent;
use crate::pool::{run_bounded, FailureStats};
use crate::scrape::PageScraper;
use crate::types::{AggregateCount, CanonicalTrack, Isrc, PlayCountSnapshot, RunId, ServiceName};

pub const COMPARISON_DAYS: u64 = 7;

#[async_trait]
pub trait PlayCountSource: Send + Sync {
    fn service(&self) -> ServiceName;

    async fn play_count(&self, url: &str) -> Result<i64, EtlError>;
}

///
/// Video views from the youtube statistics endpoint, cached for a day
///
pub struct YouTubeViews {
    client: Arc<YouTubeClient>,
    cache: Arc<dyn KvCache>
}

impl YouTubeViews {
    pub fn new(client: Arc<YouTubeClient>, cache: Arc<dyn KvCache>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl PlayCountSource for YouTubeViews {
    fn service(&self) -> ServiceName {
        ServiceName::YouTube
    }

    async fn play_count(&self, url: &str) -> Result<i64, EtlError> {
        let id = youtube_video_id(url)
            .ok_or_else(|| EtlError::Parse(format!("no video id in {url}")))?;
        let id = id.as_str();
        let views = cached(self.cache.as_ref(), CachePrefix::YouTubeViews, id, false, move || async move {
            let body = self.client.get_json(self.client.statistics(id)?, "youtube.statistics").await?;
            // viewCount arrives as a decimal string
            body.pointer("/items/0/statistics/viewCount")
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<i64>().ok(),
                    other => other.as_i64()
                })
                .ok_or_else(|| EtlError::NotFound(format!("no statistics for video {id}")))
        }).await?;
        Ok(views.value)
    }
}

///
/// Public play counts scraped from spotify and soundcloud track pages
///
pub struct ScrapedPlayCount {
    service: ServiceName,
    scraper: Arc<PageScraper>
}

impl ScrapedPlayCount {
    pub fn new(service: ServiceName, scraper: Arc<PageScraper>) -> Self {
        Self { service, scraper }
    }
}

#[async_trait]
impl PlayCountSource for ScrapedPlayCount {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn play_count(&self, url: &str) -> Result<i64, EtlError> {
        self.scraper.play_count(self.service, url).await
    }
}

fn pct_change(current: i64, comparison: i64) -> f64 {
    if comparison == 0 {
        if current > 0 { 100.0 } else { 0.0 }
    } else {
        (current - comparison) as f64 / comparison as f64 * 100.0
    }
}

fn delta_row(
    isrc: &Isrc,
    service: ServiceName,
    today: NaiveDate,
    current: i64,
    comparison_day: NaiveDate,
    comparison: i64
) -> AggregateCount {
    AggregateCount {
        isrc: isrc.clone(),
        service,
        day: today,
        current,
        comparison_day,
        comparison,
        abs_change: current - comparison,
        pct_change: pct_change(current, comparison)
    }
}

/// Per-service and total deltas for one isrc. Services without a snapshot on
/// `today` are skipped; the comparison is the snapshot a week earlier, else
/// the earliest one on record
pub fn compute_deltas(isrc: &Isrc, history: &[PlayCountSnapshot], today: NaiveDate) -> Vec<AggregateCount> {
    let mut by_service: BTreeMap<ServiceName, BTreeMap<NaiveDate, i64>> = BTreeMap::new();
    for s in history.iter().filter(|s| &s.isrc == isrc && s.day <= today) {
        by_service.entry(s.service).or_default().insert(s.day, s.count);
    }

    let week_ago = today.checked_sub_days(Days::new(COMPARISON_DAYS));
    let mut rows = Vec::new();
    for (service, days) in &by_service {
        let Some(&current) = days.get(&today) else {
            continue;
        };
        let (comparison_day, comparison) = week_ago
            .and_then(|d| days.get(&d).map(|c| (d, *c)))
            .or_else(|| days.iter().next().map(|(d, c)| (*d, *c)))
            .unwrap_or((today, current));
        rows.push(delta_row(isrc, *service, today, current, comparison_day, comparison));
    }

    if !rows.is_empty() {
        let current: i64 = rows.iter().map(|r| r.current).sum();
        let comparison: i64 = rows.iter().map(|r| r.comparison).sum();
        let comparison_day = rows.iter().map(|r| r.comparison_day).min().unwrap_or(today);
        rows.push(delta_row(isrc, ServiceName::Total, today, current, comparison_day, comparison));
    }
    rows
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayCountReport {
    pub tracks: usize,
    pub fetched: usize,
    pub failed: usize,
    pub aggregated: usize,
    pub stats: FailureStats
}

#[derive(Clone)]
struct CountJob {
    isrc: Isrc,
    url: String,
    source: Arc<dyn PlayCountSource>
}

fn jobs_for(tracks: &[CanonicalTrack], sources: &[Arc<dyn PlayCountSource>]) -> Vec<CountJob> {
    tracks.iter()
        .flat_map(|t| sources.iter().filter_map(move |s| {
            t.url_for(s.service()).map(|url| CountJob {
                isrc: t.isrc.clone(),
                url: url.to_string(),
                source: s.clone()
            })
        }))
        .collect()
}

/// Snapshots today's counts for the run's consensus tracks, then recomputes
/// deltas for every isrc counted today
pub async fn collect_play_counts(
    db: &Persistent,
    run: &RunId,
    sources: &[Arc<dyn PlayCountSource>],
    workers: usize,
    limit: Option<usize>,
    today: NaiveDate,
    cancel: &CancellationToken
) -> Result<PlayCountReport, EtlError> {
    let isrcs = db.consensus_isrcs(run).await?;
    let mut tracks = db.canonical_tracks(&isrcs).await?;
    if let Some(n) = limit {
        tracks.truncate(n);
    }

    let jobs = jobs_for(&tracks, sources);
    let results = run_bounded("play_counts", jobs, workers, cancel, |job: CountJob| async move {
        job.source.play_count(&job.url).await
    }).await?;

    let mut report = PlayCountReport { tracks: tracks.len(), ..Default::default() };
    for (job, result) in results {
        report.stats.record(&result);
        let service = job.source.service();
        match result {
            Ok(count) => {
                db.upsert_snapshot(&PlayCountSnapshot { isrc: job.isrc, service, day: today, count }).await?;
                report.fetched += 1;
            }
            Err(e) => {
                warn!(isrc = %job.isrc, service = %service, url = %job.url, error = %e, "play_count.failed");
                report.failed += 1;
            }
        }
    }

    for isrc in db.isrcs_with_snapshot_on(today).await? {
        let history = db.snapshots_for(&isrc).await?;
        let rows = compute_deltas(&isrc, &history, today);
        debug!(isrc = %isrc, rows = rows.len(), "play_count.deltas");
        db.replace_aggregates(&isrc, today, &rows).await?;
        report.aggregated += 1;
    }

    info!(
        tracks = report.tracks, fetched = report.fetched, failed = report.failed,
        aggregated = report.aggregated, "play_count.done"
    );
    Ok(report)
}
