//!
//! src/enrich.rs  Andrew Belles  Oct 11th, 2025
//!
//! Canonical track upserts and youtube url resolution. Canonical rows are
//! global per isrc; the metadata comes from the highest priority service
//! that charted the track in this run
//!

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{cached, CachePrefix, KvCache};
use crate::errors::EtlError;
use crate::fetch::{youtube_watch_url, YouTubeClient};
use crate::identity::CatalogSearch;
use crate::persistent::Persistent;
use crate::pool::{run_bounded, FailureStats};
use crate::text::{clean_text, hit_matches, search_key};
use crate::types::{CanonicalTrack, Isrc, RunId, ServiceName, ServiceTrack};

/// Canonical record from every service track sharing one isrc
pub fn canonical_from(members: &[&ServiceTrack], now: DateTime<Utc>) -> Option<CanonicalTrack> {
    let primary = ServiceName::METADATA_PRIORITY.iter()
        .find_map(|svc| members.iter().filter(|t| t.service == *svc).min_by_key(|t| t.position))?;

    let url = |svc: ServiceName| members.iter()
        .filter(|t| t.service == svc)
        .find_map(|t| t.service_url.clone());

    Some(CanonicalTrack {
        isrc: primary.isrc.clone(),
        name: primary.name.clone(),
        artist: primary.artist.clone(),
        album: primary.album.clone().or_else(|| members.iter().find_map(|t| t.album.clone())),
        cover_url: primary.cover_url.clone().or_else(|| members.iter().find_map(|t| t.cover_url.clone())),
        spotify_url: url(ServiceName::Spotify),
        apple_music_url: url(ServiceName::AppleMusic),
        soundcloud_url: url(ServiceName::SoundCloud),
        youtube_url: None,
        updated_at: now
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanonicalReport {
    pub upserted: usize,
    pub spotify_backfilled: usize,
    pub spotify_missing: usize
}

/// Upserts a canonical track for every isrc in the run. Missing spotify urls
/// are looked up by isrc, best effort
pub async fn build_canonical(
    db: &Persistent,
    run: &RunId,
    catalog: Arc<dyn CatalogSearch>,
    workers: usize,
    cancel: &CancellationToken
) -> Result<CanonicalReport, EtlError> {
    let tracks = db.all_service_tracks(run).await?;
    let mut groups: BTreeMap<&Isrc, Vec<&ServiceTrack>> = BTreeMap::new();
    for t in &tracks {
        groups.entry(&t.isrc).or_default().push(t);
    }

    let now = Utc::now();
    let canon: Vec<CanonicalTrack> = groups.values()
        .filter_map(|members| canonical_from(members, now))
        .collect();

    let results = run_bounded("canonical", canon, workers, cancel, move |mut track: CanonicalTrack| {
        let catalog = catalog.clone();
        async move {
            if track.spotify_url.is_some() {
                return Ok::<_, EtlError>((track, false));
            }
            match catalog.url_by_isrc(&track.isrc).await {
                Ok(found) => {
                    let filled = found.is_some();
                    track.spotify_url = found;
                    Ok((track, filled))
                }
                Err(e) => {
                    debug!(isrc = %track.isrc, error = %e, "canonical.spotify_backfill");
                    Ok((track, false))
                }
            }
        }
    }).await?;

    let mut report = CanonicalReport::default();
    for (_, result) in results {
        let (track, filled) = result?;
        if filled {
            report.spotify_backfilled += 1;
        }
        if track.spotify_url.is_none() {
            report.spotify_missing += 1;
        }
        db.upsert_canonical(&track).await?;
        report.upserted += 1;
    }

    info!(
        upserted = report.upserted, backfilled = report.spotify_backfilled,
        missing = report.spotify_missing, "canonical.done"
    );
    Ok(report)
}

/// Top search hit from a video platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHit {
    pub video_id: String,
    pub title: String
}

#[async_trait]
pub trait VideoSearch: Send + Sync {
    async fn top_video(&self, query: &str) -> Result<Option<VideoHit>, EtlError>;
}

pub struct YouTubeSearch {
    client: Arc<YouTubeClient>
}

impl YouTubeSearch {
    pub fn new(client: Arc<YouTubeClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VideoSearch for YouTubeSearch {
    async fn top_video(&self, query: &str) -> Result<Option<VideoHit>, EtlError> {
        let body = self.client.get_json(self.client.search(query)?, "youtube.search").await?;
        let Some(item) = body.pointer("/items/0") else {
            return Ok(None);
        };
        let video_id = item.pointer("/id/videoId").and_then(Value::as_str);
        let title = item.pointer("/snippet/title").and_then(Value::as_str).unwrap_or_default();
        Ok(video_id.map(|id| VideoHit { video_id: id.to_string(), title: clean_text(title) }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YouTubeOutcome {
    CacheHit(String),
    ApiSuccess(String),
    NotFound,
    QuotaExceeded,
    Error(String)
}

impl YouTubeOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            YouTubeOutcome::CacheHit(u) | YouTubeOutcome::ApiSuccess(u) => Some(u),
            _ => None
        }
    }
}

pub fn youtube_query(title: &str, artist: &str) -> String {
    format!("\"{title}\" \"{artist}\"")
}

pub struct YouTubeResolver {
    search: Arc<dyn VideoSearch>,
    cache: Arc<dyn KvCache>,
    quota_hit: AtomicBool
}

impl YouTubeResolver {
    pub fn new(search: Arc<dyn VideoSearch>, cache: Arc<dyn KvCache>) -> Self {
        Self { search, cache, quota_hit: AtomicBool::new(false) }
    }

    pub async fn resolve(&self, title: &str, artist: &str) -> YouTubeOutcome {
        let key = search_key(title, artist);
        let quota_hit = &self.quota_hit;
        let lookup = cached(self.cache.as_ref(), CachePrefix::YouTubeUrl, &key, false, move || async move {
            // once the daily quota is gone every further search would fail the same way
            if quota_hit.load(Ordering::Relaxed) {
                return Err(EtlError::QuotaExceeded("youtube quota already exhausted".to_string()));
            }
            let hit = self.search.top_video(&youtube_query(title, artist)).await?
                .ok_or_else(|| EtlError::NotFound(format!("no video for {title} by {artist}")))?;
            if !hit_matches(&hit.title, title, artist) {
                debug!(title, artist, hit = %hit.title, "youtube.irrelevant");
                return Err(EtlError::NotFound(format!("irrelevant video {}", hit.video_id)));
            }
            Ok(youtube_watch_url(&hit.video_id))
        }).await;

        match lookup {
            Ok(found) if found.hit => YouTubeOutcome::CacheHit(found.value),
            Ok(found) => YouTubeOutcome::ApiSuccess(found.value),
            Err(EtlError::NotFound(_)) => YouTubeOutcome::NotFound,
            Err(e) if e.is_quota() => {
                if !self.quota_hit.swap(true, Ordering::Relaxed) {
                    warn!(title, artist, error = %e, "youtube.quota");
                }
                YouTubeOutcome::QuotaExceeded
            }
            Err(e) => {
                warn!(title, artist, error = %e, "youtube.error");
                YouTubeOutcome::Error(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YouTubeReport {
    pub cache_hit: usize,
    pub api_success: usize,
    pub not_found: usize,
    pub quota: usize,
    pub errors: usize,
    pub stats: FailureStats
}

impl YouTubeReport {
    fn record(&mut self, outcome: &YouTubeOutcome) {
        match outcome {
            YouTubeOutcome::CacheHit(_)   => self.cache_hit += 1,
            YouTubeOutcome::ApiSuccess(_) => self.api_success += 1,
            YouTubeOutcome::NotFound      => self.not_found += 1,
            YouTubeOutcome::QuotaExceeded => self.quota += 1,
            YouTubeOutcome::Error(_)      => self.errors += 1
        }
        match outcome {
            YouTubeOutcome::QuotaExceeded => self.stats.record_failure(true),
            YouTubeOutcome::Error(_) => self.stats.record_failure(false),
            _ => self.stats.record_success()
        }
    }
}

/// Resolves youtube urls for the run's consensus tracks that lack one
pub async fn resolve_youtube(
    db: &Persistent,
    run: &RunId,
    resolver: Arc<YouTubeResolver>,
    workers: usize,
    limit: Option<usize>,
    cancel: &CancellationToken
) -> Result<YouTubeReport, EtlError> {
    let mut pending = db.consensus_missing_youtube(run).await?;
    if let Some(n) = limit {
        pending.truncate(n);
    }

    let results = run_bounded("youtube", pending, workers, cancel, move |t: CanonicalTrack| {
        let resolver = resolver.clone();
        async move { Ok::<_, EtlError>(resolver.resolve(&t.name, &t.artist).await) }
    }).await?;

    let mut report = YouTubeReport::default();
    for (track, outcome) in results {
        let outcome = outcome.unwrap_or_else(|e| YouTubeOutcome::Error(e.to_string()));
        report.record(&outcome);
        if let Some(url) = outcome.url() {
            db.set_youtube_url(&track.isrc, url).await?;
        }
    }

    info!(
        cache_hit = report.cache_hit, api_success = report.api_success,
        not_found = report.not_found, quota = report.quota, errors = report.errors,
        "youtube.done"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::types::Genre;
    use std::sync::atomic::AtomicUsize;

    struct FixedVideo {
        hit: Result<Option<VideoHit>, &'static str>,
        calls: AtomicUsize
    }

    impl FixedVideo {
        fn new(hit: Result<Option<VideoHit>, &'static str>) -> Self {
            Self { hit, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl VideoSearch for FixedVideo {
        async fn top_video(&self, _query: &str) -> Result<Option<VideoHit>, EtlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.hit {
                Ok(h) => Ok(h.clone()),
                Err("quota") => Err(EtlError::QuotaExceeded("daily".into())),
                Err(m) => Err(EtlError::Upstream { status: 400, message: m.to_string() })
            }
        }
    }

    fn hit(id: &str, title: &str) -> Option<VideoHit> {
        Some(VideoHit { video_id: id.into(), title: title.into() })
    }

    #[tokio::test]
    async fn relevant_hit_is_accepted_then_cached() {
        let search = Arc::new(FixedVideo::new(Ok(hit("abc", "Sabrina Carpenter - Espresso (Official Video)"))));
        let resolver = YouTubeResolver::new(search.clone(), Arc::new(MemoryCache::new()));

        let first = resolver.resolve("Espresso", "Sabrina Carpenter").await;
        assert_eq!(first, YouTubeOutcome::ApiSuccess("https://www.youtube.com/watch?v=abc".into()));
        let second = resolver.resolve("Espresso", "Sabrina Carpenter").await;
        assert!(matches!(second, YouTubeOutcome::CacheHit(_)));
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn irrelevant_hit_is_not_found_and_not_cached() {
        let search = Arc::new(FixedVideo::new(Ok(hit("zzz", "Lofi beats to study to"))));
        let cache = Arc::new(MemoryCache::new());
        let resolver = YouTubeResolver::new(search, cache.clone());
        assert_eq!(resolver.resolve("Espresso", "Sabrina Carpenter").await, YouTubeOutcome::NotFound);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn quota_short_circuits_later_searches() {
        let search = Arc::new(FixedVideo::new(Err("quota")));
        let resolver = YouTubeResolver::new(search.clone(), Arc::new(MemoryCache::new()));
        assert_eq!(resolver.resolve("A", "B").await, YouTubeOutcome::QuotaExceeded);
        assert_eq!(resolver.resolve("C", "D").await, YouTubeOutcome::QuotaExceeded);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_failures_are_errors() {
        let search = Arc::new(FixedVideo::new(Err("bad request")));
        let resolver = YouTubeResolver::new(search, Arc::new(MemoryCache::new()));
        assert!(matches!(resolver.resolve("A", "B").await, YouTubeOutcome::Error(_)));
    }

    #[test]
    fn canonical_prefers_spotify_metadata() {
        let mk = |service, name: &str, url: Option<&str>| ServiceTrack {
            service,
            genre: Genre::Rap,
            position: 1,
            name: name.into(),
            artist: "x".into(),
            album: None,
            service_url: url.map(str::to_string),
            cover_url: None,
            isrc: Isrc::parse("USAAA2400001").unwrap()
        };
        let apple = mk(ServiceName::AppleMusic, "Apple Title", Some("https://music.apple.com/1"));
        let spotify = mk(ServiceName::Spotify, "Spotify Title", None);
        let canon = canonical_from(&[&apple, &spotify], Utc::now()).unwrap();
        assert_eq!(canon.name, "Spotify Title");
        assert_eq!(canon.apple_music_url.as_deref(), Some("https://music.apple.com/1"));
        assert!(canon.spotify_url.is_none());
    }

    #[test]
    fn query_quotes_both_fields() {
        assert_eq!(youtube_query("Espresso", "Sabrina Carpenter"), "\"Espresso\" \"Sabrina Carpenter\"");
    }
}
