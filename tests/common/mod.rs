//!
//! tests/common/mod.rs  Andrew Belles  Oct 13th, 2025
//!
//! In-memory collaborators for driving the whole pipeline offline
//!

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use tunemeld_etl::cache::KvCache;
use tunemeld_etl::config::{ConcurrencyConfig, FailureConfig, ScheduleConfig};
use tunemeld_etl::counts::PlayCountSource;
use tunemeld_etl::enrich::{VideoHit, VideoSearch};
use tunemeld_etl::errors::EtlError;
use tunemeld_etl::identity::CatalogSearch;
use tunemeld_etl::persistent::Persistent;
use tunemeld_etl::pipeline::{Collaborators, Pipeline};
use tunemeld_etl::schedule::CacheWindow;
use tunemeld_etl::sources::PlaylistSource;
use tunemeld_etl::types::{Genre, GenreConfig, Isrc, PlaylistMeta, RawPlaylist, ServiceName};

pub const ESPRESSO: &str = "USAAA2500001";
pub const BIRDS: &str = "USAAA2500002";
pub const TASTE: &str = "USAAA2500003";
pub const SPOTIFY_ONLY: &str = "USAAA2500004";
pub const APPLE_ONLY: &str = "USAAA2500005";

/*
 * Charts
 */

pub fn empty_payload(service: ServiceName) -> Value {
    match service {
        ServiceName::Spotify    => json!([]),
        ServiceName::AppleMusic => json!({ "album_details": {} }),
        _ => json!({ "tracks": { "items": [] } })
    }
}

/// Pop charts: Espresso on all three services, Birds on spotify and apple,
/// Taste on spotify and soundcloud, plus single-service noise
pub fn pop_chart(service: ServiceName) -> Value {
    match service {
        ServiceName::Spotify => json!([
            { "name": "Espresso", "artists": ["Sabrina Carpenter"], "album_name": "Espresso",
              "url": "https://open.spotify.com/track/esp", "isrc": ESPRESSO,
              "cover_url": "https://i.scdn.co/image/esp" },
            { "name": "Birds of a Feather", "artists": ["Billie Eilish"],
              "url": "https://open.spotify.com/track/bird", "isrc": BIRDS },
            { "name": "Taste", "artists": ["Sabrina Carpenter"],
              "url": "https://open.spotify.com/track/taste", "isrc": TASTE },
            { "name": "Only Here", "artists": ["Nobody Else"],
              "url": "https://open.spotify.com/track/only", "isrc": SPOTIFY_ONLY }
        ]),
        ServiceName::AppleMusic => json!({
            "album_details": {
                "0": { "name": "Birds of a Feather", "artist": "Billie Eilish",
                       "link": "https://music.apple.com/us/song/bird" },
                "1": { "name": "Espresso", "artist": "Sabrina Carpenter",
                       "link": "https://music.apple.com/us/song/esp" },
                "2": { "name": "Apple Exclusive", "artist": "Someone",
                       "link": "https://music.apple.com/us/song/excl" },
                "playlist_name": "A-List Pop"
            }
        }),
        _ => json!({
            "tracks": { "items": [
                { "title": "Taste", "publisher": { "artist": "Sabrina Carpenter", "isrc": TASTE },
                  "permalink": "https://soundcloud.com/sabrina/taste" },
                { "title": "Espresso", "publisher": { "artist": "Sabrina Carpenter", "isrc": ESPRESSO },
                  "permalink": "https://soundcloud.com/sabrina/espresso" },
                { "title": "Bedroom Producer - Untitled Demo",
                  "permalink": "https://soundcloud.com/bedroom/demo" }
            ]}
        })
    }
}

///
/// Serves canned charts; other genres get empty ones
///
pub struct FakeChart {
    service: ServiceName,
    charts: HashMap<Genre, Value>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize
}

impl FakeChart {
    pub fn pop(service: ServiceName) -> Arc<Self> {
        let mut charts = HashMap::new();
        charts.insert(Genre::Pop, pop_chart(service));
        Arc::new(Self { service, charts, fail: AtomicBool::new(false), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl PlaylistSource for FakeChart {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn fetch(&self, genre: &GenreConfig, _refresh: bool) -> Result<RawPlaylist, EtlError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(EtlError::Upstream { status: 503, message: "chart unavailable".into() });
        }
        let payload = self.charts.get(&genre.genre)
            .cloned()
            .unwrap_or_else(|| empty_payload(self.service));
        Ok(RawPlaylist {
            service: self.service,
            genre: genre.genre,
            meta: PlaylistMeta {
                url: genre.link(self.service).unwrap_or_default().to_string(),
                name: Some(format!("{} {}", self.service, genre.display_name)),
                cover_url: None,
                description: None
            },
            payload
        })
    }
}

/// Finds an isrc when the query mentions a known lowercase title
pub struct FakeCatalog {
    titles: Vec<(&'static str, &'static str)>,
    pub searches: AtomicUsize
}

impl FakeCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            titles: vec![
                ("birds of a feather", BIRDS),
                ("espresso", ESPRESSO),
                ("apple exclusive", APPLE_ONLY)
            ],
            searches: AtomicUsize::new(0)
        })
    }
}

#[async_trait]
impl CatalogSearch for FakeCatalog {
    async fn search_isrc(&self, query: &str) -> Result<Option<Isrc>, EtlError> {
        self.searches.fetch_add(1, Ordering::Relaxed);
        let query = query.to_lowercase();
        Ok(self.titles.iter()
            .find(|(title, _)| query.contains(title))
            .and_then(|(_, isrc)| Isrc::parse(isrc)))
    }

    async fn url_by_isrc(&self, isrc: &Isrc) -> Result<Option<String>, EtlError> {
        Ok(Some(format!("https://open.spotify.com/track/{}", isrc.as_str().to_lowercase())))
    }
}

/// Echoes the query back as the video title unless told to miss
pub struct FakeVideos {
    pub irrelevant: AtomicBool
}

impl FakeVideos {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { irrelevant: AtomicBool::new(false) })
    }
}

#[async_trait]
impl VideoSearch for FakeVideos {
    async fn top_video(&self, query: &str) -> Result<Option<VideoHit>, EtlError> {
        let title = if self.irrelevant.load(Ordering::Relaxed) {
            "Top 100 Workout Mix 2025".to_string()
        } else {
            format!("{} (Official Video)", query.replace('"', ""))
        };
        let video_id = format!("v{:010}", query.len());
        Ok(Some(VideoHit { video_id, title }))
    }
}

/// Same count for every url until bumped
pub struct FakeCounts {
    service: ServiceName,
    count: Mutex<i64>,
    pub fail: AtomicBool
}

impl FakeCounts {
    pub fn new(service: ServiceName, count: i64) -> Arc<Self> {
        Arc::new(Self { service, count: Mutex::new(count), fail: AtomicBool::new(false) })
    }

    pub fn set(&self, count: i64) {
        *self.count.lock().unwrap() = count;
    }
}

#[async_trait]
impl PlayCountSource for FakeCounts {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn play_count(&self, url: &str) -> Result<i64, EtlError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(EtlError::Upstream { status: 500, message: format!("no count for {url}") });
        }
        Ok(*self.count.lock().unwrap())
    }
}

/*
 * Harness
 */

pub struct Harness {
    pub db: Arc<Persistent>,
    pub apple: Arc<FakeChart>,
    pub soundcloud: Arc<FakeChart>,
    pub spotify: Arc<FakeChart>,
    pub catalog: Arc<FakeCatalog>,
    pub videos: Arc<FakeVideos>,
    pub spotify_counts: Arc<FakeCounts>
}

impl Harness {
    pub async fn new() -> Self {
        Self {
            db: Arc::new(Persistent::init("sqlite::memory:").await.unwrap()),
            apple: FakeChart::pop(ServiceName::AppleMusic),
            soundcloud: FakeChart::pop(ServiceName::SoundCloud),
            spotify: FakeChart::pop(ServiceName::Spotify),
            catalog: FakeCatalog::new(),
            videos: FakeVideos::new(),
            spotify_counts: FakeCounts::new(ServiceName::Spotify, 1_000)
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(FailureConfig::default())
    }

    pub fn pipeline_with(&self, failure: FailureConfig) -> Pipeline {
        let cache: Arc<dyn KvCache> = self.db.clone();
        let collab = Collaborators {
            sources: vec![self.apple.clone(), self.soundcloud.clone(), self.spotify.clone()],
            catalog: self.catalog.clone(),
            video: self.videos.clone(),
            play_counts: vec![
                self.spotify_counts.clone(),
                FakeCounts::new(ServiceName::YouTube, 500),
                FakeCounts::new(ServiceName::SoundCloud, 250)
            ],
            scraper: None
        };
        Pipeline::new(
            ConcurrencyConfig::default(),
            failure,
            CacheWindow::new(&ScheduleConfig::default()).unwrap(),
            self.db.clone(),
            cache,
            None,
            collab
        )
    }
}
