//!
//! src/normalize.rs  Andrew Belles  Oct 9th, 2025
//!
//! Turns a raw chart blob into dense, ISRC-keyed service tracks. Each
//! service shape is parsed into its own variant once; everything after
//! that works on uniform candidates
//!

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::EtlError;
use crate::identity::{IdentityOutcome, IdentityResolver};
use crate::pool::{run_bounded, FailureStats};
use crate::scrape::PageScraper;
use crate::text::clean_text;
use crate::types::{Genre, RawPlaylist, ServiceName, ServiceTrack};

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyRawTrack {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppleRawTrack {
    pub name: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub link: Option<String>
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoundCloudPublisher {
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoundCloudUser {
    #[serde(default)]
    pub name: Option<String>
}

#[derive(Debug, Clone, Deserialize)]
pub struct SoundCloudRawTrack {
    pub title: String,
    #[serde(default)]
    pub publisher: Option<SoundCloudPublisher>,
    #[serde(default)]
    pub user: Option<SoundCloudUser>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default, rename = "artworkUrl")]
    pub artwork_url: Option<String>
}

#[derive(Debug, Deserialize)]
struct SoundCloudItems {
    items: Vec<SoundCloudRawTrack>
}

#[derive(Debug, Deserialize)]
struct SoundCloudPayload {
    tracks: SoundCloudItems
}

/// One variant per raw chart shape
#[derive(Debug, Clone)]
pub enum RawTracks {
    /// Ordered list
    Spotify(Vec<SpotifyRawTrack>),
    /// `album_details` keyed by zero-based index, held as 1-based positions
    AppleMusic(Vec<(u32, AppleRawTrack)>),
    /// `tracks.items[]`
    SoundCloud(Vec<SoundCloudRawTrack>)
}

/// Uniform chart entry before identity resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub position: u32,
    pub name: String,
    pub artist: String,
    pub album: Option<String>,
    pub service_url: Option<String>,
    pub cover_url: Option<String>,
    pub isrc: Option<String>
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn clean_opt(v: Option<String>) -> Option<String> {
    non_empty(v.map(|s| clean_text(&s)))
}

impl RawTracks {
    pub fn parse(service: ServiceName, payload: &Value) -> Result<RawTracks, EtlError> {
        match service {
            ServiceName::Spotify => {
                let list = payload.as_array()
                    .ok_or_else(|| EtlError::Parse("spotify payload is not a list".to_string()))?;
                let tracks = list.iter()
                    .filter_map(|v| match SpotifyRawTrack::deserialize(v) {
                        Ok(t) => Some(t),
                        Err(e) => {
                            warn!(service = "spotify", error = %e, "normalize.skip");
                            None
                        }
                    })
                    .collect();
                Ok(RawTracks::Spotify(tracks))
            }
            ServiceName::AppleMusic => {
                let details = payload.get("album_details")
                    .and_then(Value::as_object)
                    .ok_or_else(|| EtlError::Parse("apple music payload has no album_details".to_string()))?;
                let mut tracks: Vec<(u32, AppleRawTrack)> = details.iter()
                    .filter(|(k, _)| !k.is_empty() && k.chars().all(|c| c.is_ascii_digit()))
                    .filter_map(|(k, v)| {
                        let Some(position) = k.parse::<u32>().ok().and_then(|i| i.checked_add(1)) else {
                            warn!(service = "apple_music", key = %k, "normalize.skip.index");
                            return None
                        };
                        match AppleRawTrack::deserialize(v) {
                            Ok(t) => Some((position, t)),
                            Err(e) => {
                                warn!(service = "apple_music", key = %k, error = %e, "normalize.skip");
                                None
                            }
                        }
                    })
                    .collect();
                tracks.sort_by_key(|(position, _)| *position);
                Ok(RawTracks::AppleMusic(tracks))
            }
            ServiceName::SoundCloud => {
                let parsed = SoundCloudPayload::deserialize(payload)?;
                Ok(RawTracks::SoundCloud(parsed.tracks.items))
            }
            other => Err(EtlError::Parse(format!("{other} has no chart payload")))
        }
    }

    pub fn service(&self) -> ServiceName {
        match self {
            RawTracks::Spotify(_)    => ServiceName::Spotify,
            RawTracks::AppleMusic(_) => ServiceName::AppleMusic,
            RawTracks::SoundCloud(_) => ServiceName::SoundCloud
        }
    }

    /// Cleaned candidates in chart order with 1-based positions
    pub fn candidates(self) -> Vec<Candidate> {
        match self {
            RawTracks::Spotify(list) => list.into_iter().enumerate().map(|(i, t)| {
                let artist = if t.artists.is_empty() {
                    t.artist.unwrap_or_default()
                } else {
                    t.artists.join(", ")
                };
                Candidate {
                    position: i as u32 + 1,
                    name: clean_text(&t.name),
                    artist: clean_text(&artist),
                    album: clean_opt(t.album_name),
                    service_url: non_empty(t.url),
                    cover_url: non_empty(t.cover_url),
                    isrc: non_empty(t.isrc)
                }
            }).collect(),

            RawTracks::AppleMusic(list) => list.into_iter().map(|(position, t)| Candidate {
                position,
                name: clean_text(&t.name),
                artist: clean_text(&t.artist),
                album: clean_opt(t.album),
                service_url: non_empty(t.link),
                cover_url: None,
                isrc: None
            }).collect(),

            RawTracks::SoundCloud(list) => list.into_iter().enumerate().map(|(i, t)| {
                let publisher = t.publisher.unwrap_or_default();
                let uploader = publisher.artist.clone()
                    .or_else(|| t.user.and_then(|u| u.name))
                    .unwrap_or_default();
                // "Artist - Title" uploads carry the artist in the title
                let (artist, name) = match t.title.split_once(" - ") {
                    Some((a, n)) if publisher.artist.is_none() => (a.to_string(), n.to_string()),
                    _ => (uploader, t.title.clone())
                };
                Candidate {
                    position: i as u32 + 1,
                    name: clean_text(&name),
                    artist: clean_text(&artist),
                    album: None,
                    service_url: non_empty(t.permalink),
                    cover_url: non_empty(t.artwork_url),
                    isrc: non_empty(publisher.isrc)
                }
            }).collect()
        }
    }
}

/// Identity outcome tallies for the run summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityCounts {
    pub direct: usize,
    pub cache_hit: usize,
    pub searched: usize,
    pub unresolved: usize,
    pub errors: usize
}

impl IdentityCounts {
    fn record(&mut self, outcome: &Result<IdentityOutcome, EtlError>) {
        match outcome {
            Ok(IdentityOutcome::Direct(_))   => self.direct += 1,
            Ok(IdentityOutcome::CacheHit(_)) => self.cache_hit += 1,
            Ok(IdentityOutcome::Searched(_)) => self.searched += 1,
            Ok(IdentityOutcome::Unresolved)  => self.unresolved += 1,
            Err(_) => self.errors += 1
        }
    }

    pub fn merge(&mut self, other: IdentityCounts) {
        self.direct     += other.direct;
        self.cache_hit  += other.cache_hit;
        self.searched   += other.searched;
        self.unresolved += other.unresolved;
        self.errors     += other.errors;
    }

    pub fn resolved(&self) -> usize {
        self.direct + self.cache_hit + self.searched
    }
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub service: ServiceName,
    pub genre: Genre,
    pub tracks: Vec<ServiceTrack>,
    pub identity: IdentityCounts,
    pub stats: FailureStats
}

impl Normalized {
    pub fn dropped(&self) -> usize {
        self.identity.unresolved + self.identity.errors
    }
}

pub struct Normalizer {
    resolver: Arc<IdentityResolver>,
    scraper: Option<Arc<PageScraper>>,
    workers: usize
}

impl Normalizer {
    /// Without a scraper apple music covers stay empty
    pub fn new(resolver: Arc<IdentityResolver>, scraper: Option<Arc<PageScraper>>, workers: usize) -> Self {
        Self { resolver, scraper, workers }
    }

    pub async fn normalize(
        &self,
        raw: &RawPlaylist,
        limit: Option<usize>,
        cancel: &CancellationToken
    ) -> Result<Normalized, EtlError> {
        let shape = RawTracks::parse(raw.service, &raw.payload)?;
        let service = shape.service();
        let candidates = shape.candidates();
        let found = candidates.len();

        let resolver = self.resolver.clone();
        let results = run_bounded("identity", candidates, self.workers, cancel, move |c: Candidate| {
            let resolver = resolver.clone();
            async move { resolver.resolve(&c.name, &c.artist, c.isrc.as_deref()).await }
        }).await?;

        let mut identity = IdentityCounts::default();
        let mut stats = FailureStats::default();
        let mut kept: Vec<(Candidate, crate::types::Isrc)> = Vec::with_capacity(results.len());
        for (candidate, outcome) in results {
            identity.record(&outcome);
            stats.record(&outcome);
            match outcome {
                Ok(o) => match o.into_isrc() {
                    Some(isrc) => kept.push((candidate, isrc)),
                    None => debug!(
                        service = %service, genre = %raw.genre, title = %candidate.name,
                        artist = %candidate.artist, "normalize.drop"
                    )
                },
                Err(e) => warn!(
                    service = %service, genre = %raw.genre, title = %candidate.name,
                    artist = %candidate.artist, error = %e, "identity.error"
                )
            }
        }

        kept.sort_by_key(|(c, _)| c.position);
        if let Some(n) = limit {
            kept.truncate(n);
        }

        let mut tracks: Vec<ServiceTrack> = kept.into_iter()
            .enumerate()
            .map(|(i, (c, isrc))| ServiceTrack {
                service,
                genre: raw.genre,
                position: i as u32 + 1,
                name: c.name,
                artist: c.artist,
                album: c.album,
                service_url: c.service_url,
                cover_url: c.cover_url,
                isrc
            })
            .collect();

        if service == ServiceName::AppleMusic {
            self.fill_apple_covers(&mut tracks, cancel).await?;
        }

        info!(
            service = %service, genre = %raw.genre, found, kept = tracks.len(),
            unresolved = identity.unresolved, errors = identity.errors, "normalize.done"
        );
        Ok(Normalized { service, genre: raw.genre, tracks, identity, stats })
    }

    async fn fill_apple_covers(&self, tracks: &mut [ServiceTrack], cancel: &CancellationToken) -> Result<(), EtlError> {
        let Some(scraper) = self.scraper.clone() else {
            return Ok(());
        };
        let wanted: Vec<(usize, String)> = tracks.iter()
            .enumerate()
            .filter(|(_, t)| t.cover_url.is_none())
            .filter_map(|(i, t)| t.service_url.clone().map(|u| (i, u)))
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let covers = run_bounded("apple_cover", wanted, self.workers, cancel, move |(_, url): (usize, String)| {
            let scraper = scraper.clone();
            async move { scraper.apple_cover(&url).await }
        }).await?;

        for ((idx, url), cover) in covers {
            match cover {
                Ok(c) => {
                    if let Some(t) = tracks.get_mut(idx) {
                        t.cover_url = Some(c);
                    }
                }
                Err(e) => debug!(url = %url, error = %e, "normalize.apple_cover")
            }
        }
        Ok(())
    }
}
