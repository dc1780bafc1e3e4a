//!
//! src/sources.rs  Andrew Belles  Oct 8th, 2025
//!
//! Chart sources: one per primary service, each able to fetch the raw
//! track blob plus playlist metadata for a genre. Fetched charts are
//! cached for a week under the raw playlist prefixes
//!

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::cache::{cached, CachePrefix, KvCache};
use crate::errors::EtlError;
use crate::fetch::{RapidApiClient, SpotifyClient};
use crate::scrape::PageScraper;
use crate::types::{GenreConfig, PlaylistMeta, RawPlaylist, ServiceName};

/// Upper bound on spotify pages pulled for one chart
const SPOTIFY_MAX_PAGES: u32 = 10;

#[async_trait]
pub trait PlaylistSource: Send + Sync {
    fn service(&self) -> ServiceName;

    /// `refresh` bypasses the raw cache read
    async fn fetch(&self, genre: &GenreConfig, refresh: bool) -> Result<RawPlaylist, EtlError>;
}

/// Cached form of a fetched chart
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchedChart {
    meta: PlaylistMeta,
    payload: Value
}

fn playlist_link(genre: &GenreConfig, service: ServiceName) -> Result<&'static str, EtlError> {
    genre.link(service)
        .ok_or_else(|| EtlError::Config(format!("no {service} playlist for {}", genre.genre)))
}

///
/// Apple Music and SoundCloud through the RapidAPI proxies, with metadata
/// scraped from the public playlist page
///
pub struct RapidApiChartSource {
    service: ServiceName,
    client: Arc<RapidApiClient>,
    scraper: Arc<PageScraper>,
    cache: Arc<dyn KvCache>
}

impl RapidApiChartSource {
    pub fn new(
        service: ServiceName,
        client: Arc<RapidApiClient>,
        scraper: Arc<PageScraper>,
        cache: Arc<dyn KvCache>
    ) -> Result<Self, EtlError> {
        if !matches!(service, ServiceName::AppleMusic | ServiceName::SoundCloud) {
            return Err(EtlError::Config(format!("{service} is not a rapidapi chart")));
        }
        Ok(Self { service, client, scraper, cache })
    }

    fn prefix(&self) -> CachePrefix {
        match self.service {
            ServiceName::AppleMusic => CachePrefix::RapidApiAppleMusic,
            _ => CachePrefix::RapidApiSoundCloud
        }
    }
}

#[async_trait]
impl PlaylistSource for RapidApiChartSource {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn fetch(&self, genre: &GenreConfig, refresh: bool) -> Result<RawPlaylist, EtlError> {
        let url = playlist_link(genre, self.service)?;
        let service = self.service;
        let key = genre.genre.as_str();

        let chart = cached(self.cache.as_ref(), self.prefix(), key, refresh, move || async move {
            let payload = self.client.playlist(service, url).await?;
            let meta = self.scraper.playlist_meta(service, url).await;
            Ok(FetchedChart { meta, payload })
        }).await?;

        info!(service = %service, genre = %genre.genre, cache_hit = chart.hit, "extract.chart");
        Ok(RawPlaylist {
            service,
            genre: genre.genre,
            meta: chart.value.meta,
            payload: chart.value.payload
        })
    }
}

///
/// Spotify charts straight from the web api. The raw blob is a flat list
/// of `{name, artists, album_name, url, isrc, cover_url}`
///
pub struct SpotifyPlaylistSource {
    client: Arc<SpotifyClient>,
    cache: Arc<dyn KvCache>
}

pub fn spotify_playlist_id(url: &str) -> Result<String, EtlError> {
    let parsed = Url::parse(url)?;
    parsed.path_segments()
        .and_then(|mut segs| {
            let kind = segs.next()?;
            let id = segs.next()?;
            (kind == "playlist" && !id.is_empty()).then(|| id.to_string())
        })
        .ok_or_else(|| EtlError::Config(format!("not a spotify playlist url: {url}")))
}

/// One playlist item from the api to the raw chart shape
pub fn spotify_item(item: &Value) -> Option<Value> {
    let track = item.get("track").filter(|t| !t.is_null())?;
    let name = track.get("name")?.as_str()?;
    let artists: Vec<&str> = track.get("artists")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|a| a.get("name").and_then(Value::as_str)).collect())
        .unwrap_or_default();
    Some(json!({
        "name": name,
        "artists": artists,
        "album_name": track.pointer("/album/name").and_then(Value::as_str),
        "url": track.pointer("/external_urls/spotify").and_then(Value::as_str),
        "isrc": track.pointer("/external_ids/isrc").and_then(Value::as_str),
        "cover_url": track.pointer("/album/images/0/url").and_then(Value::as_str)
    }))
}

impl SpotifyPlaylistSource {
    pub fn new(client: Arc<SpotifyClient>, cache: Arc<dyn KvCache>) -> Self {
        Self { client, cache }
    }

    async fn fetch_chart(&self, url: &str) -> Result<FetchedChart, EtlError> {
        let id = spotify_playlist_id(url)?;
        let bearer = self.client.bearer().await?;

        let info = self.client.get_json(self.client.playlist(&id, &bearer)?, "spotify.playlist").await?;
        let meta = PlaylistMeta {
            url: url.to_string(),
            name: info["name"].as_str().map(crate::text::clean_text),
            cover_url: info.pointer("/images/0/url").and_then(Value::as_str).map(str::to_string),
            description: info["description"].as_str()
                .map(crate::text::clean_text)
                .filter(|d| !d.is_empty())
        };

        let mut tracks = Vec::new();
        let mut offset = 0_u32;
        for _ in 0..SPOTIFY_MAX_PAGES {
            let page = self.client
                .get_json(self.client.playlist_tracks(&id, offset, &bearer)?, "spotify.playlist.tracks")
                .await?;
            let items = page["items"].as_array().cloned().unwrap_or_default();
            let count = items.len() as u32;
            tracks.extend(items.iter().filter_map(spotify_item));
            debug!(playlist = %id, offset, count, "spotify.playlist.page");

            offset += count;
            if count == 0 || page["next"].is_null() {
                break;
            }
        }

        Ok(FetchedChart { meta, payload: Value::Array(tracks) })
    }
}

#[async_trait]
impl PlaylistSource for SpotifyPlaylistSource {
    fn service(&self) -> ServiceName {
        ServiceName::Spotify
    }

    async fn fetch(&self, genre: &GenreConfig, refresh: bool) -> Result<RawPlaylist, EtlError> {
        let url = playlist_link(genre, ServiceName::Spotify)?;
        let key = genre.genre.as_str();
        let chart = cached(self.cache.as_ref(), CachePrefix::SpotifyPlaylist, key, refresh, move || async move {
            self.fetch_chart(url).await
        }).await?;

        info!(service = "spotify", genre = %genre.genre, cache_hit = chart.hit, "extract.chart");
        Ok(RawPlaylist {
            service: ServiceName::Spotify,
            genre: genre.genre,
            meta: chart.value.meta,
            payload: chart.value.payload
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{HttpConfig, SpotifyConfig};
    use crate::types::{Genre, Registry};
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::{method, path}};

    #[test]
    fn playlist_ids() {
        assert_eq!(
            spotify_playlist_id("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M").unwrap(),
            "37i9dQZF1DXcBWIGoYBM5M"
        );
        assert!(spotify_playlist_id("https://open.spotify.com/album/abc").is_err());
    }

    #[test]
    fn items_map_to_raw_shape() {
        let item = json!({"track": {
            "name": "Espresso",
            "artists": [{"name": "Sabrina Carpenter"}],
            "album": {"name": "Short n' Sweet", "images": [{"url": "https://i.scdn.co/a"}]},
            "external_urls": {"spotify": "https://open.spotify.com/track/1"},
            "external_ids": {"isrc": "USUM72401994"}
        }});
        let raw = spotify_item(&item).unwrap();
        assert_eq!(raw["artists"][0], "Sabrina Carpenter");
        assert_eq!(raw["isrc"], "USUM72401994");
        assert_eq!(raw["cover_url"], "https://i.scdn.co/a");
        assert!(spotify_item(&json!({"track": null})).is_none());
    }

    #[tokio::test]
    async fn spotify_chart_is_fetched_then_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t", "expires_in": 3600})))
            .mount(&server).await;
        Mock::given(method("GET")).and(path("/v1/playlists/37i9dQZF1DXcBWIGoYBM5M"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "Today&#39;s Top Hits", "description": "", "images": [{"url": "https://c/x"}]
            })))
            .expect(1)
            .mount(&server).await;
        Mock::given(method("GET")).and(path("/v1/playlists/37i9dQZF1DXcBWIGoYBM5M/tracks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{"track": {"name": "A", "artists": [{"name": "B"}], "external_ids": {"isrc": "USAAA2400001"}}}],
                "next": null
            })))
            .expect(1)
            .mount(&server).await;

        let cfg = SpotifyConfig {
            client_id: "id".into(),
            client_secret: "s".into(),
            token_url: Url::parse(&format!("{}/api/token", server.uri())).unwrap(),
            api_base: Url::parse(&format!("{}/v1/", server.uri())).unwrap(),
            market: "US".into()
        };
        let client = Arc::new(SpotifyClient::new(&HttpConfig::default(), &cfg).unwrap());
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let source = SpotifyPlaylistSource::new(client, cache);

        let genre = Registry.genre(Genre::Pop);
        let first = source.fetch(genre, false).await.unwrap();
        assert_eq!(first.meta.name.as_deref(), Some("Today's Top Hits"));
        assert!(first.meta.description.is_none());
        assert_eq!(first.payload.as_array().map(Vec::len), Some(1));

        let second = source.fetch(genre, false).await.unwrap();
        assert_eq!(second.payload, first.payload);
    }
}
