//!
//! src/fetch.rs  Andrew Belles  Oct 8th, 2025
//!
//! Defines methods for hitting the chart, catalog and video endpoints and
//! returning unparsed data. Clients hand back request builders; callers
//! send them through the retry wrapper
//!

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use reqwest::{Client, header, redirect, RequestBuilder};
use tracing::{debug, warn};
use url::Url;

use crate::config::{HttpConfig, RapidApiConfig, RetryConfig, SpotifyConfig, YouTubeConfig};
use crate::errors::EtlError;
use crate::retry::{http_with_retry, send_json, with_retry};
use crate::types::ServiceName;

const BROWSER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap, user_agent: &str) ->
    Result<Client, EtlError> {
    client_helper(http)
        .default_headers(headers)
        .user_agent(user_agent)
        .build()
        .map_err(|e| EtlError::Http(format!("build client: {e}")))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, EtlError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_with_headers(http, h, &http.user_agent)
}

/// A browser-like session for html page scrapes with a short timeout
pub fn scrape_client(http: &HttpConfig) -> Result<Client, EtlError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("text/html,application/xhtml+xml"));
    h.insert(header::ACCEPT_LANGUAGE, header::HeaderValue::from_static("en-US,en;q=0.9"));
    client_helper(http)
        .timeout(http.scrape_timeout)
        .default_headers(h)
        .user_agent(BROWSER_AGENT)
        .build()
        .map_err(|e| EtlError::Http(format!("build scrape client: {e}")))
}

fn join(base: &Url, path: &str) -> Result<Url, EtlError> {
    base.join(path).map_err(|e| EtlError::Config(format!("join {base} {path}: {e}")))
}

#[derive(Debug)]
struct BearerToken {
    value: String,
    expires: Instant
}

///
/// Spotify Web API with client-credentials auth. The bearer token is
/// cached until shortly before it expires
///
#[derive(Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub cfg: SpotifyConfig,
    retry: RetryConfig,
    token: tokio::sync::Mutex<Option<BearerToken>>
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyConfig) -> Result<Self, EtlError> {
        let http = base_client(http_config)?;
        Ok( Self {
            http,
            cfg: cfg.clone(),
            retry: http_config.retry.clone(),
            token: tokio::sync::Mutex::new(None)
        })
    }

    pub fn token_request(&self) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&self.cfg.client_id, Some(&self.cfg.client_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
    }

    pub async fn bearer(&self) -> Result<String, EtlError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let body = http_with_retry(self.token_request(), &self.retry, "spotify.token").await?;
        let value = body["access_token"].as_str()
            .ok_or_else(|| EtlError::Parse("spotify token missing access_token".to_string()))?
            .to_string();
        let ttl = body["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);
        debug!(ttl_s = ttl, "spotify.token.refresh");

        *guard = Some(BearerToken { value: value.clone(), expires: Instant::now() + Duration::from_secs(ttl) });
        Ok(value)
    }

    /// GET /v1/search?type=track&q=...&limit=
    pub fn search(&self, query: &str, limit: u32, bearer: &str) -> Result<RequestBuilder, EtlError> {
        let url = join(&self.cfg.api_base, "search")?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("type", "track"),
            ("q", query),
            ("limit", limit.to_string().as_str()),
            ("market", self.cfg.market.as_str())
        ]))
    }

    /// GET /v1/playlists/{id}?fields=name,description,images,external_urls
    pub fn playlist(&self, playlist_id: &str, bearer: &str) -> Result<RequestBuilder, EtlError> {
        let url = join(&self.cfg.api_base, &format!("playlists/{playlist_id}"))?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("fields", "name,description,images,external_urls"),
            ("market", self.cfg.market.as_str())
        ]))
    }

    /// GET /v1/playlists/{id}/tracks?offset=&limit=100
    pub fn playlist_tracks(&self, playlist_id: &str, offset: u32, bearer: &str) ->
        Result<RequestBuilder, EtlError> {
        let url = join(&self.cfg.api_base, &format!("playlists/{playlist_id}/tracks"))?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("offset", offset.to_string()),
            ("limit", "100".to_string()),
            ("market", self.cfg.market.clone())
        ]))
    }

    pub async fn get_json(&self, request: RequestBuilder, label: &str) -> Result<serde_json::Value, EtlError> {
        http_with_retry(request, &self.retry, label).await
    }
}

///
/// RapidAPI chart proxies. Keys are tried in rotation; a 429 on one key
/// moves on to the next, and only all keys limited surfaces `RateLimited`
///
#[derive(Debug)]
pub struct RapidApiClient {
    pub http: Client,
    pub cfg: RapidApiConfig,
    retry: RetryConfig,
    current_key: AtomicUsize
}

impl RapidApiClient {
    pub fn new(http_config: &HttpConfig, cfg: &RapidApiConfig) -> Result<Self, EtlError> {
        if cfg.api_keys.is_empty() {
            return Err(EtlError::Config("no rapidapi keys configured".to_string()));
        }
        Ok( Self {
            http: base_client(http_config)?,
            cfg: cfg.clone(),
            retry: http_config.retry.clone(),
            current_key: AtomicUsize::new(0)
        })
    }

    fn request(&self, service: ServiceName, playlist_url: &str, key: &str) -> Result<RequestBuilder, EtlError> {
        let (url, host, param) = match service {
            ServiceName::AppleMusic => (&self.cfg.apple_music_url, &self.cfg.apple_music_host, "url"),
            ServiceName::SoundCloud => (&self.cfg.soundcloud_url, &self.cfg.soundcloud_host, "playlist"),
            other => return Err(EtlError::Config(format!("no rapidapi proxy for {other}")))
        };
        Ok(self.http
            .get(url.clone())
            .query(&[(param, playlist_url)])
            .header("x-rapidapi-key", key)
            .header("x-rapidapi-host", host.as_str()))
    }

    async fn try_keys(&self, service: ServiceName, playlist_url: &str) -> Result<serde_json::Value, EtlError> {
        let n = self.cfg.api_keys.len();
        let start = self.current_key.load(Ordering::Relaxed);
        let mut last = EtlError::RateLimited("rapidapi".to_string());

        for offset in 0..n {
            let idx = (start + offset) % n;
            let request = self.request(service, playlist_url, &self.cfg.api_keys[idx])?;
            match send_json(request).await {
                Ok(v) => {
                    self.current_key.store(idx, Ordering::Relaxed);
                    return Ok(v);
                }
                Err(EtlError::RateLimited(msg)) => {
                    warn!(service = %service, key_index = idx, "rapidapi.key.rotate");
                    last = EtlError::RateLimited(msg);
                }
                Err(e) => return Err(e)
            }
        }
        Err(last)
    }

    pub async fn playlist(&self, service: ServiceName, playlist_url: &str) -> Result<serde_json::Value, EtlError> {
        let label = format!("rapidapi.{service}");
        with_retry(&self.retry, &label, || self.try_keys(service, playlist_url)).await
    }
}

///
/// YouTube data api v3
///
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    pub http: Client,
    pub cfg: YouTubeConfig,
    retry: RetryConfig
}

impl YouTubeClient {
    pub fn new(http_config: &HttpConfig, cfg: &YouTubeConfig) -> Result<Self, EtlError> {
        Ok( Self { http: base_client(http_config)?, cfg: cfg.clone(), retry: http_config.retry.clone() } )
    }

    /// GET /search?part=snippet&type=video&maxResults=1&q=
    pub fn search(&self, query: &str) -> Result<RequestBuilder, EtlError> {
        let url = join(&self.cfg.api_base, "search")?;
        Ok(self.http.get(url).query(&[
            ("part", "snippet"),
            ("type", "video"),
            ("maxResults", "1"),
            ("q", query),
            ("key", self.cfg.api_key.as_str())
        ]))
    }

    /// GET /videos?part=statistics&id=
    pub fn statistics(&self, video_id: &str) -> Result<RequestBuilder, EtlError> {
        let url = join(&self.cfg.api_base, "videos")?;
        Ok(self.http.get(url).query(&[
            ("part", "statistics"),
            ("id", video_id),
            ("key", self.cfg.api_key.as_str())
        ]))
    }

    pub async fn get_json(&self, request: RequestBuilder, label: &str) -> Result<serde_json::Value, EtlError> {
        http_with_retry(request, &self.retry, label).await
    }
}

/// Pulls the video id out of watch, short and embed urls
pub fn youtube_video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if let Some((_, v)) = parsed.query_pairs().find(|(k, _)| k == "v") {
        return Some(v.into_owned()).filter(|v| !v.is_empty());
    }
    let host = parsed.host_str()?;
    if host.ends_with("youtu.be") || parsed.path().starts_with("/embed/") || parsed.path().starts_with("/shorts/") {
        return parsed.path_segments()?.filter(|s| !s.is_empty()).last().map(str::to_string);
    }
    None
}

pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::{header as hdr, method, path, query_param}};

    fn http() -> HttpConfig {
        let mut cfg = HttpConfig::default();
        cfg.retry.max_retries = 1;
        cfg.retry.base_backoff = Duration::from_millis(1);
        cfg.retry.jitter = false;
        cfg
    }

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[tokio::test]
    async fn spotify_token_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok", "expires_in": 3600
            })))
            .expect(1)
            .mount(&server).await;

        let cfg = SpotifyConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            token_url: Url::parse(&format!("{}/api/token", server.uri())).unwrap(),
            api_base: Url::parse(&format!("{}/v1/", server.uri())).unwrap(),
            market: "US".into()
        };
        let client = SpotifyClient::new(&http(), &cfg).unwrap();
        assert_eq!(client.bearer().await.unwrap(), "tok");
        assert_eq!(client.bearer().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn rapidapi_rotates_keys_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/playlist1/")).and(hdr("x-rapidapi-key", "key-a"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server).await;
        Mock::given(method("GET")).and(path("/playlist1/")).and(hdr("x-rapidapi-key", "key-b"))
            .and(query_param("url", "https://music.apple.com/us/playlist/x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"album_details": {}})))
            .mount(&server).await;

        let cfg = RapidApiConfig {
            api_keys: vec!["key-a".into(), "key-b".into()],
            apple_music_url: Url::parse(&format!("{}/playlist1/", server.uri())).unwrap(),
            apple_music_host: "apple-music24.p.rapidapi.com".into(),
            soundcloud_url: Url::parse(&format!("{}/v1/playlist/tracks", server.uri())).unwrap(),
            soundcloud_host: "soundcloud-scraper.p.rapidapi.com".into()
        };
        let client = RapidApiClient::new(&http(), &cfg).unwrap();
        let body = client.playlist(ServiceName::AppleMusic, "https://music.apple.com/us/playlist/x").await.unwrap();
        assert!(body.get("album_details").is_some());
        assert_eq!(client.current_key.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn rapidapi_all_keys_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/v1/playlist/tracks"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server).await;

        let cfg = RapidApiConfig {
            api_keys: vec!["key-a".into()],
            apple_music_url: Url::parse(&format!("{}/playlist1/", server.uri())).unwrap(),
            apple_music_host: "h".into(),
            soundcloud_url: Url::parse(&format!("{}/v1/playlist/tracks", server.uri())).unwrap(),
            soundcloud_host: "h".into()
        };
        let client = RapidApiClient::new(&http(), &cfg).unwrap();
        let out = client.playlist(ServiceName::SoundCloud, "https://soundcloud.com/x").await;
        assert!(matches!(out, Err(EtlError::RateLimited(_))));
    }

    #[test]
    fn video_ids() {
        assert_eq!(youtube_video_id("https://www.youtube.com/watch?v=abc123").as_deref(), Some("abc123"));
        assert_eq!(youtube_video_id("https://youtu.be/xyz").as_deref(), Some("xyz"));
        assert_eq!(youtube_video_id("https://youtube.com").as_deref(), None);
        assert_eq!(youtube_watch_url("abc"), "https://www.youtube.com/watch?v=abc");
    }

    #[tokio::test]
    async fn youtube_client_testbench() -> Result<(), EtlError> {
        dotenvy::dotenv().ok();
        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }
        let cfgs = crate::config::load_config()?;
        let youtube = YouTubeClient::new(&cfgs.http, &cfgs.youtube)?;
        let body = youtube.get_json(youtube.search("\"Espresso\" \"Sabrina Carpenter\"")?, "youtube.search").await?;
        println!("search: {}", serde_json::to_string_pretty(&body)?);
        Ok(())
    }
}
