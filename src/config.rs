//!
//! src/config.rs  Andrew Belles  Oct 4th, 2025
//!
//! Loads every section of the etl configuration from the environment
//! (and a .env file if present). Secrets are required, everything else
//! falls back to defaults tuned for the weekly chart refresh
//!

use std::time;
use url::Url;

use crate::errors::EtlError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 30000;
pub const HTTP_SCRAPE_TIMEOUT: u64 = 5000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 2000;
pub const HTTP_POOL_MAX_IDLE: usize = 16;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_RETRIES: usize = 3;
pub const RETRY_BASE_BACKOFF: u64 = 500;
pub const RETRY_MAX_BACKOFF: u64 = 10000;
pub const RETRY_JITTER: bool = true;

/// Wrapper over env::var to return an invalid enviroment var error
fn env_check(s: &str) -> Result<String, EtlError> {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EtlError::Config(format!("{s} was not set"))),
    }
}

fn env_or(s: &str, default: &str) -> String {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string()
    }
}

fn env_parse<T: std::str::FromStr>(s: &str, default: T) -> T {
    std::env::var(s)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

/// Parses a base url and guarantees a trailing slash so `join` appends
fn base_url(var: &str, default: &str, host: Option<&str>) -> Result<Url, EtlError> {
    let raw = env_or(var, default);
    let mut url = Url::parse(&raw)
        .map_err(|e| EtlError::Config(format!("{var} invalid {e}")))?;

    if let Some(host) = host {
        ensure_https(&url).map_err(EtlError::Config)?;
        ensure_host(&url, host).map_err(EtlError::Config)?;
    }

    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
    Ok(url)
}

///
/// Configuration that Spotify expects when hitting endpoints
///
#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: Url,
    pub api_base: Url,
    pub market: String
}

fn build_spotify() -> Result<SpotifyConfig, EtlError> {
    let client_id     = env_check("SPOTIFY_CLIENT_ID")?;
    let client_secret = env_check("SPOTIFY_CLIENT_SECRET")?;

    let token_url = Url::parse(
        &env_or("SPOTIFY_TOKEN_URL", "https://accounts.spotify.com/api/token")
    ).map_err(|_| EtlError::Config("SPOTIFY_TOKEN_URL invalid".to_string()))?;
    ensure_https(&token_url).map_err(EtlError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com").map_err(EtlError::Config)?;

    let api_base = base_url(
        "SPOTIFY_API_BASE", "https://api.spotify.com/v1/", Some("api.spotify.com")
    )?;
    let market = env_or("SPOTIFY_MARKET", "US");

    Ok( SpotifyConfig { client_id, client_secret, token_url, api_base, market } )
}

///
/// RapidAPI proxies used for the Apple Music and SoundCloud chart scrapes.
/// Keys rotate on 429
///
#[derive(Debug, Clone)]
pub struct RapidApiConfig {
    pub api_keys: Vec<String>,
    pub apple_music_url: Url,
    pub apple_music_host: String,
    pub soundcloud_url: Url,
    pub soundcloud_host: String
}

fn build_rapidapi() -> Result<RapidApiConfig, EtlError> {
    let mut api_keys = vec![env_check("X_RAPIDAPI_KEY_A")?];
    if let Ok(b) = env_check("X_RAPIDAPI_KEY_B") {
        api_keys.push(b);
    }

    let apple_music_host = env_or("RAPIDAPI_APPLE_MUSIC_HOST", "apple-music24.p.rapidapi.com");
    let soundcloud_host  = env_or("RAPIDAPI_SOUNDCLOUD_HOST", "soundcloud-scraper.p.rapidapi.com");

    let apple_music_url = Url::parse(&env_or(
        "RAPIDAPI_APPLE_MUSIC_URL", "https://apple-music24.p.rapidapi.com/playlist1/"
    ))?;
    let soundcloud_url = Url::parse(&env_or(
        "RAPIDAPI_SOUNDCLOUD_URL", "https://soundcloud-scraper.p.rapidapi.com/v1/playlist/tracks"
    ))?;
    ensure_https(&apple_music_url).map_err(EtlError::Config)?;
    ensure_https(&soundcloud_url).map_err(EtlError::Config)?;

    Ok( RapidApiConfig {
        api_keys, apple_music_url, apple_music_host, soundcloud_url, soundcloud_host
    })
}

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
    pub api_key: String,
    pub api_base: Url
}

fn build_youtube() -> Result<YouTubeConfig, EtlError> {
    let api_key  = env_check("GOOGLE_API_KEY")?;
    let api_base = base_url(
        "YOUTUBE_API_BASE", "https://www.googleapis.com/youtube/v3/", Some("www.googleapis.com")
    )?;
    Ok( YouTubeConfig { api_key, api_base } )
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_backoff: time::Duration,
    pub max_backoff: time::Duration,
    pub jitter: bool
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: RETRY_MAX_RETRIES,
            base_backoff: time::Duration::from_millis(RETRY_BASE_BACKOFF),
            max_backoff: time::Duration::from_millis(RETRY_MAX_BACKOFF),
            jitter: RETRY_JITTER
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub scrape_timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub user_agent: String,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            scrape_timeout: time::Duration::from_millis(HTTP_SCRAPE_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            user_agent: format!("tunemeld-etl/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryConfig::default()
        }
    }
}

fn build_http() -> HttpConfig {
    let defaults = HttpConfig::default();
    let retry = RetryConfig {
        max_retries: env_parse("HTTP_MAX_RETRIES", defaults.retry.max_retries),
        ..defaults.retry.clone()
    };
    HttpConfig {
        timeout: time::Duration::from_millis(env_parse("HTTP_TIMEOUT_MS", HTTP_TIMEOUT)),
        scrape_timeout: time::Duration::from_millis(
            env_parse("HTTP_SCRAPE_TIMEOUT_MS", HTTP_SCRAPE_TIMEOUT)
        ),
        retry,
        ..defaults
    }
}

///
/// Configuration for persistent storage in sqlite db and the compressed
/// raw payload archive
///
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub db_url: String,
    pub raw_store_root: String,
    pub archive_raw: bool,
    pub zstd_level: i32
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:./data/tunemeld.db".to_string(),
            raw_store_root: "./data".to_string(),
            archive_raw: true,
            zstd_level: 3
        }
    }
}

fn build_persistence() -> PersistenceConfig {
    let defaults = PersistenceConfig::default();
    PersistenceConfig {
        db_url: env_or("DATABASE_URL", &defaults.db_url),
        raw_store_root: env_or("RAW_STORE_ROOT", &defaults.raw_store_root),
        archive_raw: env_parse("ARCHIVE_RAW", defaults.archive_raw),
        zstd_level: env_parse("ZSTD_LEVEL", defaults.zstd_level)
    }
}

///
/// Worker pool sizes per stage. Quota-sensitive services get fewer workers
///
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    pub extract_workers: usize,
    pub identity_workers: usize,
    pub canonical_workers: usize,
    pub youtube_workers: usize,
    pub play_count_workers: usize,
    pub scrape_sessions: usize,
    pub progress_interval: usize
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            extract_workers: 2,
            identity_workers: 8,
            canonical_workers: 10,
            youtube_workers: 4,
            play_count_workers: 3,
            scrape_sessions: 3,
            progress_interval: 50
        }
    }
}

fn build_concurrency() -> ConcurrencyConfig {
    let d = ConcurrencyConfig::default();
    ConcurrencyConfig {
        extract_workers: env_parse("EXTRACT_WORKERS", d.extract_workers),
        identity_workers: env_parse("IDENTITY_WORKERS", d.identity_workers),
        canonical_workers: env_parse("CANONICAL_WORKERS", d.canonical_workers),
        youtube_workers: env_parse("YOUTUBE_WORKERS", d.youtube_workers),
        play_count_workers: env_parse("PLAY_COUNT_WORKERS", d.play_count_workers),
        scrape_sessions: env_parse("SCRAPE_SESSIONS", d.scrape_sessions),
        ..d
    }
}

///
/// Stage-level failure-rate rule
///
#[derive(Debug, Clone, Copy)]
pub struct FailureConfig {
    pub max_failure_rate: f64,
    pub min_sample: usize
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self { max_failure_rate: 0.25, min_sample: 20 }
    }
}

fn build_failure() -> FailureConfig {
    let d = FailureConfig::default();
    FailureConfig {
        max_failure_rate: env_parse("MAX_FAILURE_RATE", d.max_failure_rate),
        min_sample: env_parse("FAILURE_MIN_SAMPLE", d.min_sample)
    }
}

///
/// Weekly refresh schedule that gates raw cache clears. The expression uses
/// the cron crate syntax (leading seconds field, named weekdays)
///
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub cron_expression: String,
    pub window_minutes: i64
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron_expression: "0 0 17 * * Sat".to_string(),
            window_minutes: 20
        }
    }
}

fn build_schedule() -> ScheduleConfig {
    let d = ScheduleConfig::default();
    ScheduleConfig {
        cron_expression: env_or("CACHE_CLEAR_CRON", &d.cron_expression),
        window_minutes: env_parse("CACHE_CLEAR_WINDOW_MINUTES", d.window_minutes)
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,tunemeld_etl=debug,reqwest=warn,sqlx=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging() -> LoggingConfig {
    let d = LoggingConfig::default();
    let format = match env_or("LOG_FORMAT", "json").to_ascii_lowercase().as_str() {
        "pretty" => LogFormat::Pretty,
        _ => LogFormat::Json
    };
    LoggingConfig {
        filter_directives: env_or("LOG_FILTER", &d.filter_directives),
        format,
        ..d
    }
}

///
/// AppConfig which holds every section the pipeline needs
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub spotify: SpotifyConfig,
    pub rapidapi: RapidApiConfig,
    pub youtube: YouTubeConfig,
    pub http: HttpConfig,
    pub persistence: PersistenceConfig,
    pub concurrency: ConcurrencyConfig,
    pub failure: FailureConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, EtlError> {
    dotenvy::dotenv().ok();

    let spotify     = build_spotify()?;
    let rapidapi    = build_rapidapi()?;
    let youtube     = build_youtube()?;
    let http        = build_http();
    let persistence = build_persistence();
    let concurrency = build_concurrency();
    let failure     = build_failure();
    let schedule    = build_schedule();
    let logging     = build_logging();

    Ok( AppConfig {
        spotify, rapidapi, youtube, http, persistence,
        concurrency, failure, schedule, logging
    } )
}

/// Sections that need no secrets; enough for read-only commands
pub fn load_local_config() -> (PersistenceConfig, ScheduleConfig, LoggingConfig) {
    dotenvy::dotenv().ok();
    (build_persistence(), build_schedule(), build_logging())
}
