//!
//! src/cache.rs  Andrew Belles  Oct 5th, 2025
//!
//! Key/value cache seam used by the extractors and resolvers. Entries are
//! namespaced by a prefix that also fixes their time-to-live. The sqlite
//! backed implementation lives on `Persistent`
//!

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::errors::EtlError;

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);
const DAY: Duration  = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePrefix {
    RapidApiAppleMusic,
    RapidApiSoundCloud,
    SpotifyPlaylist,
    SpotifyIsrc,
    AppleCover,
    YouTubeUrl,
    YouTubeViews
}

impl CachePrefix {
    /// Prefixes holding raw chart payloads; the only ones the weekly clear drops
    pub const RAW_PLAYLIST: [CachePrefix; 3] = [
        CachePrefix::RapidApiAppleMusic,
        CachePrefix::RapidApiSoundCloud,
        CachePrefix::SpotifyPlaylist
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CachePrefix::RapidApiAppleMusic => "rapidapi_apple_music",
            CachePrefix::RapidApiSoundCloud => "rapidapi_soundcloud",
            CachePrefix::SpotifyPlaylist    => "spotify_playlist",
            CachePrefix::SpotifyIsrc        => "spotify_isrc",
            CachePrefix::AppleCover         => "apple_music_cover",
            CachePrefix::YouTubeUrl         => "youtube_url",
            CachePrefix::YouTubeViews       => "youtube_views"
        }
    }

    /// None means the entry never expires
    pub fn ttl(self) -> Option<Duration> {
        match self {
            CachePrefix::RapidApiAppleMusic
            | CachePrefix::RapidApiSoundCloud
            | CachePrefix::SpotifyPlaylist
            | CachePrefix::AppleCover => Some(WEEK),
            CachePrefix::YouTubeViews => Some(DAY),
            CachePrefix::SpotifyIsrc | CachePrefix::YouTubeUrl => None
        }
    }
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, prefix: CachePrefix, key: &str) -> Result<Option<String>, EtlError>;

    async fn set(
        &self,
        prefix: CachePrefix,
        key: &str,
        value: &str,
        ttl: Option<Duration>
    ) -> Result<(), EtlError>;

    /// Returns the number of entries dropped
    async fn delete_by_prefix(&self, prefix: CachePrefix) -> Result<u64, EtlError>;
}

pub fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.and_then(|t| chrono::Duration::from_std(t).ok()).map(|d| now + d)
}

/// Process-local cache used by tests and dry runs
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(CachePrefix, String), (String, Option<DateTime<Utc>>)>>
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> EtlError {
    EtlError::Cache("memory cache lock poisoned".to_string())
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, prefix: CachePrefix, key: &str) -> Result<Option<String>, EtlError> {
        let mut map = self.entries.lock().map_err(poisoned)?;
        let id = (prefix, key.to_string());
        let Some((value, expires)) = map.get(&id) else {
            return Ok(None);
        };
        if expires.is_some_and(|at| at <= Utc::now()) {
            map.remove(&id);
            return Ok(None);
        }
        Ok(Some(value.clone()))
    }

    async fn set(
        &self,
        prefix: CachePrefix,
        key: &str,
        value: &str,
        ttl: Option<Duration>
    ) -> Result<(), EtlError> {
        let mut map = self.entries.lock().map_err(poisoned)?;
        map.insert(
            (prefix, key.to_string()),
            (value.to_string(), expiry_from(Utc::now(), ttl))
        );
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: CachePrefix) -> Result<u64, EtlError> {
        let mut map = self.entries.lock().map_err(poisoned)?;
        let before = map.len();
        map.retain(|(p, _), _| *p != prefix);
        Ok((before - map.len()) as u64)
    }
}

/// A value plus whether it came out of the cache
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub hit: bool
}

/// Read-through cache. Only successful results of `op` are stored; errors
/// (including not-found outcomes) pass through uncached. Cache failures
/// degrade to a miss. `refresh` skips the read but still writes
pub async fn cached<T, F, Fut>(
    cache: &dyn KvCache,
    prefix: CachePrefix,
    key: &str,
    refresh: bool,
    op: F
) -> Result<Cached<T>, EtlError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, EtlError>>
{
    if !refresh {
        match cache.get(prefix, key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(prefix = prefix.as_str(), key, "cache.hit");
                    return Ok(Cached { value, hit: true });
                }
                Err(e) => warn!(prefix = prefix.as_str(), key, error = %e, "cache.decode")
            },
            Ok(None) => {}
            Err(e) => warn!(prefix = prefix.as_str(), key, error = %e, "cache.read")
        }
    }

    let value = op().await?;
    match serde_json::to_string(&value) {
        Ok(raw) => {
            if let Err(e) = cache.set(prefix, key, &raw, prefix.ttl()).await {
                warn!(prefix = prefix.as_str(), key, error = %e, "cache.write");
            }
        }
        Err(e) => warn!(prefix = prefix.as_str(), key, error = %e, "cache.encode")
    }
    Ok(Cached { value, hit: false })
}
