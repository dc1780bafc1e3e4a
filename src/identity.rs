//!
//! src/identity.rs  Andrew Belles  Oct 9th, 2025
//!
//! Resolves a canonical ISRC for a chart entry. A valid direct code is
//! taken as is; otherwise the catalog is searched with progressively looser
//! queries. Only resolved codes are cached
//!

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{cached, CachePrefix, KvCache};
use crate::errors::EtlError;
use crate::fetch::SpotifyClient;
use crate::text::{search_key, strip_parentheticals};
use crate::types::Isrc;

#[async_trait]
pub trait CatalogSearch: Send + Sync {
    /// ISRC of the top hit for a free-text query, if any
    async fn search_isrc(&self, query: &str) -> Result<Option<Isrc>, EtlError>;

    /// Track url for an exact ISRC, if the catalog carries it
    async fn url_by_isrc(&self, isrc: &Isrc) -> Result<Option<String>, EtlError>;
}

///
/// Spotify search backed catalog
///
pub struct SpotifyCatalog {
    client: Arc<SpotifyClient>
}

impl SpotifyCatalog {
    pub fn new(client: Arc<SpotifyClient>) -> Self {
        Self { client }
    }

    async fn top_hit(&self, query: &str, label: &str) -> Result<Option<Value>, EtlError> {
        let bearer = self.client.bearer().await?;
        let body = self.client.get_json(self.client.search(query, 1, &bearer)?, label).await?;
        Ok(body.pointer("/tracks/items/0").cloned())
    }
}

#[async_trait]
impl CatalogSearch for SpotifyCatalog {
    async fn search_isrc(&self, query: &str) -> Result<Option<Isrc>, EtlError> {
        let hit = self.top_hit(query, "spotify.search").await?;
        Ok(hit
            .as_ref()
            .and_then(|t| t.pointer("/external_ids/isrc"))
            .and_then(Value::as_str)
            .and_then(Isrc::parse))
    }

    async fn url_by_isrc(&self, isrc: &Isrc) -> Result<Option<String>, EtlError> {
        let hit = self.top_hit(&format!("isrc:{isrc}"), "spotify.search.isrc").await?;
        Ok(hit
            .as_ref()
            .and_then(|t| t.pointer("/external_urls/spotify"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    Direct(Isrc),
    CacheHit(Isrc),
    Searched(Isrc),
    Unresolved
}

impl IdentityOutcome {
    pub fn isrc(&self) -> Option<&Isrc> {
        match self {
            IdentityOutcome::Direct(i)
            | IdentityOutcome::CacheHit(i)
            | IdentityOutcome::Searched(i) => Some(i),
            IdentityOutcome::Unresolved => None
        }
    }

    pub fn into_isrc(self) -> Option<Isrc> {
        match self {
            IdentityOutcome::Direct(i)
            | IdentityOutcome::CacheHit(i)
            | IdentityOutcome::Searched(i) => Some(i),
            IdentityOutcome::Unresolved => None
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IdentityOutcome::Direct(_)   => "direct",
            IdentityOutcome::CacheHit(_) => "cache_hit",
            IdentityOutcome::Searched(_) => "searched",
            IdentityOutcome::Unresolved  => "unresolved"
        }
    }
}

/// Structured, loose, then original-title structured
pub fn isrc_queries(title: &str, artist: &str) -> [String; 3] {
    let bare = strip_parentheticals(&title.to_lowercase());
    [
        format!("track:{bare} artist:{artist}"),
        format!("{bare} {artist}"),
        format!("track:{} artist:{artist}", title.to_lowercase())
    ]
}

pub struct IdentityResolver {
    catalog: Arc<dyn CatalogSearch>,
    cache: Arc<dyn KvCache>
}

impl IdentityResolver {
    pub fn new(catalog: Arc<dyn CatalogSearch>, cache: Arc<dyn KvCache>) -> Self {
        Self { catalog, cache }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogSearch> {
        &self.catalog
    }

    /// Errors only when every query failed at the transport level; a clean
    /// miss is `Unresolved`
    pub async fn resolve(
        &self,
        title: &str,
        artist: &str,
        direct: Option<&str>
    ) -> Result<IdentityOutcome, EtlError> {
        if let Some(isrc) = direct.and_then(Isrc::parse) {
            return Ok(IdentityOutcome::Direct(isrc));
        }

        let key = search_key(title, artist);
        let lookup = cached(self.cache.as_ref(), CachePrefix::SpotifyIsrc, &key, false, move || async move {
            self.search(title, artist).await
        }).await;

        match lookup {
            Ok(found) if found.hit => Ok(IdentityOutcome::CacheHit(found.value)),
            Ok(found) => {
                debug!(title, artist, isrc = %found.value, "identity.searched");
                Ok(IdentityOutcome::Searched(found.value))
            }
            Err(EtlError::NotFound(_)) => {
                info!(title, artist, "identity.unresolved");
                Ok(IdentityOutcome::Unresolved)
            }
            Err(e) => Err(e)
        }
    }

    async fn search(&self, title: &str, artist: &str) -> Result<Isrc, EtlError> {
        let mut last_error = None;
        let mut answered = false;

        for query in isrc_queries(title, artist) {
            match self.catalog.search_isrc(&query).await {
                Ok(Some(isrc)) => return Ok(isrc),
                Ok(None) => answered = true,
                Err(e) => {
                    warn!(query = %query, error = %e, "identity.search");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Err(EtlError::NotFound(format!("no isrc for {title} by {artist}")))
        }
    }
}
