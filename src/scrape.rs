//!
//! src/scrape.rs  Andrew Belles  Oct 8th, 2025
//!
//! Html page scrapes: playlist metadata, apple music track covers and
//! public play counts. Sessions come from a fixed pool and are discarded
//! after a failed request. Parsing is kept in plain functions over the page
//! text so no document is held across an await
//!

use std::sync::Arc;

use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::cache::{cached, CachePrefix, KvCache};
use crate::config::{HttpConfig, RetryConfig};
use crate::errors::EtlError;
use crate::fetch::scrape_client;
use crate::pool::ResourcePool;
use crate::retry::{send_text, with_retry};
use crate::text::clean_text;
use crate::types::{PlaylistMeta, ServiceName};

fn select_first<'a>(doc: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector).next()
}

fn attr(doc: &Html, css: &str, name: &str) -> Option<String> {
    select_first(doc, css)
        .and_then(|el| el.value().attr(name))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn inner_text(doc: &Html, css: &str) -> Option<String> {
    select_first(doc, css)
        .map(|el| clean_text(&el.text().collect::<String>()))
        .filter(|v| !v.is_empty())
}

/// Playlist name, description and cover from a chart's public page
pub fn parse_playlist_meta(service: ServiceName, url: &str, html: &str) -> PlaylistMeta {
    let doc = Html::parse_document(html);
    let og_title = attr(&doc, r#"meta[property="og:title"]"#, "content").map(|t| clean_text(&t));
    let og_image = attr(&doc, r#"meta[property="og:image"]"#, "content");
    let meta_description = attr(&doc, r#"meta[name="description"]"#, "content").map(|t| clean_text(&t));

    let (name, description) = match service {
        ServiceName::AppleMusic => {
            let curator = inner_text(&doc, "a.click-action");
            let title   = inner_text(&doc, "h1");
            let name = match (title, curator) {
                (Some(t), Some(c)) => Some(format!("{t} {c}")),
                (Some(t), None) => Some(t),
                (None, c) => c.or(og_title)
            };
            let description = inner_text(&doc, r#"p[data-testid="truncate-text"]"#).or(meta_description);
            (name, description)
        }
        _ => (og_title, meta_description)
    };

    PlaylistMeta {
        url: url.to_string(),
        name,
        cover_url: og_image,
        description
    }
}

/// First candidate of the jpeg `<source srcset>` on an apple music track page
pub fn parse_apple_cover(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let srcset = attr(&doc, r#"source[type="image/jpeg"]"#, "srcset")?;
    srcset.split_whitespace().next().map(|s| s.trim_end_matches(',').to_string())
}

fn digits(raw: &str) -> Option<i64> {
    let only: String = raw.chars().filter(char::is_ascii_digit).collect();
    only.parse::<i64>().ok()
}

/// Public play count from a spotify or soundcloud track page
pub fn parse_play_count(service: ServiceName, html: &str) -> Option<i64> {
    let doc = Html::parse_document(html);
    match service {
        ServiceName::Spotify => inner_text(&doc, r#"[data-testid="playcount"]"#)
            .and_then(|t| digits(&t)),
        ServiceName::SoundCloud => attr(&doc, r#"meta[property="soundcloud:play_count"]"#, "content")
            .or_else(|| attr(&doc, r#"meta[itemprop="interactionCount"]"#, "content"))
            .and_then(|t| digits(&t)),
        _ => None
    }
}

///
/// Pooled page scraper
///
pub struct PageScraper {
    sessions: ResourcePool<Client>,
    cache: Arc<dyn KvCache>,
    retry: RetryConfig
}

impl PageScraper {
    pub fn new(http: &HttpConfig, sessions: usize, cache: Arc<dyn KvCache>) -> Self {
        let http_cfg = http.clone();
        Self {
            sessions: ResourcePool::new(sessions, move || scrape_client(&http_cfg)),
            cache,
            retry: http.retry.clone()
        }
    }

    /// GET a page on a pooled session. A failed session is dropped
    pub async fn page(&self, url: &str) -> Result<String, EtlError> {
        with_retry(&self.retry, "scrape.page", move || async move {
            let session = self.sessions.checkout().await?;
            match send_text(session.get(url)).await {
                Ok(body) => Ok(body),
                Err(e) => {
                    session.discard();
                    Err(e)
                }
            }
        }).await
    }

    /// Metadata is best effort; failures fall back to the url alone
    pub async fn playlist_meta(&self, service: ServiceName, url: &str) -> PlaylistMeta {
        match self.page(url).await {
            Ok(html) => parse_playlist_meta(service, url, &html),
            Err(e) => {
                warn!(service = %service, url, error = %e, "scrape.playlist_meta");
                PlaylistMeta { url: url.to_string(), ..Default::default() }
            }
        }
    }

    pub async fn apple_cover(&self, track_url: &str) -> Result<String, EtlError> {
        let out = cached(self.cache.as_ref(), CachePrefix::AppleCover, track_url, false, move || async move {
            let html = self.page(track_url).await?;
            parse_apple_cover(&html)
                .ok_or_else(|| EtlError::NotFound(format!("no cover on {track_url}")))
        }).await?;
        debug!(track_url, hit = out.hit, "scrape.apple_cover");
        Ok(out.value)
    }

    pub async fn play_count(&self, service: ServiceName, url: &str) -> Result<i64, EtlError> {
        let html = self.page(url).await?;
        parse_play_count(service, &html)
            .ok_or_else(|| EtlError::NotFound(format!("no {service} play count on {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::{method, path}};

    const SOUNDCLOUD_PAGE: &str = r#"
        <html><head>
          <meta property="og:title" content="Ear Candy: Fresh Pop Picks">
          <meta name="description" content="The best new pop &amp; more">
          <meta property="og:image" content="https://i1.sndcdn.com/artworks-x.jpg">
          <meta property="soundcloud:play_count" content="1234">
        </head><body></body></html>"#;

    const APPLE_PAGE: &str = r#"
        <html><head><meta property="og:image" content="https://is1.mzstatic.com/p.jpg"></head>
        <body>
          <h1>A-List Pop</h1><a class="click-action">Apple Music Pop</a>
          <p data-testid="truncate-text">Today&#39;s hits</p>
          <picture><source type="image/webp" srcset="https://x/a.webp 1x">
          <source type="image/jpeg" srcset="https://x/a.jpg 296w, https://x/b.jpg 592w"></picture>
        </body></html>"#;

    #[test]
    fn soundcloud_meta_and_count() {
        let meta = parse_playlist_meta(ServiceName::SoundCloud, "https://soundcloud.com/x", SOUNDCLOUD_PAGE);
        assert_eq!(meta.name.as_deref(), Some("Ear Candy: Fresh Pop Picks"));
        assert_eq!(meta.description.as_deref(), Some("The best new pop & more"));
        assert_eq!(meta.cover_url.as_deref(), Some("https://i1.sndcdn.com/artworks-x.jpg"));
        assert_eq!(parse_play_count(ServiceName::SoundCloud, SOUNDCLOUD_PAGE), Some(1234));
    }

    #[test]
    fn apple_meta_and_cover() {
        let meta = parse_playlist_meta(ServiceName::AppleMusic, "https://music.apple.com/x", APPLE_PAGE);
        assert_eq!(meta.name.as_deref(), Some("A-List Pop Apple Music Pop"));
        assert_eq!(meta.description.as_deref(), Some("Today's hits"));
        assert_eq!(parse_apple_cover(APPLE_PAGE).as_deref(), Some("https://x/a.jpg"));
        assert_eq!(parse_apple_cover("<html></html>"), None);
    }

    #[test]
    fn spotify_count_with_separators() {
        let html = r#"<div><span data-testid="playcount">12,345,678</span></div>"#;
        assert_eq!(parse_play_count(ServiceName::Spotify, html), Some(12_345_678));
        assert_eq!(parse_play_count(ServiceName::Spotify, "<div></div>"), None);
    }

    #[tokio::test]
    async fn cover_is_cached_after_first_scrape() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/us/song/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(APPLE_PAGE))
            .expect(1)
            .mount(&server).await;

        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let scraper = PageScraper::new(&HttpConfig::default(), 2, cache);
        let url = format!("{}/us/song/1", server.uri());
        assert_eq!(scraper.apple_cover(&url).await.unwrap(), "https://x/a.jpg");
        assert_eq!(scraper.apple_cover(&url).await.unwrap(), "https://x/a.jpg");
    }

    #[tokio::test]
    async fn meta_failure_falls_back_to_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET")).and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server).await;

        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let scraper = PageScraper::new(&HttpConfig::default(), 1, cache);
        let url = format!("{}/gone", server.uri());
        let meta = scraper.playlist_meta(ServiceName::SoundCloud, &url).await;
        assert_eq!(meta.url, url);
        assert!(meta.name.is_none());
    }
}
