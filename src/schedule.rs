//!
//! src/schedule.rs  Andrew Belles  Oct 6th, 2025
//!
//! Cache window controller. Raw playlist caches may only be dropped close
//! to the weekly refresh instant so every consumer flips to the new charts
//! at the same time
//!

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tracing::info;

use crate::cache::{CachePrefix, KvCache};
use crate::config::ScheduleConfig;
use crate::errors::EtlError;

#[derive(Debug, Clone)]
pub struct CacheWindow {
    schedule: Schedule,
    window: Duration
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared { entries: u64 },
    OutsideWindow
}

impl CacheWindow {
    pub fn new(cfg: &ScheduleConfig) -> Result<Self, EtlError> {
        let schedule = Schedule::from_str(&cfg.cron_expression)?;
        if cfg.window_minutes < 0 {
            return Err(EtlError::Config("window minutes must be >= 0".to_string()));
        }
        Ok(Self { schedule, window: Duration::minutes(cfg.window_minutes) })
    }

    /// Latest scheduled instant at or before `now`
    pub fn previous(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&(now + Duration::seconds(1))).next_back()
    }

    /// Earliest scheduled instant at or after `now`
    pub fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&(now - Duration::seconds(1))).next()
    }

    /// Inside means within the window after the previous instant, or within
    /// the window before the next one. Both bounds inclusive
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let after_prev = self.previous(now)
            .is_some_and(|prev| prev <= now && now <= prev + self.window);
        let before_next = self.next(now)
            .is_some_and(|next| next - self.window <= now && now <= next);
        after_prev || before_next
    }

    pub fn allows_clear(&self, now: DateTime<Utc>, force: bool) -> bool {
        force || self.is_open(now)
    }
}

/// Drops every raw playlist prefix when the window allows it
pub async fn clear_raw_playlist_cache(
    cache: &dyn KvCache,
    window: &CacheWindow,
    now: DateTime<Utc>,
    force: bool
) -> Result<ClearOutcome, EtlError> {
    if !window.allows_clear(now, force) {
        info!(
            now = %now, next = ?window.next(now), force, "cache.clear.skipped"
        );
        return Ok(ClearOutcome::OutsideWindow);
    }

    let mut entries = 0_u64;
    for prefix in CachePrefix::RAW_PLAYLIST {
        let dropped = cache.delete_by_prefix(prefix).await?;
        info!(prefix = prefix.as_str(), dropped, "cache.clear.prefix");
        entries += dropped;
    }
    info!(entries, force, "cache.clear.done");
    Ok(ClearOutcome::Cleared { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use chrono::TimeZone;

    fn window() -> CacheWindow {
        CacheWindow::new(&ScheduleConfig::default()).unwrap()
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // Oct 4th and 11th 2025 are Saturdays
        Utc.with_ymd_and_hms(2025, 10, d, h, m, s).unwrap()
    }

    #[test]
    fn saturday_window_bounds() {
        let w = window();
        assert!(w.is_open(at(4, 17, 15, 0)));
        assert!(!w.is_open(at(4, 18, 0, 0)));

        assert!(w.is_open(at(4, 17, 0, 0)));
        assert!(w.is_open(at(4, 17, 20, 0)));
        assert!(!w.is_open(at(4, 17, 20, 1)));
        assert!(w.is_open(at(4, 16, 40, 0)));
        assert!(!w.is_open(at(4, 16, 39, 59)));

        assert!(!w.is_open(at(8, 17, 10, 0)));
        assert!(w.is_open(at(11, 16, 45, 0)));
    }

    #[test]
    fn neighbours() {
        let w = window();
        assert_eq!(w.previous(at(8, 12, 0, 0)), Some(at(4, 17, 0, 0)));
        assert_eq!(w.next(at(8, 12, 0, 0)), Some(at(11, 17, 0, 0)));
        assert_eq!(w.previous(at(4, 17, 0, 0)), Some(at(4, 17, 0, 0)));
    }

    #[test]
    fn bad_expression_is_config_error() {
        let cfg = ScheduleConfig { cron_expression: "not a cron".into(), window_minutes: 20 };
        assert!(matches!(CacheWindow::new(&cfg), Err(EtlError::Config(_))));
    }

    #[tokio::test]
    async fn clears_only_raw_prefixes_inside_window() {
        let cache = MemoryCache::new();
        cache.set(CachePrefix::SpotifyPlaylist, "pop", "{}", None).await.unwrap();
        cache.set(CachePrefix::RapidApiAppleMusic, "pop", "{}", None).await.unwrap();
        cache.set(CachePrefix::SpotifyIsrc, "t|a", "\"X\"", None).await.unwrap();

        let w = window();
        let skipped = clear_raw_playlist_cache(&cache, &w, at(8, 12, 0, 0), false).await.unwrap();
        assert_eq!(skipped, ClearOutcome::OutsideWindow);
        assert_eq!(cache.len(), 3);

        let forced = clear_raw_playlist_cache(&cache, &w, at(8, 12, 0, 0), true).await.unwrap();
        assert_eq!(forced, ClearOutcome::Cleared { entries: 2 });
        assert_eq!(cache.len(), 1);
    }
}
