//!
//! src/types.rs  Andrew Belles  Oct 4th, 2025
//!
//! Identifier newtypes and the static genre/service registry. The registry
//! is immutable configuration; db rows only ever store the string keys
//!

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EtlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Genre {
    Pop,
    Dance,
    Rap,
    Country
}

impl Genre {
    pub const ALL: [Genre; 4] = [Genre::Pop, Genre::Dance, Genre::Rap, Genre::Country];

    pub fn as_str(self) -> &'static str {
        match self {
            Genre::Pop     => "pop",
            Genre::Dance   => "dance",
            Genre::Rap     => "rap",
            Genre::Country => "country"
        }
    }

    pub fn parse(s: &str) -> Option<Genre> {
        match s {
            "pop"     => Some(Genre::Pop),
            "dance"   => Some(Genre::Dance),
            "rap"     => Some(Genre::Rap),
            "country" => Some(Genre::Country),
            _ => None
        }
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Genre {
    type Err = EtlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Genre::parse(s).ok_or_else(|| EtlError::Config(format!("unknown genre {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    Spotify,
    AppleMusic,
    SoundCloud,
    YouTube,
    TuneMeld,
    Total
}

impl ServiceName {
    /// Services that publish the curated charts the consensus is built from
    pub const PRIMARY: [ServiceName; 3] = [
        ServiceName::Spotify, ServiceName::AppleMusic, ServiceName::SoundCloud
    ];

    /// Consensus rank priority, highest first
    pub const RANK_PRIORITY: [ServiceName; 3] = [
        ServiceName::AppleMusic, ServiceName::SoundCloud, ServiceName::Spotify
    ];

    /// Which service's metadata wins when building a canonical track
    pub const METADATA_PRIORITY: [ServiceName; 3] = [
        ServiceName::Spotify, ServiceName::AppleMusic, ServiceName::SoundCloud
    ];

    /// Platforms we record play/view counts for
    pub const COUNTED: [ServiceName; 3] = [
        ServiceName::Spotify, ServiceName::YouTube, ServiceName::SoundCloud
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceName::Spotify    => "spotify",
            ServiceName::AppleMusic => "apple_music",
            ServiceName::SoundCloud => "soundcloud",
            ServiceName::YouTube    => "youtube",
            ServiceName::TuneMeld   => "tunemeld",
            ServiceName::Total      => "total"
        }
    }

    pub fn parse(s: &str) -> Option<ServiceName> {
        match s {
            "spotify"     => Some(ServiceName::Spotify),
            "apple_music" => Some(ServiceName::AppleMusic),
            "soundcloud"  => Some(ServiceName::SoundCloud),
            "youtube"     => Some(ServiceName::YouTube),
            "tunemeld"    => Some(ServiceName::TuneMeld),
            "total"       => Some(ServiceName::Total),
            _ => None
        }
    }

    pub fn is_primary(self) -> bool {
        Self::PRIMARY.contains(&self)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = EtlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceName::parse(s).ok_or_else(|| EtlError::Config(format!("unknown service {s}")))
    }
}

/// International standard recording code, always stored upper case without
/// separators (CC-XXX-YY-NNNNN -> CCXXXYYNNNNN)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Isrc(String);

impl Isrc {
    /// Accepts only standards-compliant codes; hyphens and spaces are ignored
    pub fn parse(raw: &str) -> Option<Isrc> {
        let compact: String = raw.chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let bytes = compact.as_bytes();
        if bytes.len() != 12 {
            return None;
        }
        let country  = bytes[0..2].iter().all(u8::is_ascii_uppercase);
        let owner    = bytes[2..5].iter().all(u8::is_ascii_alphanumeric);
        let sequence = bytes[5..12].iter().all(u8::is_ascii_digit);
        if country && owner && sequence {
            Some(Isrc(compact))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Isrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque, time-ordered pipeline run identifier. Lexicographic order of the
/// string form equals minting order, which the read path relies on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn mint() -> RunId {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId(format!("{stamp}-{}", &suffix[..8]))
    }

    pub fn from_raw(raw: impl Into<String>) -> RunId {
        RunId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct GenreConfig {
    pub genre: Genre,
    pub display_name: &'static str,
    pub icon_url: &'static str,
    pub order: u8,
    pub apple_music: &'static str,
    pub soundcloud: &'static str,
    pub spotify: &'static str
}

impl GenreConfig {
    pub fn link(&self, service: ServiceName) -> Option<&'static str> {
        match service {
            ServiceName::AppleMusic => Some(self.apple_music),
            ServiceName::SoundCloud => Some(self.soundcloud),
            ServiceName::Spotify    => Some(self.spotify),
            _ => None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: ServiceName,
    pub display_name: &'static str,
    pub icon_url: &'static str
}

static GENRES: [GenreConfig; 4] = [
    GenreConfig {
        genre: Genre::Pop,
        display_name: "Pop",
        icon_url: "/images/genre-pop.png",
        order: 0,
        apple_music: "https://music.apple.com/us/playlist/a-list-pop/pl.5ee8333dbe944d9f9151e97d92d1ead9",
        soundcloud: "https://soundcloud.com/soundcloud-shine/sets/ear-candy-fresh-pop-picks",
        spotify: "https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M"
    },
    GenreConfig {
        genre: Genre::Dance,
        display_name: "Dance/Electronic",
        icon_url: "/images/genre-dance.png",
        order: 1,
        apple_music: "https://music.apple.com/us/playlist/dancexl/pl.6bf4415b83ce4f3789614ac4c3675740",
        soundcloud: "https://soundcloud.com/soundcloud-the-peak/sets/on-the-up-new-edm-hits",
        spotify: "https://open.spotify.com/playlist/37i9dQZF1DX4dyzvuaRJ0n"
    },
    GenreConfig {
        genre: Genre::Rap,
        display_name: "Hip-Hop/Rap",
        icon_url: "/images/genre-rap.png",
        order: 2,
        apple_music: "https://music.apple.com/us/playlist/rap-life/pl.abe8ba42278f4ef490e3a9fc5ec8e8c5",
        soundcloud: "https://soundcloud.com/soundcloud-hustle/sets/drippin-best-rap-right-now",
        spotify: "https://open.spotify.com/playlist/37i9dQZF1DX0XUsuxWHRQd"
    },
    GenreConfig {
        genre: Genre::Country,
        display_name: "Country",
        icon_url: "/images/genre-country.png",
        order: 3,
        apple_music: "https://music.apple.com/us/playlist/todays-country/pl.87bb5b36a9bd49db8c975607452bfa2b",
        soundcloud: "https://soundcloud.com/trending-music-us/sets/country",
        spotify: "https://open.spotify.com/playlist/37i9dQZF1DX1lVhptIYRda"
    }
];

static SERVICES: [ServiceConfig; 6] = [
    ServiceConfig { service: ServiceName::Spotify, display_name: "Spotify", icon_url: "/images/spotify_logo.png" },
    ServiceConfig { service: ServiceName::AppleMusic, display_name: "Apple Music", icon_url: "/images/apple_music_logo.png" },
    ServiceConfig { service: ServiceName::SoundCloud, display_name: "SoundCloud", icon_url: "/images/soundcloud_logo.png" },
    ServiceConfig { service: ServiceName::YouTube, display_name: "YouTube", icon_url: "/images/youtube_logo.png" },
    ServiceConfig { service: ServiceName::TuneMeld, display_name: "tunemeld", icon_url: "/images/tunemeld.png" },
    ServiceConfig { service: ServiceName::Total, display_name: "Total", icon_url: "/images/tunemeld.png" }
];

/// Read-only view over the static genre/service tables
#[derive(Debug, Clone, Copy, Default)]
pub struct Registry;

impl Registry {
    pub fn genre(&self, genre: Genre) -> &'static GenreConfig {
        // GENRES is laid out in Genre::ALL order
        &GENRES[genre as usize]
    }

    pub fn service(&self, service: ServiceName) -> &'static ServiceConfig {
        &SERVICES[service as usize]
    }

    pub fn genres(&self) -> impl Iterator<Item = &'static GenreConfig> {
        GENRES.iter()
    }
}

/// Descriptive metadata scraped or fetched alongside a chart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistMeta {
    pub url: String,
    pub name: Option<String>,
    pub cover_url: Option<String>,
    pub description: Option<String>
}

/// One raw chart as fetched for a (service, genre); the payload stays opaque
/// until normalization
#[derive(Debug, Clone)]
pub struct RawPlaylist {
    pub service: ServiceName,
    pub genre: Genre,
    pub meta: PlaylistMeta,
    pub payload: serde_json::Value
}

/// A resolved chart entry; positions are 1-based and dense per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTrack {
    pub service: ServiceName,
    pub genre: Genre,
    pub position: u32,
    pub name: String,
    pub artist: String,
    pub album: Option<String>,
    pub service_url: Option<String>,
    pub cover_url: Option<String>,
    pub isrc: Isrc
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusEntry {
    pub genre: Genre,
    pub position: u32,
    pub isrc: Isrc,
    /// Representative service track
    pub service: ServiceName,
    pub service_position: u32,
    pub service_count: u8,
    pub sort_key: u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPlaylist {
    pub genre: Genre,
    pub name: String,
    pub url: String,
    pub cover_url: String,
    pub description: String,
    pub updated_at: DateTime<Utc>
}

/// Cross-run record per isrc; upserted, never duplicated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTrack {
    pub isrc: Isrc,
    pub name: String,
    pub artist: String,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub spotify_url: Option<String>,
    pub apple_music_url: Option<String>,
    pub soundcloud_url: Option<String>,
    pub youtube_url: Option<String>,
    pub updated_at: DateTime<Utc>
}

impl CanonicalTrack {
    pub fn url_for(&self, service: ServiceName) -> Option<&str> {
        match service {
            ServiceName::Spotify    => self.spotify_url.as_deref(),
            ServiceName::AppleMusic => self.apple_music_url.as_deref(),
            ServiceName::SoundCloud => self.soundcloud_url.as_deref(),
            ServiceName::YouTube    => self.youtube_url.as_deref(),
            _ => None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayCountSnapshot {
    pub isrc: Isrc,
    pub service: ServiceName,
    pub day: NaiveDate,
    pub count: i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCount {
    pub isrc: Isrc,
    pub service: ServiceName,
    pub day: NaiveDate,
    pub current: i64,
    pub comparison_day: NaiveDate,
    pub comparison: i64,
    pub abs_change: i64,
    pub pct_change: f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isrc_validation() {
        assert_eq!(Isrc::parse("usum71900929").map(|i| i.to_string()), Some("USUM71900929".into()));
        assert_eq!(Isrc::parse("US-UM7-19-00929").map(|i| i.to_string()), Some("USUM71900929".into()));
        assert!(Isrc::parse("").is_none());
        assert!(Isrc::parse("1SUM71900929").is_none());
        assert!(Isrc::parse("USUM7190092").is_none());
        assert!(Isrc::parse("USUM7190092X").is_none());
    }

    #[test]
    fn run_ids_sort_by_mint_order() {
        let first = RunId::mint();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RunId::mint();
        assert!(first < second);
        assert!(first.as_str() < second.as_str());
    }

    #[test]
    fn registry_lines_up_with_enums() {
        let registry = Registry;
        for genre in Genre::ALL {
            assert_eq!(registry.genre(genre).genre, genre);
            assert!(registry.genre(genre).link(ServiceName::Spotify).is_some());
        }
        for service in [ServiceName::Spotify, ServiceName::AppleMusic, ServiceName::SoundCloud,
                        ServiceName::YouTube, ServiceName::TuneMeld, ServiceName::Total] {
            assert_eq!(registry.service(service).service, service);
            assert_eq!(ServiceName::parse(service.as_str()), Some(service));
        }
    }
}
