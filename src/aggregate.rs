//!
//! src/aggregate.rs  Andrew Belles  Oct 10th, 2025
//!
//! Cross-service matching and consensus ranking. Only tracks charted on at
//! least two services make the consensus; three-service tracks always rank
//! above two-service ones
//!

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::errors::EtlError;
use crate::persistent::Persistent;
use crate::types::{
    ConsensusEntry, ConsensusPlaylist, GenreConfig, Isrc, Registry, RunId, ServiceName, ServiceTrack
};

/// Added to the stored sort key of two-service groups. Ordering itself is
/// by service count first, so the tier holds at any position
pub const TWO_SERVICE_OFFSET: u32 = 1000;

const CONSENSUS_SITE: &str = "https://tunemeld.com";

/// Ranked consensus for one genre from its service tracks. Positions are
/// dense from 1; more services rank first, then the sort key, then isrc
pub fn rank_consensus(genre: &GenreConfig, tracks: &[ServiceTrack]) -> Result<Vec<ConsensusEntry>, EtlError> {
    let mut groups: BTreeMap<&Isrc, Vec<&ServiceTrack>> = BTreeMap::new();
    for t in tracks.iter().filter(|t| t.genre == genre.genre) {
        groups.entry(&t.isrc).or_default().push(t);
    }

    let mut ranked: Vec<ConsensusEntry> = Vec::new();
    for (isrc, members) in groups {
        let services: BTreeSet<ServiceName> = members.iter()
            .map(|t| t.service)
            .filter(|s| s.is_primary())
            .collect();
        if services.len() < 2 {
            continue;
        }

        let representative = ServiceName::RANK_PRIORITY.iter()
            .find_map(|svc| {
                members.iter()
                    .filter(|t| t.service == *svc)
                    .min_by_key(|t| t.position)
            })
            .ok_or_else(|| EtlError::DataIntegrity(format!(
                "{isrc} in {} has no ranked service", genre.genre
            )))?;

        let offset = if services.len() == 2 { TWO_SERVICE_OFFSET } else { 0 };
        ranked.push(ConsensusEntry {
            genre: genre.genre,
            position: 0,
            isrc: isrc.clone(),
            service: representative.service,
            service_position: representative.position,
            service_count: services.len() as u8,
            sort_key: representative.position + offset
        });
    }

    ranked.sort_by(|a, b| {
        b.service_count.cmp(&a.service_count)
            .then(a.sort_key.cmp(&b.sort_key))
            .then_with(|| a.isrc.cmp(&b.isrc))
    });
    for (i, entry) in ranked.iter_mut().enumerate() {
        entry.position = i as u32 + 1;
    }
    Ok(ranked)
}

/// Descriptive row for the synthesized consensus playlist
pub fn consensus_playlist(genre: &GenreConfig, updated_at: DateTime<Utc>) -> ConsensusPlaylist {
    ConsensusPlaylist {
        genre: genre.genre,
        name: format!("TuneMeld {}", genre.display_name),
        url: format!("{CONSENSUS_SITE}/{}", genre.genre),
        cover_url: Registry.service(ServiceName::TuneMeld).icon_url.to_string(),
        description: format!(
            "{} tracks seen on more than one curated playlist, last updated on {}",
            genre.display_name,
            updated_at.format("%b %d")
        ),
        updated_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateReport {
    pub candidates: usize,
    pub entries: usize,
    pub three_service: usize
}

/// Ranks one genre of a run and writes its consensus. Sort keys live on the
/// run's consensus rows only
pub async fn aggregate_genre(db: &Persistent, run: &RunId, genre: &GenreConfig) -> Result<AggregateReport, EtlError> {
    let tracks = db.service_tracks(run, genre.genre).await?;
    let entries = rank_consensus(genre, &tracks)?;

    let updated_at = db.latest_canonical_update().await?.unwrap_or_else(Utc::now);
    let playlist = consensus_playlist(genre, updated_at);
    db.replace_consensus(run, genre.genre, &entries, &playlist).await?;

    let candidates = tracks.iter().map(|t| &t.isrc).collect::<BTreeSet<_>>().len();
    let report = AggregateReport {
        candidates,
        entries: entries.len(),
        three_service: entries.iter().filter(|e| e.service_count >= 3).count()
    };
    debug!(genre = %genre.genre, ?report, "aggregate.genre");
    info!(genre = %genre.genre, entries = report.entries, "aggregate.done");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::types::Genre;

    fn track(service: ServiceName, position: u32, isrc: &str) -> ServiceTrack {
        ServiceTrack {
            service,
            genre: Genre::Pop,
            position,
            name: format!("{isrc} name"),
            artist: "artist".into(),
            album: None,
            service_url: None,
            cover_url: None,
            isrc: Isrc::parse(isrc).unwrap()
        }
    }

    fn pop() -> &'static GenreConfig {
        Registry.genre(Genre::Pop)
    }

    #[test]
    fn single_service_tracks_are_excluded() {
        let tracks = vec![
            track(ServiceName::Spotify, 1, "USAAA2400001"),
            track(ServiceName::Spotify, 2, "USAAA2400002"),
            track(ServiceName::AppleMusic, 5, "USAAA2400002")
        ];
        let out = rank_consensus(pop(), &tracks).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].isrc.as_str(), "USAAA2400002");
        assert_eq!(out[0].service, ServiceName::AppleMusic);
        assert_eq!(out[0].service_position, 5);
    }

    #[test]
    fn apple_and_soundcloud_pair_keys_on_apple_position() {
        let tracks = vec![
            track(ServiceName::AppleMusic, 3, "USAAA2400001"),
            track(ServiceName::SoundCloud, 7, "USAAA2400001")
        ];
        let out = rank_consensus(pop(), &tracks).unwrap();
        assert_eq!(out[0].sort_key, 1003);
        assert_eq!(out[0].service_count, 2);
        assert_eq!(out[0].position, 1);
    }

    #[test]
    fn three_service_groups_outrank_two_service_groups() {
        let tracks = vec![
            // two services, apple #1
            track(ServiceName::AppleMusic, 1, "USAAA2400001"),
            track(ServiceName::Spotify, 1, "USAAA2400001"),
            // three services, apple #50
            track(ServiceName::AppleMusic, 50, "USAAA2400002"),
            track(ServiceName::SoundCloud, 2, "USAAA2400002"),
            track(ServiceName::Spotify, 2, "USAAA2400002"),
            // two services without apple: soundcloud position wins
            track(ServiceName::SoundCloud, 4, "USAAA2400003"),
            track(ServiceName::Spotify, 3, "USAAA2400003")
        ];
        let out = rank_consensus(pop(), &tracks).unwrap();
        let order: Vec<&str> = out.iter().map(|e| e.isrc.as_str()).collect();
        assert_eq!(order, vec!["USAAA2400002", "USAAA2400001", "USAAA2400003"]);
        assert_eq!(out.iter().map(|e| e.position).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(out[2].sort_key, 1004);
        assert_eq!(out[2].service, ServiceName::SoundCloud);
    }

    #[test]
    fn three_service_tier_holds_past_the_offset() {
        let tracks = vec![
            track(ServiceName::AppleMusic, 1200, "USAAA2400001"),
            track(ServiceName::SoundCloud, 1300, "USAAA2400001"),
            track(ServiceName::Spotify, 900, "USAAA2400001"),
            track(ServiceName::AppleMusic, 1, "USAAA2400002"),
            track(ServiceName::Spotify, 1, "USAAA2400002")
        ];
        let out = rank_consensus(pop(), &tracks).unwrap();
        assert_eq!(out[0].isrc.as_str(), "USAAA2400001");
        assert_eq!((out[0].service_count, out[0].sort_key), (3, 1200));
        assert_eq!((out[1].service_count, out[1].sort_key), (2, 1001));
        assert_eq!(out[1].position, 2);
    }

    #[test]
    fn equal_keys_break_on_isrc() {
        let tracks = vec![
            track(ServiceName::AppleMusic, 2, "USZZZ2400001"),
            track(ServiceName::Spotify, 9, "USZZZ2400001"),
            track(ServiceName::SoundCloud, 2, "USAAA2400001"),
            track(ServiceName::Spotify, 1, "USAAA2400001")
        ];
        let out = rank_consensus(pop(), &tracks).unwrap();
        assert_eq!(out[0].isrc.as_str(), "USAAA2400001");
        assert_eq!(out[0].sort_key, out[1].sort_key);
    }

    #[tokio::test]
    async fn ranks_stay_with_their_genre_and_run() {
        let db = Persistent::init("sqlite::memory:").await.unwrap();
        let run = RunId::mint();
        let code = "USAAA2400001";
        let dance = |mut t: ServiceTrack| { t.genre = Genre::Dance; t };

        db.replace_service_tracks(&run, ServiceName::AppleMusic, Genre::Pop,
            &[track(ServiceName::AppleMusic, 2, code)]).await.unwrap();
        db.replace_service_tracks(&run, ServiceName::Spotify, Genre::Pop,
            &[track(ServiceName::Spotify, 5, code)]).await.unwrap();
        db.replace_service_tracks(&run, ServiceName::AppleMusic, Genre::Dance,
            &[dance(track(ServiceName::AppleMusic, 40, code))]).await.unwrap();
        db.replace_service_tracks(&run, ServiceName::SoundCloud, Genre::Dance,
            &[dance(track(ServiceName::SoundCloud, 1, code))]).await.unwrap();
        db.replace_service_tracks(&run, ServiceName::Spotify, Genre::Dance,
            &[dance(track(ServiceName::Spotify, 3, code))]).await.unwrap();

        aggregate_genre(&db, &run, pop()).await.unwrap();
        aggregate_genre(&db, &run, Registry.genre(Genre::Dance)).await.unwrap();

        let pop_keys = db.consensus_entries(&run, Genre::Pop).await.unwrap();
        let dance_keys = db.consensus_entries(&run, Genre::Dance).await.unwrap();
        assert_eq!(pop_keys.iter().map(|e| e.sort_key).collect::<Vec<_>>(), vec![1002]);
        assert_eq!(dance_keys.iter().map(|e| e.sort_key).collect::<Vec<_>>(), vec![40]);

        // a discarded run takes its ranks with it
        db.discard_run(&run).await.unwrap();
        assert!(db.consensus_entries(&run, Genre::Pop).await.unwrap().is_empty());
        assert!(db.consensus_entries(&run, Genre::Dance).await.unwrap().is_empty());
    }

    #[test]
    fn playlist_metadata() {
        let at = Utc.with_ymd_and_hms(2025, 10, 4, 17, 5, 0).unwrap();
        let p = consensus_playlist(Registry.genre(Genre::Dance), at);
        assert_eq!(p.name, "TuneMeld Dance/Electronic");
        assert_eq!(p.url, "https://tunemeld.com/dance");
        assert_eq!(
            p.description,
            "Dance/Electronic tracks seen on more than one curated playlist, last updated on Oct 04"
        );
    }
}
