//!
//! tests/pipeline.rs  Andrew Belles  Oct 13th, 2025
//!
//! End to end runs against in-memory sqlite and fake services
//!

mod common;

use std::sync::atomic::Ordering;

use chrono::{Days, Utc};

use common::*;
use tunemeld_etl::config::FailureConfig;
use tunemeld_etl::errors::EtlError;
use tunemeld_etl::pipeline::{RunOptions, Stage};
use tunemeld_etl::query::{play_counts_view, playlist_view, service_playlist_view};
use tunemeld_etl::types::{Genre, Isrc, PlayCountSnapshot, ServiceName};

fn isrc(raw: &str) -> Isrc {
    Isrc::parse(raw).unwrap()
}

fn order(rows: &[tunemeld_etl::persistent::ConsensusRow]) -> Vec<&str> {
    rows.iter().map(|r| r.isrc.as_str()).collect()
}

#[tokio::test]
async fn full_run_publishes_ranked_consensus() {
    let h = Harness::new().await;
    let (run, stats) = h.pipeline().run_full(&RunOptions::default()).await.unwrap();

    let view = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    assert_eq!(view.run_id, run);
    assert_eq!(view.playlist.name, "TuneMeld Pop");
    assert_eq!(order(&view.tracks), vec![ESPRESSO, BIRDS, TASTE]);
    assert_eq!(view.tracks.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(view.tracks[0].service_count, 3);
    assert!(view.tracks.iter().all(|r| r.youtube_url.is_some()));

    // tracks off the consensus never reach video search
    let lone = h.db.canonical_track(&isrc(SPOTIFY_ONLY)).await.unwrap().unwrap();
    assert!(lone.youtube_url.is_none());
    assert_eq!(stats.youtube.api_success, 3);

    // apple #2 with three services, then two equal 1001 keys broken by isrc
    let entries = h.db.consensus_entries(&run, Genre::Pop).await.unwrap();
    let keys: Vec<u32> = entries.iter().map(|e| e.sort_key).collect();
    assert_eq!(keys, vec![2, 1001, 1001]);
    assert_eq!(entries[2].service, ServiceName::SoundCloud);

    // every other genre has an empty consensus
    let dance = playlist_view(&h.db, Genre::Dance).await.unwrap().unwrap();
    assert!(dance.tracks.is_empty());

    assert_eq!(stats.payloads, 12);
    assert_eq!(stats.tracks_dropped, 1);
    assert_eq!(stats.identity.unresolved, 1);
    assert_eq!(stats.consensus.get(&Genre::Pop), Some(&3));
    assert_eq!(h.db.run_ids().await.unwrap(), vec![run]);
}

#[tokio::test]
async fn service_charts_keep_dense_positions() {
    let h = Harness::new().await;
    h.pipeline().run_full(&RunOptions::default()).await.unwrap();

    let sc = service_playlist_view(&h.db, Genre::Pop, ServiceName::SoundCloud).await.unwrap().unwrap();
    let kept: Vec<(u32, &str)> = sc.tracks.iter().map(|t| (t.position, t.isrc.as_str())).collect();
    assert_eq!(kept, vec![(1, TASTE), (2, ESPRESSO)]);

    let apple = service_playlist_view(&h.db, Genre::Pop, ServiceName::AppleMusic).await.unwrap().unwrap();
    assert_eq!(apple.tracks.len(), 3);
    assert_eq!(apple.meta.map(|m| m.name), Some(Some("apple_music Pop".to_string())));
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let h = Harness::new().await;
    let pipeline = h.pipeline();
    let (first, _) = pipeline.run_full(&RunOptions::default()).await.unwrap();
    let before = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    let counts_before = play_counts_view(&h.db, &isrc(ESPRESSO)).await.unwrap();

    let (second, stats) = pipeline.run_full(&RunOptions::default()).await.unwrap();
    let after = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();

    assert_ne!(first, second);
    assert_eq!(after.run_id, second);
    assert_eq!(before.tracks, after.tracks);
    assert_eq!(h.db.run_ids().await.unwrap(), vec![second]);

    // resolved identities and videos come from the cache the second time
    assert_eq!(stats.identity.cache_hit, 3);
    assert_eq!(stats.youtube.api_success, 0);

    let counts = play_counts_view(&h.db, &isrc(ESPRESSO)).await.unwrap();
    assert_eq!(counts.counts.len(), 4);
    assert_eq!(counts.counts, counts_before.counts);
}

#[tokio::test]
async fn failed_run_keeps_the_published_copy() {
    let h = Harness::new().await;
    let pipeline = h.pipeline();
    let (good, _) = pipeline.run_full(&RunOptions::default()).await.unwrap();
    let served = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();

    h.spotify.fail.store(true, Ordering::Relaxed);
    let err = pipeline.run_full(&RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, EtlError::FailureRate { ref stage, failed: 4, total: 12 } if stage == "extract"));
    assert!(err.is_fatal());

    let still = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    assert_eq!(still.run_id, good);
    assert_eq!(still.tracks, served.tracks);
    assert_eq!(h.db.run_ids().await.unwrap(), vec![good]);
}

#[tokio::test]
async fn failing_play_counts_abort_before_retiring() {
    let h = Harness::new().await;
    let pipeline = h.pipeline_with(FailureConfig { max_failure_rate: 0.25, min_sample: 5 });
    let (good, _) = pipeline.run_full(&RunOptions::default()).await.unwrap();

    // three of eight count fetches fail
    h.spotify_counts.fail.store(true, Ordering::Relaxed);
    let err = pipeline.run_full(&RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, EtlError::FailureRate { ref stage, failed: 3, total: 8 } if stage == "play_counts"));

    let still = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    assert_eq!(still.run_id, good);
    assert_eq!(order(&still.tracks), vec![ESPRESSO, BIRDS, TASTE]);
    assert_eq!(h.db.run_ids().await.unwrap(), vec![good]);
}

#[tokio::test]
async fn cancelled_run_publishes_nothing() {
    let h = Harness::new().await;
    let pipeline = h.pipeline();
    pipeline.shutdown().cancel();

    let err = pipeline.run_full(&RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, EtlError::Cancelled));
    assert!(playlist_view(&h.db, Genre::Pop).await.unwrap().is_none());
    assert!(h.db.run_ids().await.unwrap().is_empty());
    assert_eq!(h.spotify.calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn irrelevant_videos_are_not_linked() {
    let h = Harness::new().await;
    h.videos.irrelevant.store(true, Ordering::Relaxed);
    let (_, stats) = h.pipeline().run_full(&RunOptions::default()).await.unwrap();

    // only the three consensus tracks are searched
    assert_eq!(stats.youtube.not_found, 3);
    assert_eq!(stats.youtube.api_success, 0);
    let view = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    assert!(view.tracks.iter().all(|r| r.youtube_url.is_none()));

    let counts = play_counts_view(&h.db, &isrc(ESPRESSO)).await.unwrap();
    assert!(counts.counts.iter().all(|c| c.service != ServiceName::YouTube));
}

#[tokio::test]
async fn week_old_snapshot_drives_the_delta() {
    let h = Harness::new().await;
    let today = Utc::now().date_naive();
    let week_ago = today.checked_sub_days(Days::new(7)).unwrap();
    h.db.upsert_snapshot(&PlayCountSnapshot {
        isrc: isrc(ESPRESSO),
        service: ServiceName::Spotify,
        day: week_ago,
        count: 0
    }).await.unwrap();

    h.pipeline().run_full(&RunOptions::default()).await.unwrap();

    let view = play_counts_view(&h.db, &isrc(ESPRESSO)).await.unwrap();
    let spotify = view.counts.iter().find(|c| c.service == ServiceName::Spotify).unwrap();
    assert_eq!(spotify.comparison_day, week_ago);
    assert_eq!((spotify.current, spotify.abs_change), (1_000, 1_000));
    assert_eq!(spotify.pct_change, 100.0);

    let youtube = view.counts.iter().find(|c| c.service == ServiceName::YouTube).unwrap();
    assert_eq!(youtube.comparison_day, today);
    assert_eq!(youtube.pct_change, 0.0);

    let total = view.total().unwrap();
    assert_eq!(total.current, 1_750);
    assert_eq!(total.comparison_day, week_ago);
    assert_eq!(view.track.map(|t| t.name), Some("Espresso".to_string()));
}

#[tokio::test]
async fn limit_caps_every_stage() {
    let h = Harness::new().await;
    let opts = RunOptions { limit: Some(1), force: true };
    let (_, stats) = h.pipeline().run_full(&opts).await.unwrap();

    // one track per chart leaves nothing charted twice
    assert_eq!(stats.tracks_kept, 3);
    assert_eq!(stats.consensus.get(&Genre::Pop), Some(&0));
    assert!(stats.youtube.api_success <= 1);
}

#[tokio::test]
async fn stages_can_run_one_at_a_time() {
    let h = Harness::new().await;
    let pipeline = h.pipeline();
    let opts = RunOptions::default();

    let err = pipeline.run_stage(Stage::Normalize, &opts).await.unwrap_err();
    assert!(matches!(err, EtlError::Config(_)));

    let (run, stats) = pipeline.run_stage(Stage::Extract, &opts).await.unwrap();
    assert_eq!(stats.payloads, 12);
    assert!(playlist_view(&h.db, Genre::Pop).await.unwrap().is_none());

    for stage in [Stage::Normalize, Stage::Canonical, Stage::Aggregate] {
        let (continued, _) = pipeline.run_stage(stage, &opts).await.unwrap();
        assert_eq!(continued, run);
    }
    let view = playlist_view(&h.db, Genre::Pop).await.unwrap().unwrap();
    assert_eq!(view.run_id, run);
    assert_eq!(order(&view.tracks), vec![ESPRESSO, BIRDS, TASTE]);
    assert!(view.tracks.iter().all(|r| r.youtube_url.is_none()));
}
