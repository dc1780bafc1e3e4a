//!
//! src/query.rs  Andrew Belles  Oct 12th, 2025
//!
//! Read-only views. Every chart read resolves the published run for its
//! genre first, so a run that is still writing is never served
//!

use serde::Serialize;

use crate::errors::EtlError;
use crate::persistent::{ConsensusRow, Persistent};
use crate::types::{
    AggregateCount, CanonicalTrack, ConsensusPlaylist, Genre, Isrc, PlaylistMeta, RunId,
    ServiceName, ServiceTrack
};

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistView {
    pub run_id: RunId,
    pub playlist: ConsensusPlaylist,
    pub tracks: Vec<ConsensusRow>
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicePlaylistView {
    pub run_id: RunId,
    pub service: ServiceName,
    pub meta: Option<PlaylistMeta>,
    pub tracks: Vec<ServiceTrack>
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayCountView {
    pub track: Option<CanonicalTrack>,
    pub counts: Vec<AggregateCount>
}

impl PlayCountView {
    pub fn total(&self) -> Option<&AggregateCount> {
        self.counts.iter().find(|c| c.service == ServiceName::Total)
    }
}

/// Consensus playlist for a genre, None before the first published run
pub async fn playlist_view(db: &Persistent, genre: Genre) -> Result<Option<PlaylistView>, EtlError> {
    let Some(run) = db.published_run(genre).await? else {
        return Ok(None);
    };
    let Some(playlist) = db.consensus_playlist(&run, genre).await? else {
        return Ok(None);
    };
    let tracks = db.consensus_rows(&run, genre).await?;
    Ok(Some(PlaylistView { run_id: run, playlist, tracks }))
}

/// One service's normalized chart from the published run
pub async fn service_playlist_view(
    db: &Persistent,
    genre: Genre,
    service: ServiceName
) -> Result<Option<ServicePlaylistView>, EtlError> {
    if !service.is_primary() {
        return Err(EtlError::Config(format!("{service} has no chart")));
    }
    let Some(run) = db.published_run(genre).await? else {
        return Ok(None);
    };
    let meta = db.raw_playlist_meta(&run, service, genre).await?;
    let tracks = db.service_tracks(&run, genre).await?
        .into_iter()
        .filter(|t| t.service == service)
        .collect();
    Ok(Some(ServicePlaylistView { run_id: run, service, meta, tracks }))
}

/// Latest per-service and total counts for a track
pub async fn play_counts_view(db: &Persistent, isrc: &Isrc) -> Result<PlayCountView, EtlError> {
    let track = db.canonical_track(isrc).await?;
    let counts = db.latest_aggregates(isrc).await?;
    Ok(PlayCountView { track, counts })
}
