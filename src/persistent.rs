//!
//! src/persistent.rs  Andrew Belles  Oct 7th, 2025
//!
//! Sqlite persistence for the etl. Chart rows (raw playlists, service
//! tracks, consensus) are stamped with the run id that wrote them; canonical
//! tracks and play counts are global and upserted by natural key.
//! Also backs the key/value cache
//!

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Pool, Row, Sqlite};

use crate::cache::{expiry_from, CachePrefix, KvCache};
use crate::errors::EtlError;
use crate::types::{
    AggregateCount, CanonicalTrack, ConsensusEntry, ConsensusPlaylist, Genre, Isrc,
    PlayCountSnapshot, PlaylistMeta, RawPlaylist, RunId, ServiceName, ServiceTrack
};

/// Tables whose rows belong to a single run
const RUN_SCOPED: [&str; 4] = [
    "raw_playlists", "service_tracks", "consensus_entries", "consensus_playlists"
];

pub const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, EtlError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EtlError::Db(format!("bad timestamp {raw}: {e}")))
}

fn day_str(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn parse_day(raw: &str) -> Result<NaiveDate, EtlError> {
    NaiveDate::parse_from_str(raw, DAY_FORMAT)
        .map_err(|e| EtlError::Db(format!("bad day {raw}: {e}")))
}

fn stored_isrc(raw: &str) -> Result<Isrc, EtlError> {
    Isrc::parse(raw).ok_or_else(|| EtlError::Db(format!("bad isrc in db: {raw}")))
}

fn stored_service(raw: &str) -> Result<ServiceName, EtlError> {
    ServiceName::parse(raw).ok_or_else(|| EtlError::Db(format!("bad service in db: {raw}")))
}

fn stored_genre(raw: &str) -> Result<Genre, EtlError> {
    Genre::parse(raw).ok_or_else(|| EtlError::Db(format!("bad genre in db: {raw}")))
}

/// One consensus line joined with its representative and canonical data
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConsensusRow {
    pub position: u32,
    pub isrc: Isrc,
    pub service: ServiceName,
    pub service_count: u8,
    pub name: String,
    pub artist: String,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub spotify_url: Option<String>,
    pub apple_music_url: Option<String>,
    pub soundcloud_url: Option<String>,
    pub youtube_url: Option<String>
}

pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), EtlError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS raw_playlists (
              run_id        TEXT NOT NULL,
              service       TEXT NOT NULL,
              genre         TEXT NOT NULL,
              playlist_url  TEXT NOT NULL,
              playlist_name TEXT,
              cover_url     TEXT,
              description   TEXT,
              payload       TEXT NOT NULL,
              created_at    TEXT NOT NULL,
              PRIMARY KEY (run_id, service, genre)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS service_tracks (
              run_id       TEXT NOT NULL,
              service      TEXT NOT NULL,
              genre        TEXT NOT NULL,
              position     INTEGER NOT NULL,
              name         TEXT NOT NULL,
              artist       TEXT NOT NULL,
              album        TEXT,
              service_url  TEXT,
              cover_url    TEXT,
              isrc         TEXT NOT NULL,
              PRIMARY KEY (run_id, service, genre, position)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS consensus_entries (
              run_id            TEXT NOT NULL,
              genre             TEXT NOT NULL,
              position          INTEGER NOT NULL,
              isrc              TEXT NOT NULL,
              service           TEXT NOT NULL,
              service_position  INTEGER NOT NULL,
              service_count     INTEGER NOT NULL,
              sort_key          INTEGER NOT NULL,
              PRIMARY KEY (run_id, genre, position),
              UNIQUE (run_id, genre, isrc)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS consensus_playlists (
              run_id       TEXT NOT NULL,
              genre        TEXT NOT NULL,
              name         TEXT NOT NULL,
              url          TEXT NOT NULL,
              cover_url    TEXT NOT NULL,
              description  TEXT NOT NULL,
              updated_at   TEXT NOT NULL,
              PRIMARY KEY (run_id, genre)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS canonical_tracks (
              isrc             TEXT PRIMARY KEY,
              name             TEXT NOT NULL,
              artist           TEXT NOT NULL,
              album            TEXT,
              cover_url        TEXT,
              spotify_url      TEXT,
              apple_music_url  TEXT,
              soundcloud_url   TEXT,
              youtube_url      TEXT,
              updated_at       TEXT NOT NULL
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS play_count_snapshots (
              isrc         TEXT NOT NULL,
              service      TEXT NOT NULL,
              day          TEXT NOT NULL,
              count        INTEGER NOT NULL,
              recorded_at  TEXT NOT NULL,
              PRIMARY KEY (isrc, service, day)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS aggregate_counts (
              isrc              TEXT NOT NULL,
              service           TEXT NOT NULL,
              day               TEXT NOT NULL,
              current_count     INTEGER NOT NULL,
              comparison_day    TEXT NOT NULL,
              comparison_count  INTEGER NOT NULL,
              abs_change        INTEGER NOT NULL,
              pct_change        REAL NOT NULL,
              PRIMARY KEY (isrc, service, day)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS cache_entries (
              prefix      TEXT NOT NULL,
              key         TEXT NOT NULL,
              value       TEXT NOT NULL,
              expires_at  TEXT,
              PRIMARY KEY (prefix, key)
            );
            "
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_service_tracks_genre ON service_tracks(run_id, genre);"
        ).execute(pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_consensus_genre ON consensus_playlists(genre, run_id);"
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, EtlError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        // WAL is file-only
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8})
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::ensure_schema(&pool).await?;

        Ok(Self { pool })
    }

    fn now() -> String {
        ts(Utc::now())
    }

    /*
     * Run-scoped writes
     */

    pub async fn insert_raw_playlist(&self, run: &RunId, raw: &RawPlaylist) -> Result<(), EtlError> {
        sqlx::query(
            r"
            INSERT INTO raw_playlists (
                run_id, service, genre, playlist_url, playlist_name,
                cover_url, description, payload, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(run_id, service, genre) DO UPDATE SET
                playlist_url = excluded.playlist_url,
                playlist_name = excluded.playlist_name,
                cover_url = excluded.cover_url,
                description = excluded.description,
                payload = excluded.payload;
            "
        )
        .bind(run.as_str())
        .bind(raw.service.as_str())
        .bind(raw.genre.as_str())
        .bind(&raw.meta.url)
        .bind(raw.meta.name.as_ref())
        .bind(raw.meta.cover_url.as_ref())
        .bind(raw.meta.description.as_ref())
        .bind(serde_json::to_string(&raw.payload)?)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn raw_playlists(&self, run: &RunId) -> Result<Vec<RawPlaylist>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT service, genre, playlist_url, playlist_name, cover_url, description, payload
              FROM raw_playlists
             WHERE run_id = ?1
             ORDER BY genre, service;
            "
        )
        .bind(run.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| {
            let payload: String = r.get("payload");
            Ok(RawPlaylist {
                service: stored_service(&r.get::<String, _>("service"))?,
                genre: stored_genre(&r.get::<String, _>("genre"))?,
                meta: PlaylistMeta {
                    url: r.get("playlist_url"),
                    name: r.try_get("playlist_name").ok().flatten(),
                    cover_url: r.try_get("cover_url").ok().flatten(),
                    description: r.try_get("description").ok().flatten()
                },
                payload: serde_json::from_str(&payload)?
            })
        }).collect()
    }

    /// Replaces the run's rows for one (service, genre) in a transaction
    pub async fn replace_service_tracks(
        &self,
        run: &RunId,
        service: ServiceName,
        genre: Genre,
        tracks: &[ServiceTrack]
    ) -> Result<(), EtlError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM service_tracks WHERE run_id = ?1 AND service = ?2 AND genre = ?3;")
            .bind(run.as_str())
            .bind(service.as_str())
            .bind(genre.as_str())
            .execute(&mut *tx)
            .await?;

        for t in tracks {
            sqlx::query(
                r"
                INSERT INTO service_tracks (
                    run_id, service, genre, position, name, artist,
                    album, service_url, cover_url, isrc
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);
                "
            )
            .bind(run.as_str())
            .bind(t.service.as_str())
            .bind(t.genre.as_str())
            .bind(t.position as i64)
            .bind(&t.name)
            .bind(&t.artist)
            .bind(t.album.as_ref())
            .bind(t.service_url.as_ref())
            .bind(t.cover_url.as_ref())
            .bind(t.isrc.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn service_track_from_row(r: &SqliteRow) -> Result<ServiceTrack, EtlError> {
        Ok(ServiceTrack {
            service: stored_service(&r.get::<String, _>("service"))?,
            genre: stored_genre(&r.get::<String, _>("genre"))?,
            position: r.get::<i64, _>("position") as u32,
            name: r.get("name"),
            artist: r.get("artist"),
            album: r.try_get("album").ok().flatten(),
            service_url: r.try_get("service_url").ok().flatten(),
            cover_url: r.try_get("cover_url").ok().flatten(),
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?
        })
    }

    pub async fn service_tracks(&self, run: &RunId, genre: Genre) -> Result<Vec<ServiceTrack>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT service, genre, position, name, artist, album, service_url, cover_url, isrc
              FROM service_tracks
             WHERE run_id = ?1 AND genre = ?2
             ORDER BY service, position;
            "
        )
        .bind(run.as_str())
        .bind(genre.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::service_track_from_row).collect()
    }

    pub async fn all_service_tracks(&self, run: &RunId) -> Result<Vec<ServiceTrack>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT service, genre, position, name, artist, album, service_url, cover_url, isrc
              FROM service_tracks
             WHERE run_id = ?1
             ORDER BY genre, service, position;
            "
        )
        .bind(run.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::service_track_from_row).collect()
    }

    /// Replaces the run's consensus for a genre, entries and playlist row together
    pub async fn replace_consensus(
        &self,
        run: &RunId,
        genre: Genre,
        entries: &[ConsensusEntry],
        playlist: &ConsensusPlaylist
    ) -> Result<(), EtlError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM consensus_entries WHERE run_id = ?1 AND genre = ?2;")
            .bind(run.as_str())
            .bind(genre.as_str())
            .execute(&mut *tx)
            .await?;

        for e in entries {
            sqlx::query(
                r"
                INSERT INTO consensus_entries (
                    run_id, genre, position, isrc, service,
                    service_position, service_count, sort_key
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);
                "
            )
            .bind(run.as_str())
            .bind(e.genre.as_str())
            .bind(e.position as i64)
            .bind(e.isrc.as_str())
            .bind(e.service.as_str())
            .bind(e.service_position as i64)
            .bind(e.service_count as i64)
            .bind(e.sort_key as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r"
            INSERT INTO consensus_playlists (
                run_id, genre, name, url, cover_url, description, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(run_id, genre) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                cover_url = excluded.cover_url,
                description = excluded.description,
                updated_at = excluded.updated_at;
            "
        )
        .bind(run.as_str())
        .bind(playlist.genre.as_str())
        .bind(&playlist.name)
        .bind(&playlist.url)
        .bind(&playlist.cover_url)
        .bind(&playlist.description)
        .bind(ts(playlist.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn consensus_entries(&self, run: &RunId, genre: Genre) -> Result<Vec<ConsensusEntry>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT genre, position, isrc, service, service_position, service_count, sort_key
              FROM consensus_entries
             WHERE run_id = ?1 AND genre = ?2
             ORDER BY position;
            "
        )
        .bind(run.as_str())
        .bind(genre.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Ok(ConsensusEntry {
            genre: stored_genre(&r.get::<String, _>("genre"))?,
            position: r.get::<i64, _>("position") as u32,
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?,
            service: stored_service(&r.get::<String, _>("service"))?,
            service_position: r.get::<i64, _>("service_position") as u32,
            service_count: r.get::<i64, _>("service_count") as u8,
            sort_key: r.get::<i64, _>("sort_key") as u32
        })).collect()
    }

    /// Distinct isrcs on any consensus of the run
    pub async fn consensus_isrcs(&self, run: &RunId) -> Result<Vec<Isrc>, EtlError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT isrc FROM consensus_entries WHERE run_id = ?1 ORDER BY isrc;"
        )
        .bind(run.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|s| stored_isrc(s)).collect()
    }

    /*
     * Publication
     */

    /// Run whose consensus is served for a genre: the oldest one present
    pub async fn published_run(&self, genre: Genre) -> Result<Option<RunId>, EtlError> {
        let run: Option<String> = sqlx::query_scalar(
            "SELECT MIN(run_id) FROM consensus_playlists WHERE genre = ?1;"
        )
        .bind(genre.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(run.map(RunId::from_raw))
    }

    pub async fn run_ids(&self) -> Result<Vec<RunId>, EtlError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r"
            SELECT run_id FROM raw_playlists
            UNION SELECT run_id FROM service_tracks
            UNION SELECT run_id FROM consensus_playlists
            ORDER BY run_id;
            "
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RunId::from_raw).collect())
    }

    async fn delete_runs(&self, run: &RunId, keep: bool) -> Result<u64, EtlError> {
        let op = if keep { "<>" } else { "=" };
        let mut tx = self.pool.begin().await?;
        let mut removed = 0_u64;
        for table in RUN_SCOPED {
            let sql = format!("DELETE FROM {table} WHERE run_id {op} ?1;");
            removed += sqlx::query(&sql)
                .bind(run.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Deletes rows of every run except `run`
    pub async fn retire_other_runs(&self, run: &RunId) -> Result<u64, EtlError> {
        self.delete_runs(run, true).await
    }

    /// Deletes rows written by `run`
    pub async fn discard_run(&self, run: &RunId) -> Result<u64, EtlError> {
        self.delete_runs(run, false).await
    }

    /*
     * Canonical tracks
     */

    pub async fn upsert_canonical(&self, t: &CanonicalTrack) -> Result<(), EtlError> {
        sqlx::query(
            r"
            INSERT INTO canonical_tracks (
                isrc, name, artist, album, cover_url, spotify_url, apple_music_url,
                soundcloud_url, youtube_url, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(isrc) DO UPDATE SET
                name = excluded.name,
                artist = excluded.artist,
                album = COALESCE(excluded.album, album),
                cover_url = COALESCE(excluded.cover_url, cover_url),
                spotify_url = COALESCE(excluded.spotify_url, spotify_url),
                apple_music_url = COALESCE(excluded.apple_music_url, apple_music_url),
                soundcloud_url = COALESCE(excluded.soundcloud_url, soundcloud_url),
                youtube_url = COALESCE(excluded.youtube_url, youtube_url),
                updated_at = excluded.updated_at;
            "
        )
        .bind(t.isrc.as_str())
        .bind(&t.name)
        .bind(&t.artist)
        .bind(t.album.as_ref())
        .bind(t.cover_url.as_ref())
        .bind(t.spotify_url.as_ref())
        .bind(t.apple_music_url.as_ref())
        .bind(t.soundcloud_url.as_ref())
        .bind(t.youtube_url.as_ref())
        .bind(ts(t.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn canonical_from_row(r: &SqliteRow) -> Result<CanonicalTrack, EtlError> {
        Ok(CanonicalTrack {
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?,
            name: r.get("name"),
            artist: r.get("artist"),
            album: r.try_get("album").ok().flatten(),
            cover_url: r.try_get("cover_url").ok().flatten(),
            spotify_url: r.try_get("spotify_url").ok().flatten(),
            apple_music_url: r.try_get("apple_music_url").ok().flatten(),
            soundcloud_url: r.try_get("soundcloud_url").ok().flatten(),
            youtube_url: r.try_get("youtube_url").ok().flatten(),
            updated_at: parse_ts(&r.get::<String, _>("updated_at"))?
        })
    }

    pub async fn canonical_track(&self, isrc: &Isrc) -> Result<Option<CanonicalTrack>, EtlError> {
        let row = sqlx::query("SELECT * FROM canonical_tracks WHERE isrc = ?1;")
            .bind(isrc.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::canonical_from_row).transpose()
    }

    pub async fn canonical_tracks(&self, isrcs: &[Isrc]) -> Result<Vec<CanonicalTrack>, EtlError> {
        let mut out = Vec::with_capacity(isrcs.len());
        for isrc in isrcs {
            if let Some(t) = self.canonical_track(isrc).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Canonical tracks on the run's consensus that still lack a youtube url
    pub async fn consensus_missing_youtube(&self, run: &RunId) -> Result<Vec<CanonicalTrack>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM canonical_tracks
            WHERE isrc IN (SELECT DISTINCT isrc FROM consensus_entries WHERE run_id = ?1)
              AND (youtube_url IS NULL OR youtube_url = '')
            ORDER BY isrc;
            "
        )
        .bind(run.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::canonical_from_row).collect()
    }

    pub async fn set_youtube_url(&self, isrc: &Isrc, url: &str) -> Result<(), EtlError> {
        sqlx::query("UPDATE canonical_tracks SET youtube_url = ?1, updated_at = ?2 WHERE isrc = ?3;")
            .bind(url)
            .bind(Self::now())
            .bind(isrc.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_canonical_update(&self) -> Result<Option<DateTime<Utc>>, EtlError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT MAX(updated_at) FROM canonical_tracks;")
            .fetch_one(&self.pool)
            .await?;
        raw.as_deref().map(parse_ts).transpose()
    }

    /*
     * Play counts
     */

    pub async fn upsert_snapshot(&self, s: &PlayCountSnapshot) -> Result<(), EtlError> {
        sqlx::query(
            r"
            INSERT INTO play_count_snapshots (isrc, service, day, count, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(isrc, service, day) DO UPDATE SET
                count = excluded.count,
                recorded_at = excluded.recorded_at;
            "
        )
        .bind(s.isrc.as_str())
        .bind(s.service.as_str())
        .bind(day_str(s.day))
        .bind(s.count)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn snapshots_for(&self, isrc: &Isrc) -> Result<Vec<PlayCountSnapshot>, EtlError> {
        let rows = sqlx::query(
            "SELECT isrc, service, day, count FROM play_count_snapshots WHERE isrc = ?1 ORDER BY service, day;"
        )
        .bind(isrc.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(PlayCountSnapshot {
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?,
            service: stored_service(&r.get::<String, _>("service"))?,
            day: parse_day(&r.get::<String, _>("day"))?,
            count: r.get("count")
        })).collect()
    }

    /// Isrcs holding at least one snapshot on `day`
    pub async fn isrcs_with_snapshot_on(&self, day: NaiveDate) -> Result<Vec<Isrc>, EtlError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT isrc FROM play_count_snapshots WHERE day = ?1 ORDER BY isrc;"
        )
        .bind(day_str(day))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|s| stored_isrc(s)).collect()
    }

    /// Replaces every aggregate row of an isrc for one day
    pub async fn replace_aggregates(
        &self,
        isrc: &Isrc,
        day: NaiveDate,
        rows: &[AggregateCount]
    ) -> Result<(), EtlError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM aggregate_counts WHERE isrc = ?1 AND day = ?2;")
            .bind(isrc.as_str())
            .bind(day_str(day))
            .execute(&mut *tx)
            .await?;
        for a in rows {
            sqlx::query(
                r"
                INSERT INTO aggregate_counts (
                    isrc, service, day, current_count, comparison_day,
                    comparison_count, abs_change, pct_change
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);
                "
            )
            .bind(a.isrc.as_str())
            .bind(a.service.as_str())
            .bind(day_str(a.day))
            .bind(a.current)
            .bind(day_str(a.comparison_day))
            .bind(a.comparison)
            .bind(a.abs_change)
            .bind(a.pct_change)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Aggregate rows of the latest day recorded for an isrc
    pub async fn latest_aggregates(&self, isrc: &Isrc) -> Result<Vec<AggregateCount>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT isrc, service, day, current_count, comparison_day,
                   comparison_count, abs_change, pct_change
              FROM aggregate_counts
             WHERE isrc = ?1
               AND day = (SELECT MAX(day) FROM aggregate_counts WHERE isrc = ?1)
             ORDER BY service;
            "
        )
        .bind(isrc.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(AggregateCount {
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?,
            service: stored_service(&r.get::<String, _>("service"))?,
            day: parse_day(&r.get::<String, _>("day"))?,
            current: r.get("current_count"),
            comparison_day: parse_day(&r.get::<String, _>("comparison_day"))?,
            comparison: r.get("comparison_count"),
            abs_change: r.get("abs_change"),
            pct_change: r.get("pct_change")
        })).collect()
    }

    /*
     * Read views
     */

    pub async fn consensus_rows(&self, run: &RunId, genre: Genre) -> Result<Vec<ConsensusRow>, EtlError> {
        let rows = sqlx::query(
            r"
            SELECT c.position, c.isrc, c.service, c.service_count,
                   COALESCE(k.name, s.name) AS name,
                   COALESCE(k.artist, s.artist) AS artist,
                   COALESCE(k.album, s.album) AS album,
                   COALESCE(k.cover_url, s.cover_url) AS cover_url,
                   k.spotify_url, k.apple_music_url, k.soundcloud_url, k.youtube_url
              FROM consensus_entries c
              JOIN service_tracks s
                ON s.run_id = c.run_id AND s.genre = c.genre
               AND s.service = c.service AND s.position = c.service_position
              LEFT JOIN canonical_tracks k ON k.isrc = c.isrc
             WHERE c.run_id = ?1 AND c.genre = ?2
             ORDER BY c.position;
            "
        )
        .bind(run.as_str())
        .bind(genre.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Ok(ConsensusRow {
            position: r.get::<i64, _>("position") as u32,
            isrc: stored_isrc(&r.get::<String, _>("isrc"))?,
            service: stored_service(&r.get::<String, _>("service"))?,
            service_count: r.get::<i64, _>("service_count") as u8,
            name: r.get("name"),
            artist: r.get("artist"),
            album: r.try_get("album").ok().flatten(),
            cover_url: r.try_get("cover_url").ok().flatten(),
            spotify_url: r.try_get("spotify_url").ok().flatten(),
            apple_music_url: r.try_get("apple_music_url").ok().flatten(),
            soundcloud_url: r.try_get("soundcloud_url").ok().flatten(),
            youtube_url: r.try_get("youtube_url").ok().flatten()
        })).collect()
    }

    pub async fn consensus_playlist(&self, run: &RunId, genre: Genre) -> Result<Option<ConsensusPlaylist>, EtlError> {
        let row = sqlx::query(
            r"
            SELECT genre, name, url, cover_url, description, updated_at
              FROM consensus_playlists
             WHERE run_id = ?1 AND genre = ?2;
            "
        )
        .bind(run.as_str())
        .bind(genre.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Ok(ConsensusPlaylist {
            genre: stored_genre(&r.get::<String, _>("genre"))?,
            name: r.get("name"),
            url: r.get("url"),
            cover_url: r.get("cover_url"),
            description: r.get("description"),
            updated_at: parse_ts(&r.get::<String, _>("updated_at"))?
        })).transpose()
    }

    pub async fn raw_playlist_meta(
        &self,
        run: &RunId,
        service: ServiceName,
        genre: Genre
    ) -> Result<Option<PlaylistMeta>, EtlError> {
        let row = sqlx::query(
            r"
            SELECT playlist_url, playlist_name, cover_url, description
              FROM raw_playlists
             WHERE run_id = ?1 AND service = ?2 AND genre = ?3;
            "
        )
        .bind(run.as_str())
        .bind(service.as_str())
        .bind(genre.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| PlaylistMeta {
            url: r.get("playlist_url"),
            name: r.try_get("playlist_name").ok().flatten(),
            cover_url: r.try_get("cover_url").ok().flatten(),
            description: r.try_get("description").ok().flatten()
        }))
    }
}

#[async_trait]
impl KvCache for Persistent {
    async fn get(&self, prefix: CachePrefix, key: &str) -> Result<Option<String>, EtlError> {
        let value: Option<String> = sqlx::query_scalar(
            r"
            SELECT value FROM cache_entries
             WHERE prefix = ?1 AND key = ?2
               AND (expires_at IS NULL OR expires_at > ?3);
            "
        )
        .bind(prefix.as_str())
        .bind(key)
        .bind(Self::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EtlError::Cache(e.to_string()))?;
        Ok(value)
    }

    async fn set(
        &self,
        prefix: CachePrefix,
        key: &str,
        value: &str,
        ttl: Option<Duration>
    ) -> Result<(), EtlError> {
        sqlx::query(
            r"
            INSERT INTO cache_entries (prefix, key, value, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(prefix, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at;
            "
        )
        .bind(prefix.as_str())
        .bind(key)
        .bind(value)
        .bind(expiry_from(Utc::now(), ttl).map(ts))
        .execute(&self.pool)
        .await
        .map_err(|e| EtlError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: CachePrefix) -> Result<u64, EtlError> {
        let done = sqlx::query("DELETE FROM cache_entries WHERE prefix = ?1;")
            .bind(prefix.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| EtlError::Cache(e.to_string()))?;
        Ok(done.rows_affected())
    }
}
