//! Snapshot persistence: the store contract, the Postgres implementation, and the
//! batching writer shared by every pass.

use async_trait::async_trait;
use catsync_core::{
    AvailabilitySnapshot, CatalogueTrack, FollowerSnapshot, MetricSnapshot, UserPlaylist,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRow {
    Metric(MetricSnapshot),
    Availability(AvailabilitySnapshot),
    Followers(FollowerSnapshot),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn catalogue_for_user(&self, user_id: &str) -> Result<Vec<CatalogueTrack>, StoreError>;

    async fn playlists_for_user(&self, user_id: &str) -> Result<Vec<UserPlaylist>, StoreError>;

    /// Distinct owners of catalogue rows; the scheduler's work list.
    async fn catalogue_owners(&self) -> Result<Vec<String>, StoreError>;

    /// Upserts every row inside one transaction: all rows land or none do. A row whose
    /// key already exists has its value fields overwritten.
    async fn commit_batch(&self, rows: &[SnapshotRow]) -> Result<(), StoreError>;

    /// Rebuilds the derived daily-delta view from the streams table.
    async fn refresh_daily_delta(&self) -> Result<(), StoreError>;
}

/// Stages rows and commits them every `batch_size` processed items, so a failure late
/// in a run keeps everything committed before it.
pub struct SnapshotBatcher<'a> {
    store: &'a dyn SnapshotStore,
    batch_size: usize,
    pending: Vec<SnapshotRow>,
    items_since_commit: usize,
    committed_rows: usize,
}

impl<'a> SnapshotBatcher<'a> {
    pub const DEFAULT_BATCH_SIZE: usize = 10;

    pub fn new(store: &'a dyn SnapshotStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            pending: Vec::new(),
            items_since_commit: 0,
            committed_rows: 0,
        }
    }

    pub fn stage(&mut self, row: SnapshotRow) {
        self.pending.push(row);
    }

    /// Marks one catalogue item as handled and commits when the batch is full.
    pub async fn item_done(&mut self) -> Result<(), StoreError> {
        self.items_since_commit += 1;
        if self.items_since_commit >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StoreError> {
        self.items_since_commit = 0;
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.commit_batch(&self.pending).await?;
        self.committed_rows += self.pending.len();
        debug!(rows = self.pending.len(), total = self.committed_rows, "committed snapshot batch");
        self.pending.clear();
        Ok(())
    }

    pub fn committed_rows(&self) -> usize {
        self.committed_rows
    }

    /// Drops whatever has not been committed yet and reports how many rows that was.
    pub fn discard(self) -> usize {
        if !self.pending.is_empty() {
            warn!(rows = self.pending.len(), "discarding uncommitted snapshot rows");
        }
        self.pending.len()
    }
}

const UPSERT_STREAMS: &str = r#"
    INSERT INTO streams (platform, track_uid, stream_date, playcount, user_id)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (platform, track_uid, stream_date)
    DO UPDATE SET playcount = EXCLUDED.playcount,
                  user_id = EXCLUDED.user_id,
                  updated_at = NOW()
"#;

const UPSERT_HEALTH: &str = r#"
    INSERT INTO catalogue_health_status
        (check_date, track_uid, apple_music_status, spotify_status, user_id)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (check_date, track_uid)
    DO UPDATE SET apple_music_status = EXCLUDED.apple_music_status,
                  spotify_status = EXCLUDED.spotify_status,
                  user_id = EXCLUDED.user_id,
                  updated_at = NOW()
"#;

const UPSERT_FOLLOWERS: &str = r#"
    INSERT INTO playlist_followers (platform, playlist_uid, snapshot_date, followers, user_id)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (platform, playlist_uid, snapshot_date)
    DO UPDATE SET followers = EXCLUDED.followers,
                  user_id = EXCLUDED.user_id,
                  updated_at = NOW()
"#;

#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    async fn upsert(tx: &mut Transaction<'_, Postgres>, row: &SnapshotRow) -> Result<(), StoreError> {
        match row {
            SnapshotRow::Metric(m) => {
                sqlx::query(UPSERT_STREAMS)
                    .bind(m.platform.as_str())
                    .bind(m.track_uid)
                    .bind(m.snapshot_date)
                    .bind(m.counter_value)
                    .bind(&m.user_id)
                    .execute(&mut **tx)
                    .await?;
            }
            SnapshotRow::Availability(a) => {
                sqlx::query(UPSERT_HEALTH)
                    .bind(a.snapshot_date)
                    .bind(a.track_uid)
                    .bind(a.apple_music_present)
                    .bind(a.spotify_present)
                    .bind(&a.user_id)
                    .execute(&mut **tx)
                    .await?;
            }
            SnapshotRow::Followers(f) => {
                sqlx::query(UPSERT_FOLLOWERS)
                    .bind(f.platform.as_str())
                    .bind(f.playlist_uid)
                    .bind(f.snapshot_date)
                    .bind(f.followers)
                    .bind(&f.user_id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn catalogue_for_user(&self, user_id: &str) -> Result<Vec<CatalogueTrack>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT track_uid, isrc, title, artist, user_id
              FROM track_dim
             WHERE user_id = $1
             ORDER BY isrc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CatalogueTrack {
                track_uid: row.try_get("track_uid")?,
                isrc: row.try_get("isrc")?,
                title: row.try_get("title")?,
                artist: row.try_get("artist")?,
                user_id: row.try_get("user_id")?,
            });
        }
        Ok(out)
    }

    async fn playlists_for_user(&self, user_id: &str) -> Result<Vec<UserPlaylist>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT playlist_uid, playlist_id, playlist_name, user_id
              FROM user_playlists
             WHERE user_id = $1
               AND platform = 'spotify'
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UserPlaylist {
                playlist_uid: row.try_get("playlist_uid")?,
                playlist_id: row.try_get("playlist_id")?,
                playlist_name: row.try_get("playlist_name")?,
                user_id: row.try_get("user_id")?,
            });
        }
        Ok(out)
    }

    async fn catalogue_owners(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM track_dim ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn commit_batch(&self, rows: &[SnapshotRow]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            Self::upsert(&mut tx, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn refresh_daily_delta(&self) -> Result<(), StoreError> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY streams_daily_delta")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
