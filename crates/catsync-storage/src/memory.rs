//! In-process [`SnapshotStore`] with the same keyed-upsert semantics as Postgres.

use std::collections::BTreeMap;

use async_trait::async_trait;
use catsync_core::{
    AvailabilitySnapshot, CatalogueTrack, FollowerSnapshot, MetricSnapshot, Platform, UserPlaylist,
};
use chrono::NaiveDate;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{SnapshotRow, SnapshotStore, StoreError};

type MetricKey = (Platform, Uuid, NaiveDate);
type HealthKey = (NaiveDate, Uuid);

#[derive(Debug, Default)]
struct MemoryState {
    tracks: Vec<CatalogueTrack>,
    playlists: Vec<UserPlaylist>,
    metrics: BTreeMap<MetricKey, MetricSnapshot>,
    availability: BTreeMap<HealthKey, AvailabilitySnapshot>,
    followers: BTreeMap<MetricKey, FollowerSnapshot>,
    commits: usize,
    refreshes: usize,
    /// Commits allowed before every further commit fails.
    commit_budget: Option<usize>,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    state: Mutex<MemoryState>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalogue(tracks: Vec<CatalogueTrack>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                tracks,
                ..Default::default()
            }),
        }
    }

    pub async fn add_playlist(&self, playlist: UserPlaylist) {
        self.state.lock().await.playlists.push(playlist);
    }

    /// After `commits` successful commits, every further commit fails.
    pub async fn fail_commits_after(&self, commits: usize) {
        self.state.lock().await.commit_budget = Some(commits);
    }

    /// Makes every read fail as if the database were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn metrics(&self) -> Vec<MetricSnapshot> {
        self.state.lock().await.metrics.values().cloned().collect()
    }

    pub async fn availability(&self) -> Vec<AvailabilitySnapshot> {
        self.state.lock().await.availability.values().cloned().collect()
    }

    pub async fn followers(&self) -> Vec<FollowerSnapshot> {
        self.state.lock().await.followers.values().cloned().collect()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commits
    }

    pub async fn refresh_count(&self) -> usize {
        self.state.lock().await.refreshes
    }
}

fn check_available(state: &MemoryState) -> Result<(), StoreError> {
    if state.unavailable {
        Err(StoreError::Unavailable("in-memory store switched off".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn catalogue_for_user(&self, user_id: &str) -> Result<Vec<CatalogueTrack>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state
            .tracks
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn playlists_for_user(&self, user_id: &str) -> Result<Vec<UserPlaylist>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state
            .playlists
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn catalogue_owners(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut owners = state
            .tracks
            .iter()
            .map(|t| t.user_id.clone())
            .collect::<Vec<_>>();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }

    async fn commit_batch(&self, rows: &[SnapshotRow]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        if let Some(budget) = state.commit_budget {
            if state.commits >= budget {
                return Err(StoreError::Unavailable("commit rejected".into()));
            }
        }
        for row in rows {
            match row {
                SnapshotRow::Metric(m) => {
                    state
                        .metrics
                        .insert((m.platform, m.track_uid, m.snapshot_date), m.clone());
                }
                SnapshotRow::Availability(a) => {
                    state
                        .availability
                        .insert((a.snapshot_date, a.track_uid), a.clone());
                }
                SnapshotRow::Followers(f) => {
                    state
                        .followers
                        .insert((f.platform, f.playlist_uid, f.snapshot_date), f.clone());
                }
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn refresh_daily_delta(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        state.refreshes += 1;
        Ok(())
    }
}
