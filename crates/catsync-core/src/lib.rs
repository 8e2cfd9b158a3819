//! Core domain model for catalogue synchronization.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod similarity;

pub use similarity::{similarity, MATCH_THRESHOLD};

pub const CRATE_NAME: &str = "catsync-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Spotify,
    AppleMusic,
}

impl Platform {
    /// Value stored in the `platform` column of snapshot tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::AppleMusic => "apple_music",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the user's catalogue. Reference data owned outside this engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueTrack {
    pub track_uid: Uuid,
    pub isrc: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub user_id: String,
}

/// Platform-side identity of a catalogue track, recomputed every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformIdentifier {
    pub platform: Platform,
    pub track_id: String,
    pub album_id: String,
    pub resolved_title: Option<String>,
    pub resolved_artist: Option<String>,
}

impl PlatformIdentifier {
    pub fn track_uri(&self) -> String {
        format!("spotify:track:{}", self.track_id)
    }

    pub fn album_uri(&self) -> String {
        format!("spotify:album:{}", self.album_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub platform: Platform,
    pub track_uid: Uuid,
    pub snapshot_date: NaiveDate,
    pub counter_value: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    pub snapshot_date: NaiveDate,
    pub track_uid: Uuid,
    pub apple_music_present: bool,
    pub spotify_present: bool,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPlaylist {
    pub playlist_uid: Uuid,
    pub playlist_id: String,
    pub playlist_name: Option<String>,
    pub user_id: String,
}

impl UserPlaylist {
    /// Playlist id with any `spotify:playlist:` URI prefix removed.
    pub fn bare_id(&self) -> &str {
        self.playlist_id
            .strip_prefix("spotify:playlist:")
            .unwrap_or(&self.playlist_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerSnapshot {
    pub platform: Platform,
    pub playlist_uid: Uuid,
    pub snapshot_date: NaiveDate,
    pub followers: i64,
    pub user_id: String,
}

/// Bearer credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken(<{} chars>)", self.0.len())
    }
}

/// Credentials lifted from the platform's own web client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebTokens {
    pub bearer: BearerToken,
    pub client_token: Option<String>,
}

/// Every credential one run needs, acquired once up front and never refetched mid-run.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub search: BearerToken,
    pub web: WebTokens,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Streams,
    PlaylistFollowers,
    CatalogueHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassCounts {
    pub processed: usize,
    pub errored: usize,
    pub skipped: usize,
}

/// Result of one pass (streams, followers or catalogue health) over a user's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pass: PassKind,
    pub snapshot_date: NaiveDate,
    pub status: RunStatus,
    pub counts: PassCounts,
    /// Sum of persisted counter values; only meaningful for the streams pass.
    pub total_counter: Option<i64>,
    pub error: Option<String>,
}

impl PassReport {
    pub fn failed(pass: PassKind, snapshot_date: NaiveDate, counts: PassCounts, error: String) -> Self {
        Self {
            pass,
            snapshot_date,
            status: RunStatus::Failed,
            counts,
            total_counter: None,
            error: Some(error),
        }
    }
}

/// Structured answer to "synchronize catalogue for user".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub user_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passes: Vec<PassReport>,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn from_passes(
        user_id: impl Into<String>,
        started_at: DateTime<Utc>,
        passes: Vec<PassReport>,
    ) -> Self {
        let errors = passes
            .iter()
            .filter_map(|p| p.error.as_ref().map(|e| format!("{:?}: {e}", p.pass)))
            .collect::<Vec<_>>();
        let status = if errors.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        Self {
            user_id: user_id.into(),
            status,
            started_at,
            finished_at: Utc::now(),
            passes,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        }
    }

    pub fn pass(&self, kind: PassKind) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.pass == kind)
    }

    /// Counts summed over every pass that ran.
    pub fn totals(&self) -> PassCounts {
        self.passes.iter().fold(PassCounts::default(), |acc, p| PassCounts {
            processed: acc.processed + p.counts.processed,
            errored: acc.errored + p.counts.errored,
            skipped: acc.skipped + p.counts.skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(pass: PassKind, processed: usize, error: Option<&str>) -> PassReport {
        PassReport {
            pass,
            snapshot_date: NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date"),
            status: if error.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Success
            },
            counts: PassCounts {
                processed,
                errored: 1,
                skipped: 0,
            },
            total_counter: None,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn playlist_uri_prefix_is_stripped() {
        let playlist = UserPlaylist {
            playlist_uid: Uuid::nil(),
            playlist_id: "spotify:playlist:37i9dQZF1DXcBWIGoYBM5M".into(),
            playlist_name: None,
            user_id: "u1".into(),
        };
        assert_eq!(playlist.bare_id(), "37i9dQZF1DXcBWIGoYBM5M");
    }

    #[test]
    fn bearer_debug_hides_secret() {
        let token = BearerToken::new("super-secret");
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[test]
    fn outcome_fails_when_any_pass_failed() {
        let outcome = SyncOutcome::from_passes(
            "u1",
            Utc::now(),
            vec![
                report(PassKind::Streams, 3, None),
                report(PassKind::CatalogueHealth, 0, Some("db down")),
            ],
        );
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error.as_deref().expect("run error").contains("db down"));
        assert_eq!(outcome.totals().processed, 3);
        assert_eq!(outcome.totals().errored, 2);
    }
}
