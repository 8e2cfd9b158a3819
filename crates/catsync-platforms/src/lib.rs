//! Platform client contracts + implementations for the catalogues we reconcile against.

use async_trait::async_trait;
use catsync_core::{BearerToken, Platform, PlatformIdentifier, WebTokens};
use catsync_storage::ExecError;
use thiserror::Error;
use tracing::warn;

pub mod browser;
pub mod itunes;
pub mod pathfinder;
pub mod spotify;

pub use browser::{
    observe_then_close, BrowserSession, CaptureError, ChromiumTokenSniffer, SniffConfig,
    WebTokenSource,
};
pub use itunes::{ITunesSearch, MatchScores};
pub use pathfinder::{extract_playcount, MetricLookup, MissingMetric, PathfinderClient};
pub use spotify::{select_candidate, SpotifyCredentials, SpotifyWebApi};

pub const CRATE_NAME: &str = "catsync-platforms";

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/124.0.0.0 Safari/537.36";

/// Every upstream URL the clients talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub spotify_token_url: String,
    pub spotify_api_base: String,
    pub pathfinder_url: String,
    pub itunes_search_url: String,
    pub web_player_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            spotify_token_url: "https://accounts.spotify.com/api/token".into(),
            spotify_api_base: "https://api.spotify.com/v1".into(),
            pathfinder_url: "https://api-partner.spotify.com/pathfinder/v2/query".into(),
            itunes_search_url: "https://itunes.apple.com/search".into(),
            web_player_url: "https://open.spotify.com/".into(),
        }
    }
}

impl Endpoints {
    /// All endpoints rooted at one base URL, the layout served by local stand-ins.
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            spotify_token_url: format!("{base}/api/token"),
            spotify_api_base: format!("{base}/v1"),
            pathfinder_url: format!("{base}/pathfinder/v2/query"),
            itunes_search_url: format!("{base}/search"),
            web_player_url: format!("{base}/"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Http(#[from] ExecError),
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Server-side client-credentials grant.
#[async_trait]
pub trait CredentialsGrant: Send + Sync {
    async fn client_credentials_token(&self) -> Result<BearerToken, PlatformError>;
}

/// Maps an ISRC to the platform's track/album identifiers.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(
        &self,
        isrc: &str,
        token: &BearerToken,
    ) -> Result<Option<PlatformIdentifier>, PlatformError>;
}

#[async_trait]
pub trait PlaycountSource: Send + Sync {
    async fn playcount(
        &self,
        id: &PlatformIdentifier,
        web: &WebTokens,
    ) -> Result<MetricLookup, PlatformError>;
}

#[async_trait]
pub trait FollowerSource: Send + Sync {
    /// `Ok(None)` when the playlist does not exist upstream.
    async fn followers(
        &self,
        playlist_id: &str,
        token: &BearerToken,
    ) -> Result<Option<i64>, PlatformError>;
}

/// Existence check for a track on one external catalog.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    fn platform(&self) -> Platform;

    async fn lookup(
        &self,
        artist: &str,
        title: &str,
        token: &BearerToken,
    ) -> Result<bool, PlatformError>;

    /// [`lookup`](Self::lookup) with every failure degraded to "not found".
    async fn is_available(&self, artist: &str, title: &str, token: &BearerToken) -> bool {
        match self.lookup(artist, title, token).await {
            Ok(found) => found,
            Err(err) => {
                warn!(platform = %self.platform(), title, artist, error = %err, "availability check failed; recording as absent");
                false
            }
        }
    }
}
