//! Public Spotify Web API: client-credentials grant, ISRC resolution, text search
//! availability, playlist followers.

use async_trait::async_trait;
use catsync_core::{similarity, BearerToken, Platform, PlatformIdentifier, MATCH_THRESHOLD};
use catsync_storage::HttpExecutor;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    AvailabilityProbe, CredentialsGrant, Endpoints, FollowerSource, PlatformError, TrackResolver,
};

const ISRC_SEARCH_LIMIT: &str = "5";
const TEXT_SEARCH_LIMIT: &str = "10";

#[derive(Debug, Clone, Default)]
pub struct SpotifyCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tracks: Option<TrackPage>,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<Option<SearchTrack>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchTrack {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub artists: Vec<SearchArtist>,
    pub album: Option<SearchAlbum>,
    #[serde(default)]
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchArtist {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchAlbum {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalIds {
    pub isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistFollowers {
    #[serde(default)]
    followers: Option<FollowerTotal>,
}

#[derive(Debug, Deserialize)]
struct FollowerTotal {
    #[serde(default)]
    total: i64,
}

impl SearchResponse {
    fn into_tracks(self) -> Vec<SearchTrack> {
        self.tracks
            .map(|page| page.items.into_iter().flatten().collect())
            .unwrap_or_default()
    }
}

/// Picks the candidate whose own ISRC equals `isrc` (ignoring case), else the first one.
/// Returns `None` when there is nothing to pick or the pick lacks a track or album id.
pub fn select_candidate(items: &[SearchTrack], isrc: &str) -> Option<PlatformIdentifier> {
    let best = items
        .iter()
        .find(|t| {
            t.external_ids
                .isrc
                .as_deref()
                .is_some_and(|code| code.eq_ignore_ascii_case(isrc))
        })
        .or_else(|| items.first())?;

    let track_id = best.id.clone().filter(|id| !id.is_empty())?;
    let album_id = best
        .album
        .as_ref()
        .and_then(|a| a.id.clone())
        .filter(|id| !id.is_empty())?;
    let artists = best
        .artists
        .iter()
        .filter_map(|a| a.name.as_deref())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();

    Some(PlatformIdentifier {
        platform: Platform::Spotify,
        track_id,
        album_id,
        resolved_title: best.name.clone(),
        resolved_artist: (!artists.is_empty()).then(|| artists.join(" & ")),
    })
}

/// Text-search match rule: title close enough and at least one credited artist close enough.
pub fn candidate_matches(candidate: &SearchTrack, artist: &str, title: &str, threshold: f64) -> bool {
    let name = candidate.name.as_deref().unwrap_or_default();
    similarity(name, title) >= threshold
        && candidate
            .artists
            .iter()
            .filter_map(|a| a.name.as_deref())
            .any(|candidate_artist| similarity(candidate_artist, artist) >= threshold)
}

#[derive(Debug, Clone)]
pub struct SpotifyWebApi {
    http: HttpExecutor,
    endpoints: Endpoints,
    credentials: SpotifyCredentials,
    match_threshold: f64,
}

impl SpotifyWebApi {
    pub fn new(http: HttpExecutor, endpoints: Endpoints, credentials: SpotifyCredentials) -> Self {
        Self {
            http,
            endpoints,
            credentials,
            match_threshold: MATCH_THRESHOLD,
        }
    }

    pub fn with_match_threshold(mut self, threshold: f64) -> Self {
        self.match_threshold = threshold;
        self
    }

    async fn search(
        &self,
        label: &str,
        query: &str,
        limit: &str,
        token: &BearerToken,
    ) -> Result<Vec<SearchTrack>, PlatformError> {
        let url = format!("{}/search", self.endpoints.spotify_api_base);
        let response: SearchResponse = self
            .http
            .send_json(label, |client| {
                client
                    .get(&url)
                    .bearer_auth(token.secret())
                    .query(&[("q", query), ("type", "track"), ("limit", limit)])
            })
            .await?;
        Ok(response.into_tracks())
    }
}

#[async_trait]
impl CredentialsGrant for SpotifyWebApi {
    async fn client_credentials_token(&self) -> Result<BearerToken, PlatformError> {
        let client_id = self
            .credentials
            .client_id
            .as_deref()
            .ok_or(PlatformError::MissingConfig("SPOTIFY_CLIENT_ID"))?;
        let client_secret = self
            .credentials
            .client_secret
            .as_deref()
            .ok_or(PlatformError::MissingConfig("SPOTIFY_CLIENT_SECRET"))?;

        info!("requesting spotify client-credentials token");
        let response: TokenResponse = self
            .http
            .send_json("spotify token", |client| {
                client
                    .post(&self.endpoints.spotify_token_url)
                    .basic_auth(client_id, Some(client_secret))
                    .form(&[("grant_type", "client_credentials")])
            })
            .await?;

        if response.access_token.is_empty() {
            return Err(PlatformError::Unexpected("empty access_token".into()));
        }
        Ok(BearerToken::new(response.access_token))
    }
}

#[async_trait]
impl TrackResolver for SpotifyWebApi {
    async fn resolve(
        &self,
        isrc: &str,
        token: &BearerToken,
    ) -> Result<Option<PlatformIdentifier>, PlatformError> {
        let query = format!("isrc:{isrc}");
        let items = self
            .search("spotify isrc search", &query, ISRC_SEARCH_LIMIT, token)
            .await?;
        let resolved = select_candidate(&items, isrc);
        debug!(isrc, candidates = items.len(), resolved = resolved.is_some(), "resolved isrc");
        Ok(resolved)
    }
}

#[async_trait]
impl AvailabilityProbe for SpotifyWebApi {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    async fn lookup(
        &self,
        artist: &str,
        title: &str,
        token: &BearerToken,
    ) -> Result<bool, PlatformError> {
        let query = format!("track:{title} artist:{artist}");
        let items = self
            .search("spotify text search", &query, TEXT_SEARCH_LIMIT, token)
            .await?;
        let found = items
            .iter()
            .find(|item| candidate_matches(item, artist, title, self.match_threshold));
        match found {
            Some(item) => info!(title, artist, matched = item.name.as_deref().unwrap_or_default(), "spotify match found"),
            None => info!(title, artist, candidates = items.len(), "no spotify match"),
        }
        Ok(found.is_some())
    }
}

#[async_trait]
impl FollowerSource for SpotifyWebApi {
    async fn followers(
        &self,
        playlist_id: &str,
        token: &BearerToken,
    ) -> Result<Option<i64>, PlatformError> {
        let url = format!("{}/playlists/{playlist_id}", self.endpoints.spotify_api_base);
        let result = self
            .http
            .send_json::<PlaylistFollowers, _>("spotify playlist followers", |client| {
                client
                    .get(&url)
                    .bearer_auth(token.secret())
                    .query(&[("fields", "followers.total")])
            })
            .await;

        match result {
            Ok(body) => Ok(Some(body.followers.map(|f| f.total).unwrap_or(0))),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
