//! Scripted platform stand-ins shared by the pass tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{BearerToken, CatalogueTrack, Platform, PlatformIdentifier, WebTokens};
use catsync_platforms::{
    AvailabilityProbe, CaptureError, CredentialsGrant, FollowerSource, MetricLookup,
    MissingMetric, PlatformError, PlaycountSource, TrackResolver, WebTokenSource,
};
use uuid::Uuid;

use crate::PlatformClients;

pub fn track(user_id: &str, isrc: &str) -> CatalogueTrack {
    CatalogueTrack {
        track_uid: Uuid::new_v4(),
        isrc: isrc.to_string(),
        title: Some(format!("Song {isrc}")),
        artist: Some("Artist".to_string()),
        user_id: user_id.to_string(),
    }
}

pub struct FakeGrant {
    token: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl FakeGrant {
    pub fn ok(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            token: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsGrant for FakeGrant {
    async fn client_credentials_token(&self) -> Result<BearerToken, PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .map(BearerToken::new)
            .ok_or(PlatformError::MissingConfig("SPOTIFY_CLIENT_ID"))
    }
}

pub struct FakeWeb {
    bearer: Option<String>,
    captures: Arc<AtomicUsize>,
}

impl FakeWeb {
    pub fn ok(bearer: &str) -> Self {
        Self {
            bearer: Some(bearer.to_string()),
            captures: Arc::default(),
        }
    }

    pub fn timing_out() -> Self {
        Self {
            bearer: None,
            captures: Arc::default(),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebTokenSource for FakeWeb {
    async fn capture(&self) -> Result<WebTokens, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        match &self.bearer {
            Some(bearer) => Ok(WebTokens {
                bearer: BearerToken::new(bearer.clone()),
                client_token: Some("client".to_string()),
            }),
            None => Err(CaptureError::Timeout {
                target: "/pathfinder/v2/query".to_string(),
                timeout: Duration::from_secs(30),
            }),
        }
    }
}

#[derive(Default)]
struct FakeCatalog {
    resolutions: HashMap<String, (String, String)>,
    failing_isrcs: HashSet<String>,
    playcounts: HashMap<String, MetricLookup>,
    followers: HashMap<String, i64>,
    failing_playlists: HashSet<String>,
    available: bool,
}

#[async_trait]
impl TrackResolver for FakeCatalog {
    async fn resolve(
        &self,
        isrc: &str,
        _token: &BearerToken,
    ) -> Result<Option<PlatformIdentifier>, PlatformError> {
        if self.failing_isrcs.contains(isrc) {
            return Err(PlatformError::Unexpected(format!("search failed for {isrc}")));
        }
        Ok(self.resolutions.get(isrc).map(|(track_id, album_id)| PlatformIdentifier {
            platform: Platform::Spotify,
            track_id: track_id.clone(),
            album_id: album_id.clone(),
            resolved_title: None,
            resolved_artist: None,
        }))
    }
}

#[async_trait]
impl PlaycountSource for FakeCatalog {
    async fn playcount(
        &self,
        id: &PlatformIdentifier,
        _web: &WebTokens,
    ) -> Result<MetricLookup, PlatformError> {
        Ok(self
            .playcounts
            .get(&id.track_id)
            .copied()
            .unwrap_or(MetricLookup::Missing(MissingMetric::TrackNotListed)))
    }
}

#[async_trait]
impl FollowerSource for FakeCatalog {
    async fn followers(
        &self,
        playlist_id: &str,
        _token: &BearerToken,
    ) -> Result<Option<i64>, PlatformError> {
        if self.failing_playlists.contains(playlist_id) {
            return Err(PlatformError::Unexpected("playlist lookup failed".into()));
        }
        Ok(self.followers.get(playlist_id).copied())
    }
}

struct FakeProbe {
    platform: Platform,
    available: bool,
}

#[async_trait]
impl AvailabilityProbe for FakeProbe {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn lookup(&self, _: &str, _: &str, _: &BearerToken) -> Result<bool, PlatformError> {
        Ok(self.available)
    }
}

/// Builder for a consistent set of fake platforms.
pub struct FakeWorld {
    catalog: FakeCatalog,
    grant_fails: bool,
    web_times_out: bool,
    apple_available: bool,
    grant_calls: Arc<AtomicUsize>,
    web_captures: Arc<AtomicUsize>,
}

/// Live call counters for the token endpoints of a [`FakeWorld`].
#[derive(Clone)]
pub struct TokenCalls {
    grant: Arc<AtomicUsize>,
    web: Arc<AtomicUsize>,
}

impl TokenCalls {
    pub fn grants(&self) -> usize {
        self.grant.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.web.load(Ordering::SeqCst)
    }
}

impl FakeWorld {
    pub fn new() -> Self {
        Self {
            catalog: FakeCatalog {
                available: true,
                ..Default::default()
            },
            grant_fails: false,
            web_times_out: false,
            apple_available: true,
            grant_calls: Arc::default(),
            web_captures: Arc::default(),
        }
    }

    pub fn token_calls(&self) -> TokenCalls {
        TokenCalls {
            grant: self.grant_calls.clone(),
            web: self.web_captures.clone(),
        }
    }

    pub fn with_resolution(mut self, isrc: &str, track_id: &str, album_id: &str) -> Self {
        self.catalog
            .resolutions
            .insert(isrc.to_string(), (track_id.to_string(), album_id.to_string()));
        self
    }

    pub fn with_failing_resolution(mut self, isrc: &str) -> Self {
        self.catalog.failing_isrcs.insert(isrc.to_string());
        self
    }

    pub fn with_playcount(mut self, track_id: &str, lookup: MetricLookup) -> Self {
        self.catalog.playcounts.insert(track_id.to_string(), lookup);
        self
    }

    pub fn with_followers(mut self, playlist_id: &str, followers: i64) -> Self {
        self.catalog.followers.insert(playlist_id.to_string(), followers);
        self
    }

    pub fn with_failing_playlist(mut self, playlist_id: &str) -> Self {
        self.catalog.failing_playlists.insert(playlist_id.to_string());
        self
    }

    pub fn with_failing_grant(mut self) -> Self {
        self.grant_fails = true;
        self
    }

    pub fn with_web_capture_timeout(mut self) -> Self {
        self.web_times_out = true;
        self
    }

    pub fn with_apple_music_available(mut self, available: bool) -> Self {
        self.apple_available = available;
        self
    }

    pub fn clients(self) -> PlatformClients {
        let spotify_available = self.catalog.available;
        let catalog = Arc::new(self.catalog);
        let mut grant = if self.grant_fails {
            FakeGrant::failing()
        } else {
            FakeGrant::ok("server-token")
        };
        grant.calls = self.grant_calls;
        let mut web = if self.web_times_out {
            FakeWeb::timing_out()
        } else {
            FakeWeb::ok("web-token")
        };
        web.captures = self.web_captures;
        PlatformClients {
            grant: Arc::new(grant),
            web_tokens: Arc::new(web),
            resolver: catalog.clone(),
            playcounts: catalog.clone(),
            followers: catalog,
            apple_music: Arc::new(FakeProbe {
                platform: Platform::AppleMusic,
                available: self.apple_available,
            }),
            spotify_search: Arc::new(FakeProbe {
                platform: Platform::Spotify,
                available: spotify_available,
            }),
        }
    }
}
