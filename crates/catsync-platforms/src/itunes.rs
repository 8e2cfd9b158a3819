//! Apple Music availability through the public iTunes Search API.

use async_trait::async_trait;
use catsync_core::{similarity, BearerToken, Platform, MATCH_THRESHOLD};
use catsync_storage::{HttpExecutor, RetryPolicy};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{AvailabilityProbe, Endpoints, PlatformError};

const SEARCH_ENTITIES: &str = "musicTrack,album";
const SEARCH_COUNTRY: &str = "GB";
const SEARCH_LIMIT: &str = "20";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ITunesResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ITunesResult {
    pub track_name: Option<String>,
    pub collection_name: Option<String>,
    pub artist_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScores {
    pub artist: f64,
    pub title: f64,
    pub album: f64,
}

impl MatchScores {
    pub fn score(result: &ITunesResult, artist: &str, title: &str) -> Self {
        Self {
            artist: similarity(result.artist_name.as_deref().unwrap_or_default(), artist),
            title: similarity(result.track_name.as_deref().unwrap_or_default(), title),
            album: similarity(result.collection_name.as_deref().unwrap_or_default(), title),
        }
    }

    /// Artist must match; then either the track name or the album name may carry the title.
    pub fn accepts(&self, threshold: f64) -> bool {
        self.artist >= threshold && (self.title >= threshold || self.album >= threshold)
    }
}

#[derive(Debug, Clone)]
pub struct ITunesSearch {
    http: HttpExecutor,
    endpoints: Endpoints,
    match_threshold: f64,
}

impl ITunesSearch {
    /// Reuses `http`'s connection pool under the slower search retry policy.
    pub fn new(http: &HttpExecutor, endpoints: Endpoints) -> Self {
        Self::with_policy(http, endpoints, RetryPolicy::throttled_search())
    }

    pub fn with_policy(http: &HttpExecutor, endpoints: Endpoints, policy: RetryPolicy) -> Self {
        Self {
            http: http.with_policy(policy),
            endpoints,
            match_threshold: MATCH_THRESHOLD,
        }
    }
}

#[async_trait]
impl AvailabilityProbe for ITunesSearch {
    fn platform(&self) -> Platform {
        Platform::AppleMusic
    }

    async fn lookup(
        &self,
        artist: &str,
        title: &str,
        _token: &BearerToken,
    ) -> Result<bool, PlatformError> {
        let term = format!("{artist} {title}");
        let response: SearchResponse = self
            .http
            .send_json("itunes search", |client| {
                client.get(&self.endpoints.itunes_search_url).query(&[
                    ("term", term.as_str()),
                    ("entity", SEARCH_ENTITIES),
                    ("country", SEARCH_COUNTRY),
                    ("limit", SEARCH_LIMIT),
                ])
            })
            .await?;

        for result in &response.results {
            let scores = MatchScores::score(result, artist, title);
            debug!(?scores, candidate = result.track_name.as_deref().unwrap_or_default(), "scored itunes candidate");
            if scores.accepts(self.match_threshold) {
                info!(title, artist, "apple music match found");
                return Ok(true);
            }
        }
        info!(title, artist, candidates = response.results.len(), "no apple music match");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server;
    use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
    use catsync_storage::HttpClientConfig;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn album_name_can_stand_in_for_title() {
        let scores = MatchScores {
            artist: 0.9,
            title: 0.80,
            album: 0.90,
        };
        assert!(scores.accepts(MATCH_THRESHOLD));
    }

    #[test]
    fn weak_artist_rejects_even_perfect_title() {
        let scores = MatchScores {
            artist: 0.80,
            title: 1.0,
            album: 1.0,
        };
        assert!(!scores.accepts(MATCH_THRESHOLD));
    }

    #[test]
    fn scores_compare_against_both_track_and_collection() {
        let result = ITunesResult {
            track_name: Some("Intro".into()),
            collection_name: Some("Midnight Drive".into()),
            artist_name: Some("Nova".into()),
        };
        let scores = MatchScores::score(&result, "nova", "Midnight Drive");
        assert_eq!(scores.artist, 1.0);
        assert_eq!(scores.album, 1.0);
        assert!(scores.title < MATCH_THRESHOLD);
        assert!(scores.accepts(MATCH_THRESHOLD));
    }

    async fn throttled_once(State(hits): State<Arc<AtomicU32>>) -> Result<Json<Value>, StatusCode> {
        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(StatusCode::FORBIDDEN);
        }
        Ok(Json(json!({
            "resultCount": 1,
            "results": [
                { "trackName": "Blinding Lights", "collectionName": "After Hours", "artistName": "The Weeknd" }
            ]
        })))
    }

    #[tokio::test]
    async fn forbidden_is_retried_then_matches() {
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route("/search", get(throttled_once))
            .with_state(hits.clone());
        let base = test_server::spawn(app).await;
        let http = HttpExecutor::new(HttpClientConfig::default()).expect("http client");
        let search = ITunesSearch::with_policy(&http, Endpoints::rooted_at(&base), RetryPolicy::immediate(3));

        let found = search
            .lookup("The Weeknd", "Blinding Lights", &BearerToken::new("unused"))
            .await
            .expect("lookup after throttle");
        assert!(found);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
