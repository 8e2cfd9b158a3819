//! Album-level GraphQL query against the web player's private API. The per-track
//! playcount is only exposed there.

use async_trait::async_trait;
use catsync_core::{PlatformIdentifier, WebTokens};
use catsync_storage::HttpExecutor;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{Endpoints, PlatformError, PlaycountSource, BROWSER_USER_AGENT};

pub const OPERATION_NAME: &str = "getAlbum";
pub const PERSISTED_QUERY_HASH: &str =
    "97dd13a1f28c80d66115a13697a7ffd94fe3bebdb94da42159456e1d82bfee76";
pub const ALBUM_TRACK_LIMIT: u32 = 50;

/// Why a query succeeded at the HTTP level but yielded no counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingMetric {
    /// No `data.albumUnion.tracksV2.items` in the body.
    NoDataEnvelope,
    TrackNotListed,
    FieldAbsent,
    NotANumber,
}

impl MissingMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoDataEnvelope => "no data envelope",
            Self::TrackNotListed => "track not listed on album",
            Self::FieldAbsent => "playcount field absent",
            Self::NotANumber => "playcount not numeric",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricLookup {
    Found(i64),
    Missing(MissingMetric),
}

impl MetricLookup {
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::Found(v) => Some(*v),
            Self::Missing(_) => None,
        }
    }
}

pub fn query_body(album_uri: &str) -> Value {
    json!({
        "operationName": OPERATION_NAME,
        "variables": {
            "locale": "",
            "offset": 0,
            "limit": ALBUM_TRACK_LIMIT,
            "uri": album_uri,
        },
        "extensions": {
            "persistedQuery": {
                "version": 1,
                "sha256Hash": PERSISTED_QUERY_HASH,
            }
        }
    })
}

fn parse_counter(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        Value::Number(n) => n.as_i64().filter(|v| *v >= 0),
        _ => None,
    }
}

/// Finds `track_uri` in an album query response and reads its playcount.
pub fn extract_playcount(body: &Value, track_uri: &str) -> MetricLookup {
    let Some(items) = body
        .pointer("/data/albumUnion/tracksV2/items")
        .and_then(Value::as_array)
    else {
        return MetricLookup::Missing(MissingMetric::NoDataEnvelope);
    };

    let Some(track) = items
        .iter()
        .filter_map(|item| item.get("track"))
        .find(|track| track.get("uri").and_then(Value::as_str) == Some(track_uri))
    else {
        return MetricLookup::Missing(MissingMetric::TrackNotListed);
    };

    match track.get("playcount") {
        None | Some(Value::Null) => MetricLookup::Missing(MissingMetric::FieldAbsent),
        Some(raw) => parse_counter(raw)
            .map(MetricLookup::Found)
            .unwrap_or(MetricLookup::Missing(MissingMetric::NotANumber)),
    }
}

#[derive(Debug, Clone)]
pub struct PathfinderClient {
    http: HttpExecutor,
    endpoints: Endpoints,
}

impl PathfinderClient {
    pub fn new(http: HttpExecutor, endpoints: Endpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl PlaycountSource for PathfinderClient {
    async fn playcount(
        &self,
        id: &PlatformIdentifier,
        web: &WebTokens,
    ) -> Result<MetricLookup, PlatformError> {
        let body = query_body(&id.album_uri());
        let response: Value = self
            .http
            .send_json("pathfinder getAlbum", |client| {
                let mut request = client
                    .post(&self.endpoints.pathfinder_url)
                    .bearer_auth(web.bearer.secret())
                    .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
                    .json(&body);
                if let Some(client_token) = &web.client_token {
                    request = request.header("client-token", client_token);
                }
                request
            })
            .await?;

        let track_uri = id.track_uri();
        let lookup = extract_playcount(&response, &track_uri);
        match lookup {
            MetricLookup::Found(value) => debug!(track_uri, value, "playcount found"),
            MetricLookup::Missing(reason) => {
                warn!(track_uri, album = %id.album_id, reason = reason.as_str(), "no playcount in album response")
            }
        }
        Ok(lookup)
    }
}
