use std::sync::Arc;

use catsync_core::{BearerToken, TokenSet};
use catsync_platforms::{CaptureError, CredentialsGrant, PlatformError, WebTokenSource};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, instrument};

/// Either acquisition failing aborts the run.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("server token acquisition failed: {0}")]
    Server(#[source] PlatformError),
    #[error("web-player token capture failed: {0}")]
    Web(#[source] CaptureError),
}

/// Acquires platform tokens in two phases: the server grant, then the browser capture.
#[derive(Clone)]
pub struct TokenLifecycle {
    grant: Arc<dyn CredentialsGrant>,
    web: Arc<dyn WebTokenSource>,
}

impl TokenLifecycle {
    pub fn new(grant: Arc<dyn CredentialsGrant>, web: Arc<dyn WebTokenSource>) -> Self {
        Self { grant, web }
    }

    /// Client-credentials token only, for passes that never touch the private API.
    pub async fn acquire_search_token(&self) -> Result<BearerToken, TokenError> {
        self.grant.client_credentials_token().await.map_err(|err| {
            error!(error = %err, "server token acquisition failed");
            TokenError::Server(err)
        })
    }

    /// Server token first, then the browser capture; the capture is skipped when the
    /// first phase already failed.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<TokenSet, TokenError> {
        let search = self.acquire_search_token().await?;
        self.complete(search).await
    }

    /// Second phase only: captures the web-player tokens around an already granted search token.
    pub async fn complete(&self, search: BearerToken) -> Result<TokenSet, TokenError> {
        let web = self.web.capture().await.map_err(|err| {
            error!(error = %err, "web-player token capture failed");
            TokenError::Web(err)
        })?;
        info!(client_token = web.client_token.is_some(), "token set acquired");
        Ok(TokenSet {
            search,
            web,
            acquired_at: Utc::now(),
        })
    }
}

/// The tokens of a single run. Each phase is acquired at most once, on first use, and every
/// pass of the run borrows the same result, failures included.
pub struct RunTokens<'a> {
    lifecycle: &'a TokenLifecycle,
    search: OnceCell<Result<BearerToken, Arc<TokenError>>>,
    full: OnceCell<Result<TokenSet, Arc<TokenError>>>,
}

impl<'a> RunTokens<'a> {
    pub fn new(lifecycle: &'a TokenLifecycle) -> Self {
        Self {
            lifecycle,
            search: OnceCell::new(),
            full: OnceCell::new(),
        }
    }

    pub async fn search_token(&self) -> Result<&BearerToken, Arc<TokenError>> {
        self.search
            .get_or_init(|| async { self.lifecycle.acquire_search_token().await.map_err(Arc::new) })
            .await
            .as_ref()
            .map_err(Arc::clone)
    }

    pub async fn token_set(&self) -> Result<&TokenSet, Arc<TokenError>> {
        self.full
            .get_or_init(|| async {
                let search = self.search_token().await?.clone();
                self.lifecycle.complete(search).await.map_err(Arc::new)
            })
            .await
            .as_ref()
            .map_err(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGrant, FakeWeb};

    #[tokio::test]
    async fn both_phases_populate_the_set() {
        let lifecycle = TokenLifecycle::new(Arc::new(FakeGrant::ok("srv")), Arc::new(FakeWeb::ok("web")));
        let set = lifecycle.acquire().await.expect("token set");
        assert_eq!(set.search.secret(), "srv");
        assert_eq!(set.web.bearer.secret(), "web");
    }

    #[tokio::test]
    async fn failed_grant_never_launches_browser() {
        let web = Arc::new(FakeWeb::ok("web"));
        let lifecycle = TokenLifecycle::new(Arc::new(FakeGrant::failing()), web.clone());
        assert!(matches!(lifecycle.acquire().await, Err(TokenError::Server(_))));
        assert_eq!(web.captures(), 0);
    }

    #[tokio::test]
    async fn capture_timeout_is_fatal() {
        let lifecycle = TokenLifecycle::new(Arc::new(FakeGrant::ok("srv")), Arc::new(FakeWeb::timing_out()));
        let err = lifecycle.acquire().await.expect_err("capture should time out");
        assert!(matches!(err, TokenError::Web(CaptureError::Timeout { .. })));
    }

    #[tokio::test]
    async fn run_tokens_are_acquired_once_and_shared() {
        let grant = Arc::new(FakeGrant::ok("srv"));
        let web = Arc::new(FakeWeb::ok("web"));
        let lifecycle = TokenLifecycle::new(grant.clone(), web.clone());
        let run = RunTokens::new(&lifecycle);

        let set = run.token_set().await.expect("token set");
        assert_eq!(set.search.secret(), "srv");
        let search = run.search_token().await.expect("search token");
        assert_eq!(search.secret(), "srv");
        run.token_set().await.expect("cached token set");

        assert_eq!(grant.calls(), 1);
        assert_eq!(web.captures(), 1);
    }

    #[tokio::test]
    async fn failed_run_grant_is_reported_to_every_caller() {
        let grant = Arc::new(FakeGrant::failing());
        let web = Arc::new(FakeWeb::ok("web"));
        let lifecycle = TokenLifecycle::new(grant.clone(), web.clone());
        let run = RunTokens::new(&lifecycle);

        let err = run.token_set().await.expect_err("grant is down");
        assert!(matches!(*err, TokenError::Server(_)));
        assert!(run.search_token().await.is_err());
        assert_eq!(grant.calls(), 1);
        assert_eq!(web.captures(), 0);
    }
}
