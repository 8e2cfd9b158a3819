//! Web-player token capture. A headless Chromium loads the player and we read the
//! credentials off the first successful album query it issues.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{BearerToken, WebTokens};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived,
};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::BROWSER_USER_AGENT;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error(transparent)]
    Session(#[from] chromiumoxide::error::CdpError),
    #[error("browser process error: {0}")]
    Process(#[from] std::io::Error),
    #[error("no successful request to {target} within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("browser event stream ended before a matching request")]
    StreamEnded,
}

#[async_trait]
pub trait WebTokenSource: Send + Sync {
    async fn capture(&self) -> Result<WebTokens, CaptureError>;
}

#[derive(Debug, Clone)]
pub struct SniffConfig {
    pub start_url: String,
    pub target_path: String,
    pub timeout: Duration,
    pub user_agent: String,
    /// Full proxy URL; only scheme, host and port are handed to the browser.
    pub proxy_url: Option<String>,
    pub executable: Option<PathBuf>,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            start_url: "https://open.spotify.com/".into(),
            target_path: "/pathfinder/v2/query".into(),
            timeout: Duration::from_secs(30),
            user_agent: BROWSER_USER_AGENT.into(),
            proxy_url: None,
            executable: None,
        }
    }
}

/// One live browser that can be watched for a request and then shut down.
#[async_trait]
pub trait BrowserSession: Send {
    async fn first_matching_request(&mut self, target: &str) -> Result<WebTokens, CaptureError>;

    async fn close(&mut self);
}

/// Waits up to `timeout` for a capture and closes the session whatever the outcome.
pub async fn observe_then_close<S>(
    session: &mut S,
    timeout: Duration,
    target: &str,
) -> Result<WebTokens, CaptureError>
where
    S: BrowserSession + ?Sized,
{
    let outcome = tokio::time::timeout(timeout, session.first_matching_request(target)).await;
    session.close().await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(CaptureError::Timeout {
            target: target.to_string(),
            timeout,
        }),
    }
}

/// Pulls the bearer and optional client token out of a CDP header object.
pub fn tokens_from_headers(headers: &Value) -> Option<WebTokens> {
    let map = headers.as_object()?;
    let mut bearer = None;
    let mut client_token = None;
    for (name, value) in map {
        let Some(value) = value.as_str() else { continue };
        if name.eq_ignore_ascii_case("authorization") {
            if let Some(token) = value
                .get(..7)
                .filter(|prefix| prefix.eq_ignore_ascii_case("bearer "))
                .map(|_| value[7..].trim())
            {
                if !token.is_empty() {
                    bearer = Some(BearerToken::new(token));
                }
            }
        } else if name.eq_ignore_ascii_case("client-token") && !value.is_empty() {
            client_token = Some(value.to_string());
        }
    }
    Some(WebTokens {
        bearer: bearer?,
        client_token,
    })
}

/// Pairs request headers with their response by request id. CDP does not promise
/// which of the two events arrives first.
#[derive(Debug, Default)]
pub struct CaptureState {
    target: String,
    awaiting_response: HashMap<String, WebTokens>,
    succeeded: HashSet<String>,
}

impl CaptureState {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn on_request(&mut self, request_id: &str, url: &str, headers: &Value) -> Option<WebTokens> {
        if !url.contains(&self.target) {
            return None;
        }
        let tokens = tokens_from_headers(headers)?;
        if self.succeeded.remove(request_id) {
            return Some(tokens);
        }
        self.awaiting_response.insert(request_id.to_string(), tokens);
        None
    }

    pub fn on_response(&mut self, request_id: &str, url: &str, status: i64) -> Option<WebTokens> {
        if status != 200 || !url.contains(&self.target) {
            self.awaiting_response.remove(request_id);
            return None;
        }
        match self.awaiting_response.remove(request_id) {
            Some(tokens) => Some(tokens),
            None => {
                self.succeeded.insert(request_id.to_string());
                None
            }
        }
    }
}

/// `--proxy-server` value for a proxy URL. Credentials are dropped since Chromium
/// does not take them on the command line.
pub fn proxy_server_arg(proxy_url: &str) -> Option<String> {
    let url = reqwest::Url::parse(proxy_url).ok()?;
    let host = url.host_str()?;
    Some(match url.port_or_known_default() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

struct ChromiumSession {
    browser: Browser,
    driver: JoinHandle<()>,
    start_url: String,
}

impl ChromiumSession {
    async fn launch(config: &SniffConfig) -> Result<Self, CaptureError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg(format!("--user-agent={}", config.user_agent));
        if let Some(server) = config.proxy_url.as_deref().and_then(proxy_server_arg) {
            builder = builder.arg(format!("--proxy-server={server}"));
        }
        if let Some(executable) = &config.executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder.build().map_err(CaptureError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            driver,
            start_url: config.start_url.clone(),
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn first_matching_request(&mut self, target: &str) -> Result<WebTokens, CaptureError> {
        let page = self.browser.new_page("about:blank").await?;
        page.execute(EnableParams::default()).await?;
        let mut requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let mut responses = page.event_listener::<EventResponseReceived>().await?;

        debug!(url = %self.start_url, "navigating web player");
        page.goto(self.start_url.as_str()).await?;

        let mut state = CaptureState::new(target);
        loop {
            let captured = tokio::select! {
                Some(event) = requests.next() => state.on_request(
                    event.request_id.inner(),
                    &event.request.url,
                    event.request.headers.inner(),
                ),
                Some(event) = responses.next() => state.on_response(
                    event.request_id.inner(),
                    &event.response.url,
                    event.response.status,
                ),
                else => return Err(CaptureError::StreamEnded),
            };
            if let Some(tokens) = captured {
                return Ok(tokens);
            }
        }
    }

    async fn close(&mut self) {
        let shutdown = async {
            self.browser.close().await?;
            self.browser.wait().await?;
            Ok::<_, CaptureError>(())
        };
        match tokio::time::timeout(CLOSE_GRACE, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "browser did not shut down cleanly"),
            Err(_) => warn!("browser shutdown timed out"),
        }
        self.driver.abort();
    }
}

/// Launches a fresh Chromium per capture.
#[derive(Debug, Clone, Default)]
pub struct ChromiumTokenSniffer {
    config: SniffConfig,
}

impl ChromiumTokenSniffer {
    pub fn new(config: SniffConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WebTokenSource for ChromiumTokenSniffer {
    async fn capture(&self) -> Result<WebTokens, CaptureError> {
        info!(target_path = %self.config.target_path, "capturing web-player tokens");
        let mut session = ChromiumSession::launch(&self.config).await?;
        let tokens =
            observe_then_close(&mut session, self.config.timeout, &self.config.target_path).await?;
        info!(client_token = tokens.client_token.is_some(), "web-player tokens captured");
        Ok(tokens)
    }
}
