//! Fetch engines.
//!
//! Four interchangeable strategies share one contract: take a
//! [`FetchRequest`], return the page body. They are ordered from cheapest to
//! most robust by [`EngineTier`]; the selector walks that ladder.

pub mod browser;
pub mod direct;
pub mod headers;
pub mod impersonate;
pub mod unlocker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::external_deps::captcha::CaptchaSolution;

pub use browser::{BrowserEngine, BrowserEngineConfig};
pub use direct::DirectEngine;
pub use impersonate::ImpersonateEngine;
pub use unlocker::{UnlockerCredentials, UnlockerEngine};

/// Escalation ladder, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTier {
    Direct,
    Impersonate,
    Browser,
    Unlocker,
}

impl EngineTier {
    pub const LADDER: [EngineTier; 4] = [
        EngineTier::Direct,
        EngineTier::Impersonate,
        EngineTier::Browser,
        EngineTier::Unlocker,
    ];

    pub fn next(self) -> Option<EngineTier> {
        match self {
            EngineTier::Direct => Some(EngineTier::Impersonate),
            EngineTier::Impersonate => Some(EngineTier::Browser),
            EngineTier::Browser => Some(EngineTier::Unlocker),
            EngineTier::Unlocker => None,
        }
    }

    /// This tier and every tier above it, in ladder order.
    pub fn ladder_from(self) -> impl Iterator<Item = EngineTier> {
        Self::LADDER.into_iter().filter(move |tier| *tier >= self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineTier::Direct => "direct",
            EngineTier::Impersonate => "impersonate",
            EngineTier::Browser => "browser",
            EngineTier::Unlocker => "unlocker",
        }
    }
}

impl fmt::Display for EngineTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "http" => Ok(EngineTier::Direct),
            "impersonate" | "tls" => Ok(EngineTier::Impersonate),
            "browser" | "headless" => Ok(EngineTier::Browser),
            "unlocker" => Ok(EngineTier::Unlocker),
            other => Err(EngineError::UnknownTier(other.to_string())),
        }
    }
}

/// What a single engine attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Blocked { signature: String },
    TransportError { reason: String },
    ConfigurationError { reason: String },
}

impl AttemptOutcome {
    /// Blocked and transport failures move the ladder and count against the
    /// tier; configuration errors only skip it.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Blocked { .. } | AttemptOutcome::TransportError { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Blocked { .. } => "blocked",
            AttemptOutcome::TransportError { .. } => "transport_error",
            AttemptOutcome::ConfigurationError { .. } => "skipped",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => f.write_str("success"),
            AttemptOutcome::Blocked { signature } => write!(f, "blocked ({signature})"),
            AttemptOutcome::TransportError { reason } => write!(f, "transport error ({reason})"),
            AttemptOutcome::ConfigurationError { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

/// Everything an engine needs for one fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub captcha: Option<CaptchaSolution>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(30),
            proxy: None,
            captcha: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, EngineError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| EngineError::InvalidHeader(name.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| EngineError::InvalidHeader(name.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_captcha(mut self, solution: CaptchaSolution) -> Self {
        self.captcha = Some(solution);
        self
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{tier} engine is not configured: {reason}")]
    NotConfigured { tier: EngineTier, reason: String },
    /// Non-2xx answer. The body is kept so challenge pages served with 403 or
    /// 503 can still be recognised as blocks.
    #[error("http {status} from {url}")]
    Status { status: u16, url: String, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("impersonated transport error: {0}")]
    Impersonation(#[source] rquest::Error),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("unknown engine tier `{0}`")]
    UnknownTier(String),
}

impl EngineError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::NotConfigured { .. })
    }
}

/// Shared interface implemented by every fetch strategy.
#[async_trait]
pub trait FetchEngine: Send + Sync {
    fn tier(&self) -> EngineTier;

    /// Whether the engine has what it needs (credentials, binaries) to run.
    fn is_configured(&self) -> bool {
        true
    }

    /// Whether a solved captcha token in the request will be used.
    fn accepts_captcha_tokens(&self) -> bool {
        false
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<String, EngineError>;
}

/// Engines keyed by tier, fixed at configuration time.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<EngineTier, Arc<dyn FetchEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine under its own tier, replacing any previous one.
    pub fn register(&mut self, engine: Arc<dyn FetchEngine>) {
        self.engines.insert(engine.tier(), engine);
    }

    pub fn get(&self, tier: EngineTier) -> Option<&Arc<dyn FetchEngine>> {
        self.engines.get(&tier)
    }

    pub fn tiers(&self) -> Vec<EngineTier> {
        self.engines.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("tiers", &self.tiers())
            .finish()
    }
}

/// Reqwest client pool keyed by client flavour and proxy endpoint.
#[derive(Debug, Default)]
pub(crate) struct ClientPool {
    clients: Mutex<HashMap<(String, Option<String>), reqwest::Client>>,
}

impl ClientPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reuse the client for `(flavour, proxy)` or build it with `configure`.
    pub(crate) async fn client<F>(
        &self,
        flavour: &str,
        proxy: Option<&str>,
        configure: F,
    ) -> Result<reqwest::Client, EngineError>
    where
        F: FnOnce(reqwest::ClientBuilder) -> reqwest::ClientBuilder,
    {
        let mut guard = self.clients.lock().await;
        let key = (flavour.to_string(), proxy.map(str::to_string));
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = configure(reqwest::Client::builder().cookie_store(true));
        if let Some(endpoint) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(endpoint)?);
        }

        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// Send a prepared request and return the body of a 2xx answer.
pub(crate) async fn read_body(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<String, EngineError> {
    let response = request.timeout(timeout).send().await.map_err(|err| {
        if err.is_timeout() {
            EngineError::Timeout(timeout)
        } else {
            EngineError::Transport(err)
        }
    })?;

    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.map_err(|err| {
        if err.is_timeout() {
            EngineError::Timeout(timeout)
        } else {
            EngineError::Transport(err)
        }
    })?;

    if !status.is_success() {
        return Err(EngineError::Status {
            status: status.as_u16(),
            url,
            body,
        });
    }
    Ok(body)
}
