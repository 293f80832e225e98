//! Vendor unlocker proxy engine, the last rung of the ladder.
//!
//! Routing options ride in the proxy username:
//! `user[-country-XX][-session-ID]`. The vendor re-signs TLS on its side, so
//! certificate validation is relaxed by default.

use async_trait::async_trait;
use rand::Rng;

use super::headers::{DEFAULT_USER_AGENTS, browser_headers, merge};
use super::{ClientPool, EngineError, EngineTier, FetchEngine, FetchRequest, read_body};

pub const DEFAULT_UNLOCKER_HOST: &str = "brd.superproxy.io";
pub const DEFAULT_UNLOCKER_PORT: u16 = 22225;
pub const DEFAULT_UNLOCKER_COUNTRY: &str = "us";

#[derive(Debug, Clone, PartialEq)]
pub struct UnlockerCredentials {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
}

impl UnlockerCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: DEFAULT_UNLOCKER_HOST.to_string(),
            port: DEFAULT_UNLOCKER_PORT,
            scheme: "http".to_string(),
        }
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Proxy URL with the optional country and sticky-session suffixes.
    pub fn proxy_url(&self, country: Option<&str>, session: Option<&str>) -> String {
        let mut username = self.username.clone();
        if let Some(country) = country.filter(|c| !c.is_empty()) {
            username.push_str("-country-");
            username.push_str(&country.to_ascii_lowercase());
        }
        if let Some(session) = session.filter(|s| !s.is_empty()) {
            username.push_str("-session-");
            username.push_str(session);
        }
        format!(
            "{}://{}:{}@{}:{}",
            self.scheme, username, self.password, self.host, self.port
        )
    }
}

/// Random numeric id for a sticky session.
pub fn new_session_id() -> String {
    rand::thread_rng().gen_range(10_000_000u32..100_000_000).to_string()
}

#[derive(Debug)]
pub struct UnlockerEngine {
    credentials: Option<UnlockerCredentials>,
    country: Option<String>,
    session: Option<String>,
    accept_invalid_certs: bool,
    pool: ClientPool,
}

impl UnlockerEngine {
    pub fn new(credentials: Option<UnlockerCredentials>) -> Self {
        Self {
            credentials,
            country: Some(DEFAULT_UNLOCKER_COUNTRY.to_string()),
            session: None,
            accept_invalid_certs: true,
            pool: ClientPool::new(),
        }
    }

    /// `None` lets the vendor pick the exit country.
    pub fn with_country(mut self, country: Option<String>) -> Self {
        self.country = country;
        self
    }

    /// Pin every request to one egress IP.
    pub fn with_sticky_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_strict_tls(mut self) -> Self {
        self.accept_invalid_certs = false;
        self
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .map(|creds| creds.proxy_url(self.country.as_deref(), self.session.as_deref()))
    }
}

#[async_trait]
impl FetchEngine for UnlockerEngine {
    fn tier(&self) -> EngineTier {
        EngineTier::Unlocker
    }

    fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<String, EngineError> {
        let proxy = self.proxy_url().ok_or_else(|| EngineError::NotConfigured {
            tier: EngineTier::Unlocker,
            reason: "unlocker credentials are not set".into(),
        })?;

        let accept_invalid_certs = self.accept_invalid_certs;
        let client = self
            .pool
            .client("unlocker", Some(&proxy), |builder| {
                builder.danger_accept_invalid_certs(accept_invalid_certs)
            })
            .await?;

        log::debug!("unlocker GET {}", request.url);
        let headers = merge(browser_headers(DEFAULT_USER_AGENTS[0]), &request.headers);
        read_body(client.get(request.url.clone()).headers(headers), request.timeout).await
    }
}
