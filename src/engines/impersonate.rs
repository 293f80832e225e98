//! Browser impersonation engine.
//!
//! Cycles through [`BrowserProfile`]s round-robin. Each profile gets its own
//! `rquest` client built from the profile's emulation preset, so the TLS
//! ClientHello, HTTP/2 settings and header set all belong to the same
//! browser for the lifetime of the connection.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::sync::Mutex;

use super::headers::merge;
use super::{EngineError, EngineTier, FetchEngine, FetchRequest};
use crate::modules::tls::{BrowserProfile, ProfileRotation};

#[derive(Debug, Default)]
pub struct ImpersonateEngine {
    profiles: ProfileRotation,
    clients: Mutex<HashMap<(String, Option<String>), rquest::Client>>,
}

impl ImpersonateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: Vec<BrowserProfile>) -> Self {
        Self {
            profiles: ProfileRotation::new(profiles),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn profiles(&self) -> &ProfileRotation {
        &self.profiles
    }

    /// Fetch with one named profile instead of the rotation.
    pub async fn fetch_as(&self, profile: &str, request: &FetchRequest) -> Result<String, EngineError> {
        let profile = self
            .profiles
            .by_name(profile)
            .ok_or_else(|| EngineError::NotConfigured {
                tier: EngineTier::Impersonate,
                reason: format!("unknown profile {profile}"),
            })?;
        self.fetch_with_profile(profile, request).await
    }

    /// Reuse the client for `(profile, proxy)` or build it from the preset.
    async fn client(&self, profile: &BrowserProfile, proxy: Option<&str>) -> Result<rquest::Client, EngineError> {
        let mut guard = self.clients.lock().await;
        let key = (profile.name.clone(), proxy.map(str::to_string));
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = rquest::Client::builder()
            .emulation(profile.emulation_option())
            .cookie_store(true);
        if let Some(endpoint) = proxy {
            builder = builder.proxy(endpoint.to_string());
        }
        let client = builder.build().map_err(EngineError::Impersonation)?;
        log::debug!("built {} client (proxy: {})", profile.name, proxy.is_some());
        guard.insert(key, client.clone());
        Ok(client)
    }

    async fn fetch_with_profile(
        &self,
        profile: &BrowserProfile,
        request: &FetchRequest,
    ) -> Result<String, EngineError> {
        let client = self.client(profile, request.proxy.as_deref()).await?;

        log::debug!("impersonating {} for {}", profile.name, request.url);
        let headers = merge(profile.header_map(), &request.headers);
        let mut builder = client.get(request.url.as_str()).timeout(request.timeout);
        for (name, value) in wire_headers(&headers) {
            builder = builder.header(name, value);
        }
        read_emulated(builder, request.timeout).await
    }
}

/// Same pairs, as the types `rquest` takes.
fn wire_headers(headers: &HeaderMap) -> Vec<(rquest::header::HeaderName, rquest::header::HeaderValue)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = rquest::header::HeaderName::from_bytes(name.as_str().as_bytes()).ok()?;
            let value = rquest::header::HeaderValue::from_bytes(value.as_bytes()).ok()?;
            Some((name, value))
        })
        .collect()
}

fn emulated_error(err: rquest::Error, timeout: Duration) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(timeout)
    } else {
        EngineError::Impersonation(err)
    }
}

async fn read_emulated(request: rquest::RequestBuilder, timeout: Duration) -> Result<String, EngineError> {
    let response = request.send().await.map_err(|err| emulated_error(err, timeout))?;
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.map_err(|err| emulated_error(err, timeout))?;

    if !status.is_success() {
        return Err(EngineError::Status {
            status: status.as_u16(),
            url,
            body,
        });
    }
    Ok(body)
}

#[async_trait]
impl FetchEngine for ImpersonateEngine {
    fn tier(&self) -> EngineTier {
        EngineTier::Impersonate
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<String, EngineError> {
        let profile = self.profiles.next();
        self.fetch_with_profile(profile, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn named_profile_sends_its_fingerprint_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("sec-fetch-mode", "navigate"))
            .and(header(
                "user-agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let engine = ImpersonateEngine::new();
        let request = FetchRequest::new(Url::parse(&server.uri()).unwrap());
        assert_eq!(engine.fetch_as("firefox120", &request).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn unknown_profile_is_a_configuration_error() {
        let engine = ImpersonateEngine::new();
        let request = FetchRequest::new(Url::parse("http://127.0.0.1:9/").unwrap());
        let err = engine.fetch_as("netscape4", &request).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn rotation_advances_per_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let engine = ImpersonateEngine::new();
        let request = FetchRequest::new(Url::parse(&server.uri()).unwrap());
        for _ in 0..2 {
            engine.fetch(&request).await.unwrap();
        }

        let agents: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|req| req.headers["user-agent"].to_str().unwrap().to_string())
            .collect();
        assert_eq!(agents.len(), 2);
        assert!(agents[0].contains("Chrome/120"));
        assert!(agents[1].contains("Chrome/119"));
    }

    #[tokio::test]
    async fn clients_are_cached_per_profile_and_proxy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let engine = ImpersonateEngine::new();
        let request = FetchRequest::new(Url::parse(&server.uri()).unwrap());
        engine.fetch_as("safari17_0", &request).await.unwrap();
        engine.fetch_as("safari17_0", &request).await.unwrap();
        engine.fetch_as("firefox120", &request).await.unwrap();
        assert_eq!(engine.clients.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn challenge_status_keeps_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Access Denied"))
            .mount(&server)
            .await;

        let engine = ImpersonateEngine::new();
        let request = FetchRequest::new(Url::parse(&server.uri()).unwrap());
        match engine.fetch(&request).await {
            Err(EngineError::Status { status, body, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "Access Denied");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
