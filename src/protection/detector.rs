//! Anti-bot protection detection.
//!
//! One probe request, then a fixed precedence: header markers first, body
//! markers second, generic block phrases third. The probe fails open: any
//! transport problem classifies the target as [`ProtectionType::Unknown`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;

use crate::engines::EngineTier;
use crate::engines::headers::{DEFAULT_USER_AGENTS, browser_headers};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    None,
    Cloudflare,
    Akamai,
    PerimeterX,
    DataDome,
    ReCaptcha,
    HCaptcha,
    Unknown,
}

impl ProtectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionType::None => "none",
            ProtectionType::Cloudflare => "cloudflare",
            ProtectionType::Akamai => "akamai",
            ProtectionType::PerimeterX => "perimeterx",
            ProtectionType::DataDome => "datadome",
            ProtectionType::ReCaptcha => "recaptcha",
            ProtectionType::HCaptcha => "hcaptcha",
            ProtectionType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProtectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header names, values and cookies, lower-cased.
const HEADER_MARKERS: &[(ProtectionType, &[&str])] = &[
    (
        ProtectionType::Cloudflare,
        &["cf-ray", "cf-cache-status", "cf-mitigated", "__cf_bm", "cf_clearance"],
    ),
    (ProtectionType::Akamai, &["x-akamai", "akamai", "ak_bmsc", "bm_sz"]),
    (ProtectionType::PerimeterX, &["x-px", "_pxhd", "_pxvid", "_px3"]),
    (ProtectionType::DataDome, &["datadome"]),
];

const BODY_MARKERS: &[(ProtectionType, &[&str])] = &[
    (
        ProtectionType::Cloudflare,
        &["challenges.cloudflare.com", "cf-browser-verification"],
    ),
    (ProtectionType::ReCaptcha, &["recaptcha", "g-recaptcha"]),
    (ProtectionType::HCaptcha, &["hcaptcha", "h-captcha"]),
    (ProtectionType::PerimeterX, &["perimeterx"]),
];

const GENERIC_BLOCK_PHRASES: &[&str] = &["access denied", "bot detected", "please verify"];

/// Classify a response. Headers strictly outrank the body.
pub fn classify(headers: &HeaderMap, body: &str) -> ProtectionType {
    let header_text: Vec<String> = headers
        .iter()
        .map(|(name, value)| {
            format!(
                "{}: {}",
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).to_lowercase()
            )
        })
        .collect();

    for (protection, markers) in HEADER_MARKERS {
        if header_text
            .iter()
            .any(|line| markers.iter().any(|marker| line.contains(marker)))
        {
            return *protection;
        }
    }

    let body = body.to_lowercase();
    for (protection, markers) in BODY_MARKERS {
        if markers.iter().any(|marker| body.contains(marker)) {
            return *protection;
        }
    }

    if GENERIC_BLOCK_PHRASES.iter().any(|phrase| body.contains(phrase)) {
        return ProtectionType::Unknown;
    }
    ProtectionType::None
}

/// Cheapest tier expected to get through `protection`.
pub fn recommended_tier(protection: ProtectionType) -> EngineTier {
    match protection {
        ProtectionType::None => EngineTier::Direct,
        ProtectionType::Cloudflare | ProtectionType::Akamai | ProtectionType::Unknown => {
            EngineTier::Impersonate
        }
        ProtectionType::PerimeterX | ProtectionType::ReCaptcha | ProtectionType::HCaptcha => {
            EngineTier::Browser
        }
        ProtectionType::DataDome => EngineTier::Unlocker,
    }
}

/// Anything able to classify a target URL.
#[async_trait]
pub trait ProtectionProbe: Send + Sync {
    async fn detect(&self, url: &str) -> ProtectionType;
}

/// Probe backed by its own reqwest client.
#[derive(Debug, Clone)]
pub struct ProtectionDetector {
    client: reqwest::Client,
}

impl ProtectionDetector {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(browser_headers(DEFAULT_USER_AGENTS[0]))
            .build()?;
        Ok(Self { client })
    }

    async fn probe(&self, url: &str) -> Result<ProtectionType, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(classify(&headers, &body))
    }
}

#[async_trait]
impl ProtectionProbe for ProtectionDetector {
    async fn detect(&self, url: &str) -> ProtectionType {
        match self.probe(url).await {
            Ok(protection) => {
                log::debug!("{url} classified as {protection}");
                protection
            }
            Err(err) => {
                log::warn!("protection probe for {url} failed: {err}");
                ProtectionType::Unknown
            }
        }
    }
}
