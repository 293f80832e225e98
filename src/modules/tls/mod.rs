//! Browser impersonation profiles.
//!
//! Each profile bundles what a real browser shows on the wire before the
//! first byte of content: the TLS ClientHello and HTTP/2 settings (an
//! `rquest` emulation preset), the user agent, client hints and fetch
//! metadata. The impersonation engine builds one client per profile and
//! cycles through them.

use std::sync::atomic::{AtomicUsize, Ordering};

use http::{HeaderMap, HeaderName, HeaderValue};
use rquest_util::{Emulation, EmulationOS, EmulationOption};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserType {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

#[derive(Debug, Clone)]
pub struct BrowserProfile {
    pub name: String,
    pub browser: BrowserType,
    /// Handshake preset: cipher and extension order, curves, ALPN, h2 frames.
    pub emulation: Emulation,
    pub os: EmulationOS,
    pub user_agent: String,
    /// Header pairs in the order the browser sends them.
    pub headers: Vec<(String, String)>,
}

impl BrowserProfile {
    /// Emulation for the client builder. Headers come from the profile, not
    /// the preset, so the two never disagree.
    pub fn emulation_option(&self) -> EmulationOption {
        EmulationOption::builder()
            .emulation(self.emulation)
            .emulation_os(self.os)
            .skip_headers(true)
            .build()
    }

    /// Header map for the profile, user agent included. Invalid pairs in a
    /// custom profile are skipped with a warning.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            map.insert(http::header::USER_AGENT, value);
        }
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => log::warn!("profile {} has invalid header {}", self.name, name),
            }
        }
        map
    }
}

/// Round-robin rotation over a fixed profile list.
#[derive(Debug)]
pub struct ProfileRotation {
    profiles: Vec<BrowserProfile>,
    cursor: AtomicUsize,
}

impl ProfileRotation {
    /// Falls back to the built-in list when `profiles` is empty.
    pub fn new(profiles: Vec<BrowserProfile>) -> Self {
        let profiles = if profiles.is_empty() {
            build_default_profiles()
        } else {
            profiles
        };
        Self {
            profiles,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> &BrowserProfile {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.profiles.len();
        &self.profiles[idx]
    }

    pub fn by_name(&self, name: &str) -> Option<&BrowserProfile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|profile| profile.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for ProfileRotation {
    fn default() -> Self {
        Self::new(build_default_profiles())
    }
}

fn chromium_headers(brand: &str, version: &str, platform: &str) -> Vec<(String, String)> {
    vec![
        (
            "sec-ch-ua".into(),
            format!(r#""Not_A Brand";v="8", "Chromium";v="{version}", "{brand}";v="{version}""#),
        ),
        ("sec-ch-ua-mobile".into(), "?0".into()),
        ("sec-ch-ua-platform".into(), format!(r#""{platform}""#)),
        ("upgrade-insecure-requests".into(), "1".into()),
        (
            "accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8".into(),
        ),
        ("sec-fetch-site".into(), "none".into()),
        ("sec-fetch-mode".into(), "navigate".into()),
        ("sec-fetch-user".into(), "?1".into()),
        ("sec-fetch-dest".into(), "document".into()),
        ("accept-language".into(), "en-US,en;q=0.9".into()),
    ]
}

fn fetch_metadata(accept: &str, language: &str) -> Vec<(String, String)> {
    vec![
        ("accept".into(), accept.into()),
        ("accept-language".into(), language.into()),
        ("upgrade-insecure-requests".into(), "1".into()),
        ("sec-fetch-dest".into(), "document".into()),
        ("sec-fetch-mode".into(), "navigate".into()),
        ("sec-fetch-site".into(), "none".into()),
        ("sec-fetch-user".into(), "?1".into()),
    ]
}

/// Edge 120 and Firefox 120 handshakes match the nearest presets rquest
/// ships (Edge 122, Firefox 117).
pub fn build_default_profiles() -> Vec<BrowserProfile> {
    vec![
        BrowserProfile {
            name: "chrome120".into(),
            browser: BrowserType::Chrome,
            emulation: Emulation::Chrome120,
            os: EmulationOS::Windows,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            headers: chromium_headers("Google Chrome", "120", "Windows"),
        },
        BrowserProfile {
            name: "chrome119".into(),
            browser: BrowserType::Chrome,
            emulation: Emulation::Chrome119,
            os: EmulationOS::MacOS,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36".into(),
            headers: chromium_headers("Google Chrome", "119", "macOS"),
        },
        BrowserProfile {
            name: "safari17_0".into(),
            browser: BrowserType::Safari,
            emulation: Emulation::Safari17_0,
            os: EmulationOS::MacOS,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15".into(),
            headers: fetch_metadata(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                "en-US,en;q=0.9",
            ),
        },
        BrowserProfile {
            name: "edge120".into(),
            browser: BrowserType::Edge,
            emulation: Emulation::Edge122,
            os: EmulationOS::Windows,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0".into(),
            headers: chromium_headers("Microsoft Edge", "120", "Windows"),
        },
        BrowserProfile {
            name: "firefox120".into(),
            browser: BrowserType::Firefox,
            emulation: Emulation::Firefox117,
            os: EmulationOS::Windows,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0".into(),
            headers: fetch_metadata(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
                "en-US,en;q=0.5",
            ),
        },
    ]
}
