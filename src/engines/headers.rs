//! Browser-like request headers shared by the HTTP engines.

use http::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use rand::seq::SliceRandom;

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

pub fn random_user_agent(pool: &[String]) -> &str {
    pool.choose(&mut rand::thread_rng())
        .map(String::as_str)
        .unwrap_or(DEFAULT_USER_AGENTS[0])
}

/// Navigation headers a desktop browser sends for a top-level document.
pub fn browser_headers(user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(HeaderName::from_static("dnt"), HeaderValue::from_static("1"));
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    headers
}

/// Overlay `extra` on `base`; caller-supplied headers win.
pub fn merge(mut base: HeaderMap, extra: &HeaderMap) -> HeaderMap {
    for (name, value) in extra {
        base.insert(name.clone(), value.clone());
    }
    base
}
