//! Challenge-page signatures.
//!
//! A fetched body is treated as blocked when it contains any of these
//! phrases, regardless of the HTTP status it arrived with.

pub const BLOCK_SIGNATURES: &[&str] = &[
    "cf-browser-verification",
    "challenge-platform",
    "captcha",
    "access denied",
    "please wait while we verify",
    "checking your browser",
    "just a moment",
    "ddos protection",
    "bot detection",
    "cf-spinner",
    "cf_captcha_container",
];

/// First signature found in `content`, matched case-insensitively.
pub fn block_signature(content: &str) -> Option<&'static str> {
    let lowered = content.to_lowercase();
    BLOCK_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lowered.contains(signature))
}

pub fn is_blocked(content: &str) -> bool {
    block_signature(content).is_some()
}
