//! Anti-bot protection awareness.
//!
//! - [`detector`] classifies a target from a single probe.
//! - [`signatures`] decides whether fetched content is a challenge page.
//! - [`widgets`] finds a solvable captcha on a blocked page.

pub mod detector;
pub mod signatures;
pub mod widgets;

pub use detector::{
    DEFAULT_PROBE_TIMEOUT, ProtectionDetector, ProtectionProbe, ProtectionType, classify,
    recommended_tier,
};
pub use signatures::{BLOCK_SIGNATURES, block_signature, is_blocked};
pub use widgets::find_captcha;
