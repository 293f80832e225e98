//! Integrations that rely on third-party services.
//!
//! Currently this is the captcha-solving adapter the selector falls back to
//! when a blocked page carries a solvable widget.

pub mod captcha;

pub use captcha::TwoCaptchaProvider;
