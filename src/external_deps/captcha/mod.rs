//! Captcha provider integrations.
//!
//! Providers follow a submit-then-poll protocol: a task goes out, an opaque
//! id comes back, and the token is collected once the service reports it
//! ready. The selector only ever talks to [`CaptchaProvider`], so vendor
//! details stay inside the adapter.

mod twocaptcha;

pub use twocaptcha::{TwoCaptchaProvider, DEFAULT_TWOCAPTCHA_URL};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Polling behaviour shared by providers.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub request_timeout: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_polls: 60,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptchaKind {
    ReCaptchaV2 { invisible: bool },
    ReCaptchaV3 { action: String, min_score: f32 },
    HCaptcha,
    Turnstile,
}

impl CaptchaKind {
    pub fn label(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptchaV2 { .. } => "recaptcha_v2",
            CaptchaKind::ReCaptchaV3 { .. } => "recaptcha_v3",
            CaptchaKind::HCaptcha => "hcaptcha",
            CaptchaKind::Turnstile => "turnstile",
        }
    }

    /// Form field the widget reads the token from.
    pub fn response_field(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptchaV2 { .. } | CaptchaKind::ReCaptchaV3 { .. } => "g-recaptcha-response",
            CaptchaKind::HCaptcha => "h-captcha-response",
            CaptchaKind::Turnstile => "cf-turnstile-response",
        }
    }
}

impl fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

/// A captcha challenge found on a page, and its progress through the
/// provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaTask {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: String,
    pub id: Option<String>,
    pub status: TaskStatus,
    pub token: Option<String>,
}

impl CaptchaTask {
    pub fn new(kind: CaptchaKind, site_key: impl Into<String>, page_url: impl Into<String>) -> Self {
        Self {
            kind,
            site_key: site_key.into(),
            page_url: page_url.into(),
            id: None,
            status: TaskStatus::Pending,
            token: None,
        }
    }
}

/// Resolved captcha token.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaSolution {
    pub kind: CaptchaKind,
    pub token: String,
    pub task_id: String,
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha vendors.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand the task to the service. Stores and returns the task id.
    async fn submit(&self, task: &mut CaptchaTask) -> Result<String, CaptchaError>;

    /// Wait for the token of a submitted task.
    async fn poll(&self, task: &mut CaptchaTask) -> CaptchaResult;

    async fn solve(&self, task: &mut CaptchaTask) -> CaptchaResult {
        self.submit(task).await?;
        self.poll(task).await
    }
}

/// Errors surfaced by captcha providers.
#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha provider misconfigured: {0}")]
    Configuration(String),
    #[error("captcha task rejected: {0}")]
    Rejected(String),
    #[error("captcha service reported failure: {0}")]
    Service(String),
    #[error("captcha not ready after {polls} polls")]
    Timeout { polls: u32 },
    #[error("captcha task was never submitted")]
    NotSubmitted,
    #[error("captcha transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected captcha service reply: {0}")]
    InvalidResponse(String),
}
