//! # adaptive-fetch
//!
//! Adaptive page retrieval for sites that fight back.
//!
//! A single probe classifies the target's anti-bot protection, then an
//! escalation ladder of fetch engines is climbed from the cheapest one likely
//! to work until a page comes back that is not a challenge.
//!
//! ## Features
//!
//! - Protection detection (Cloudflare, Akamai, PerimeterX, DataDome, captchas)
//! - Four engines: plain HTTP, browser-profile impersonation, headless Chromium
//!   and an unlocker proxy
//! - Token-bucket rate limiting with exponential backoff between tiers
//! - Health-scored proxy pool with bans
//! - 2Captcha-compatible solving, with tokens injected into the browser tier
//! - Cancellation, deadlines, batch fetching and a job worker pool
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_fetch::EngineSelector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let selector = EngineSelector::from_env()?;
//!     let html = selector.fetch("https://example.com").await?;
//!     println!("{} bytes", html.len());
//!     Ok(())
//! }
//! ```

mod selector;

pub mod config;
pub mod dispatch;
pub mod engines;
pub mod external_deps;
pub mod modules;
pub mod protection;

pub use crate::selector::{
    CancelReason,
    EngineSelector,
    EngineSelectorBuilder,
    EngineSelectorConfig,
    FetchAttempt,
    FetchError,
    FetchOptions,
    FetchResponse,
    FetchResult,
    UNLOCKER_ATTEMPT_TIMEOUT,
};

pub use crate::config::{ConfigError, Settings};

pub use crate::dispatch::{
    ChannelSupplier,
    ContentCache,
    Job,
    JobResult,
    JobSupplier,
    MemoryCache,
    Retriever,
    WorkerPool,
    WorkerSummary,
    fetch_many,
    normalize_url,
};

pub use crate::engines::{
    AttemptOutcome,
    BrowserEngine,
    BrowserEngineConfig,
    DirectEngine,
    EngineError,
    EngineRegistry,
    EngineTier,
    FetchEngine,
    FetchRequest,
    ImpersonateEngine,
    UnlockerCredentials,
    UnlockerEngine,
};

pub use crate::external_deps::captcha::{
    CaptchaConfig,
    CaptchaError,
    CaptchaKind,
    CaptchaProvider,
    CaptchaResult,
    CaptchaSolution,
    CaptchaTask,
    TaskStatus,
    TwoCaptchaProvider,
};

pub use crate::modules::{
    BanPolicy,
    EventDispatcher,
    EventHandler,
    FailureMark,
    FetchStatus,
    GlobalStats,
    LoggingHandler,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    Proxy,
    ProxyHealthReport,
    ProxyLease,
    ProxyPool,
    ProxyPoolConfig,
    ProxyPoolStats,
    ProxyProtocol,
    RateLimitConfig,
    RateLimiter,
    RetrievalEvent,
    TierStats,
};

pub use crate::protection::{
    ProtectionDetector,
    ProtectionProbe,
    ProtectionType,
    find_captcha,
    is_blocked,
    recommended_tier,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
