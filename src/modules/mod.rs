//! Cross-cutting services module
//!
//! Shared resources the selector consults around every attempt: throttling,
//! proxies, browser profiles, events and metrics.

pub mod events;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod tls;

// Re-export commonly used types
pub use events::{
    AttemptEvent, CaptchaEvent, EscalationEvent, EventDispatcher, EventHandler, FetchEvent,
    FetchStatus, LoggingHandler, MetricsHandler, OutcomeEvent, ProxyBanEvent, RetrievalEvent,
};
pub use metrics::{GlobalStats, MetricsCollector, MetricsSnapshot, TierStats};
pub use proxy::{
    BanPolicy, FailureMark, Proxy, ProxyHealthReport, ProxyLease, ProxyPool, ProxyPoolConfig, ProxyPoolStats,
    ProxyProtocol,
};
pub use rate_limit::{RateLimitConfig, RateLimiter, backoff, backoff_delay};
pub use tls::{BrowserProfile, BrowserType, ProfileRotation, build_default_profiles};
