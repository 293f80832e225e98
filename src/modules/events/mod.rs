//! Event system for the retrieval pipeline.
//!
//! Provides hooks for metrics, logging, and custom reactions around ladder
//! activity.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::engines::{AttemptOutcome, EngineTier};

/// An engine is about to be tried.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub url: String,
    pub tier: EngineTier,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An engine attempt completed, including configuration skips.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub url: String,
    pub tier: EngineTier,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationEvent {
    pub url: String,
    pub from: EngineTier,
    pub to: EngineTier,
    pub delay: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CaptchaEvent {
    pub url: String,
    pub tier: EngineTier,
    pub kind: String,
    /// Task id on success, failure reason otherwise.
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyBanEvent {
    pub proxy: String,
    pub fail_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Succeeded,
    Exhausted,
    Cancelled,
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchStatus::Succeeded => "succeeded",
            FetchStatus::Exhausted => "exhausted",
            FetchStatus::Cancelled => "cancelled",
        })
    }
}

/// A whole `fetch` call ended.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub url: String,
    pub status: FetchStatus,
    /// Winning tier when the fetch succeeded.
    pub tier: Option<EngineTier>,
    pub attempts: usize,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RetrievalEvent {
    AttemptStarted(AttemptEvent),
    AttemptFinished(OutcomeEvent),
    Escalated(EscalationEvent),
    CaptchaSolved(CaptchaEvent),
    CaptchaFailed(CaptchaEvent),
    ProxyBanned(ProxyBanEvent),
    Finished(FetchEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &RetrievalEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: RetrievalEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &RetrievalEvent) {
        match event {
            RetrievalEvent::AttemptStarted(attempt) => match &attempt.proxy {
                Some(proxy) => log::debug!("-> [{}] {} via {}", attempt.tier, attempt.url, proxy),
                None => log::debug!("-> [{}] {}", attempt.tier, attempt.url),
            },
            RetrievalEvent::AttemptFinished(done) => {
                log::debug!(
                    "<- [{}] {} -> {} ({:.2}s)",
                    done.tier,
                    done.url,
                    done.outcome,
                    done.latency.as_secs_f64()
                );
            }
            RetrievalEvent::Escalated(step) => {
                log::info!(
                    "escalating {} from {} to {} after {:.2}s",
                    step.url,
                    step.from,
                    step.to,
                    step.delay.as_secs_f64()
                );
            }
            RetrievalEvent::CaptchaSolved(captcha) => {
                log::info!("{} solved on {} (task {})", captcha.kind, captcha.url, captcha.detail);
            }
            RetrievalEvent::CaptchaFailed(captcha) => {
                log::warn!("{} on {} not solved: {}", captcha.kind, captcha.url, captcha.detail);
            }
            RetrievalEvent::ProxyBanned(ban) => {
                log::info!("proxy {} banned after {} failures", ban.proxy, ban.fail_count);
            }
            RetrievalEvent::Finished(fetch) => match fetch.tier {
                Some(tier) => log::info!(
                    "fetched {} with {} in {:.2}s ({} attempts)",
                    fetch.url,
                    tier,
                    fetch.elapsed.as_secs_f64(),
                    fetch.attempts
                ),
                None => log::warn!(
                    "fetch {} {} after {} attempts",
                    fetch.url,
                    fetch.status,
                    fetch.attempts
                ),
            },
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &RetrievalEvent) {
        match event {
            RetrievalEvent::AttemptFinished(done) => {
                self.metrics
                    .record_attempt(done.tier, &done.outcome, done.latency);
            }
            RetrievalEvent::CaptchaSolved(_) => self.metrics.record_captcha(true),
            RetrievalEvent::CaptchaFailed(_) => self.metrics.record_captcha(false),
            RetrievalEvent::ProxyBanned(_) => self.metrics.record_proxy_ban(),
            RetrievalEvent::Finished(fetch) => self.metrics.record_fetch(fetch.status, fetch.elapsed),
            RetrievalEvent::AttemptStarted(_) | RetrievalEvent::Escalated(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &RetrievalEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn finished(status: FetchStatus) -> RetrievalEvent {
        RetrievalEvent::Finished(FetchEvent {
            url: "https://example.com/".into(),
            status,
            tier: None,
            attempts: 4,
            elapsed: Duration::from_secs(9),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(finished(FetchStatus::Exhausted));
        assert_eq!(*counter.0.lock().unwrap(), 1);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn metrics_handler_feeds_collector() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());

        handler.handle(&RetrievalEvent::AttemptFinished(OutcomeEvent {
            url: "https://example.com/".into(),
            tier: EngineTier::Browser,
            outcome: AttemptOutcome::TransportError {
                reason: "navigation timed out".into(),
            },
            latency: Duration::from_secs(30),
            timestamp: Utc::now(),
        }));
        handler.handle(&RetrievalEvent::ProxyBanned(ProxyBanEvent {
            proxy: "10.0.0.1:8080".into(),
            fail_count: 5,
            timestamp: Utc::now(),
        }));
        handler.handle(&finished(FetchStatus::Cancelled));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tier(EngineTier::Browser).unwrap().transport_errors, 1);
        assert_eq!(snapshot.global.proxy_bans, 1);
        assert_eq!(snapshot.global.cancelled, 1);
    }
}
