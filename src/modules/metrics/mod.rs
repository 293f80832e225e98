//! Metrics collection utilities.
//!
//! Aggregates per-tier attempt statistics with latency percentiles, plus
//! whole-fetch counters for the escalation ladder, captcha solving and proxy
//! bans.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::events::FetchStatus;
use crate::engines::{AttemptOutcome, EngineTier};

const DEFAULT_WINDOW: usize = 128;

/// Counters spanning whole fetches rather than single attempts.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub fetches: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub captcha_solved: u64,
    pub captcha_failed: u64,
    pub proxy_bans: u64,
    pub average_fetch_time: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            fetches: 0,
            succeeded: 0,
            exhausted: 0,
            cancelled: 0,
            captcha_solved: 0,
            captcha_failed: 0,
            proxy_bans: 0,
            average_fetch_time: None,
        }
    }
}

/// Tier-scoped metrics snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    pub tier: EngineTier,
    pub attempts: u64,
    pub successes: u64,
    pub blocked: u64,
    pub transport_errors: u64,
    /// Configuration skips. Not counted as attempts.
    pub skipped: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl TierStats {
    fn from_accumulator(tier: EngineTier, acc: &TierAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            tier,
            attempts: acc.attempts,
            successes: acc.successes,
            blocked: acc.blocked,
            transport_errors: acc.transport_errors,
            skipped: acc.skipped,
            average_latency: avg,
            p95_latency: p95,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    /// Ladder order.
    pub tiers: Vec<TierStats>,
}

impl MetricsSnapshot {
    pub fn tier(&self, tier: EngineTier) -> Option<&TierStats> {
        self.tiers.iter().find(|stats| stats.tier == tier)
    }
}

#[derive(Debug)]
struct TierAccumulator {
    attempts: u64,
    successes: u64,
    blocked: u64,
    transport_errors: u64,
    skipped: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl TierAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            blocked: 0,
            transport_errors: 0,
            skipped: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record(&mut self, outcome: &AttemptOutcome, latency: Duration) {
        match outcome {
            AttemptOutcome::ConfigurationError { .. } => {
                self.skipped += 1;
                return;
            }
            AttemptOutcome::Success => self.successes += 1,
            AttemptOutcome::Blocked { .. } => self.blocked += 1,
            AttemptOutcome::TransportError { .. } => self.transport_errors += 1,
        }
        self.attempts += 1;

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    tiers: BTreeMap<EngineTier, TierAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            tiers: BTreeMap::new(),
        }
    }

    fn accumulator_mut(&mut self, tier: EngineTier) -> &mut TierAccumulator {
        let window = self.max_window;
        self.tiers
            .entry(tier)
            .or_insert_with(|| TierAccumulator::new(window))
    }
}

/// Thread-safe metrics collector shared by the selector and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_attempt(&self, tier: EngineTier, outcome: &AttemptOutcome, latency: Duration) {
        self.state().accumulator_mut(tier).record(outcome, latency);
    }

    pub fn record_fetch(&self, status: FetchStatus, elapsed: Duration) {
        let mut guard = self.state();
        let global = &mut guard.global;
        global.fetches += 1;
        match status {
            FetchStatus::Succeeded => global.succeeded += 1,
            FetchStatus::Exhausted => global.exhausted += 1,
            FetchStatus::Cancelled => global.cancelled += 1,
        }

        global.average_fetch_time = Some(match global.average_fetch_time {
            Some(avg) => {
                Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + elapsed.as_secs_f64() * 0.1)
            }
            None => elapsed,
        });
    }

    pub fn record_captcha(&self, solved: bool) {
        let mut guard = self.state();
        if solved {
            guard.global.captcha_solved += 1;
        } else {
            guard.global.captcha_failed += 1;
        }
    }

    pub fn record_proxy_ban(&self) {
        self.state().global.proxy_bans += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.state();
        let tiers = guard
            .tiers
            .iter()
            .map(|(tier, acc)| TierStats::from_accumulator(*tier, acc))
            .collect();
        MetricsSnapshot {
            global: guard.global.clone(),
            tiers,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
