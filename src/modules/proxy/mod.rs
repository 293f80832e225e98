//! Proxy pool with health tracking and ban enforcement.
//!
//! Every attempt routed through a proxy reports back with
//! [`ProxyPool::mark_success`] or [`ProxyPool::mark_failure`]. Selection
//! favours the best observed success rates while still spreading load over
//! the top few candidates.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use url::Url;

use crate::config::ConfigError;

pub const DEFAULT_TOP_K: usize = 3;
pub const DEFAULT_MAX_FAILURES: u32 = 5;
pub const DEFAULT_CHECK_URL: &str = "https://httpbin.org/ip";
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for ProxyProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" | "socks5h" => Ok(ProxyProtocol::Socks5),
            other => Err(ConfigError::InvalidProxy(format!("unsupported scheme {other}"))),
        }
    }
}

/// One proxy endpoint plus its observed health.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
    pub country: Option<String>,
    pub success_count: u64,
    pub fail_count: u32,
    pub last_used: Option<DateTime<Utc>>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
            country: None,
            success_count: 0,
            fail_count: 0,
            last_used: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into().to_ascii_lowercase());
        self
    }

    /// `scheme://[user:pass@]host:port`, the form reqwest accepts.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}:{}", self.protocol, user, pass, self.host, self.port)
            }
            (Some(user), None) => format!("{}://{}@{}:{}", self.protocol, user, self.host, self.port),
            _ => format!("{}://{}:{}", self.protocol, self.host, self.port),
        }
    }

    /// Host and port only, safe for logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Observed success ratio; 0.5 before any observation.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.fail_count as u64;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

impl FromStr for Proxy {
    type Err = ConfigError;

    /// Accepts `scheme://[user:pass@]host:port` or a bare `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let with_scheme = if line.contains("://") {
            line.to_string()
        } else {
            format!("http://{line}")
        };
        let parsed = Url::parse(&with_scheme).map_err(|_| ConfigError::InvalidProxy(line.to_string()))?;
        let protocol = parsed.scheme().parse::<ProxyProtocol>()?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidProxy(line.to_string()))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidProxy(line.to_string()))?;

        let mut proxy = Proxy::new(host, port).with_protocol(protocol);
        if !parsed.username().is_empty() {
            proxy.username = Some(parsed.username().to_string());
            proxy.password = parsed.password().map(str::to_string);
        }
        Ok(proxy)
    }
}

/// When a proxy gets banned and for how long.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BanPolicy {
    pub max_failures: u32,
    /// `None` keeps the ban until [`ProxyPool::clear_bans`].
    pub ban_duration: Option<Duration>,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            ban_duration: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub ban_policy: BanPolicy,
    pub top_k: usize,
    pub check_url: String,
    pub check_timeout: Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            ban_policy: BanPolicy::default(),
            top_k: DEFAULT_TOP_K,
            check_url: DEFAULT_CHECK_URL.to_string(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

/// Handle returned by [`ProxyPool::get`]; a snapshot, not a live record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyLease {
    pub index: usize,
    pub proxy: Proxy,
}

impl ProxyLease {
    pub fn url(&self) -> String {
        self.proxy.url()
    }
}

/// What one [`ProxyPool::mark_failure`] call did to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FailureMark {
    /// Failure count after this failure.
    pub fail_count: u32,
    /// This failure crossed the threshold and banned the proxy.
    pub banned: bool,
}

/// Result of a [`ProxyPool::check_all`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyHealthReport {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
    pub banned: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub available: usize,
    pub banned: usize,
    pub avg_success_rate: f64,
    pub failed_checks: u64,
}

#[derive(Debug)]
struct ProxyEntry {
    proxy: Proxy,
    banned_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<ProxyEntry>,
    failed_checks: u64,
}

/// Shared proxy pool. Every read-modify-write happens under one lock.
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config: ProxyPoolConfig {
                top_k: config.top_k.max(1),
                ban_policy: BanPolicy {
                    max_failures: config.ban_policy.max_failures.max(1),
                    ..config.ban_policy
                },
                ..config
            },
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Build a pool from newline- or comma-separated proxy lines.
    pub fn from_lines(config: ProxyPoolConfig, lines: &str) -> Result<Self, ConfigError> {
        let pool = Self::new(config);
        let proxies = lines
            .split(['\n', ','])
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::parse::<Proxy>)
            .collect::<Result<Vec<_>, _>>()?;
        pool.add_many(proxies);
        Ok(pool)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    pub fn add(&self, proxy: Proxy) {
        self.state().entries.push(ProxyEntry {
            proxy,
            banned_at: None,
        });
    }

    pub fn add_many<I>(&self, proxies: I)
    where
        I: IntoIterator<Item = Proxy>,
    {
        let mut state = self.state();
        state.entries.extend(proxies.into_iter().map(|proxy| ProxyEntry {
            proxy,
            banned_at: None,
        }));
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every proxy in insertion order.
    pub fn proxies(&self) -> Vec<Proxy> {
        self.state().entries.iter().map(|entry| entry.proxy.clone()).collect()
    }

    /// Pick a healthy proxy matching the filters.
    pub fn get(&self, country: Option<&str>, protocol: ProxyProtocol) -> Option<ProxyLease> {
        let mut state = self.state();
        self.lift_expired_bans(&mut state);

        let max_failures = self.config.ban_policy.max_failures;
        let mut eligible: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.banned_at.is_none()
                    && entry.proxy.protocol == protocol
                    && entry.proxy.fail_count < max_failures
                    && country.is_none_or(|wanted| {
                        entry
                            .proxy
                            .country
                            .as_deref()
                            .is_some_and(|have| have.eq_ignore_ascii_case(wanted))
                    })
            })
            .map(|(idx, _)| idx)
            .collect();

        if eligible.is_empty() {
            return None;
        }

        // Stable sort keeps insertion order among equal rates.
        eligible.sort_by(|&a, &b| {
            let lhs = state.entries[a].proxy.success_rate();
            let rhs = state.entries[b].proxy.success_rate();
            rhs.partial_cmp(&lhs).unwrap_or(Ordering::Equal)
        });

        let top_k = self.config.top_k;
        let index = if eligible.len() >= top_k {
            *eligible[..top_k].choose(&mut rand::thread_rng())?
        } else {
            eligible[0]
        };

        let entry = &mut state.entries[index];
        entry.proxy.last_used = Some(Utc::now());
        Some(ProxyLease {
            index,
            proxy: entry.proxy.clone(),
        })
    }

    pub fn mark_success(&self, lease: &ProxyLease) {
        let mut state = self.state();
        if let Some(entry) = state.entries.get_mut(lease.index) {
            entry.proxy.success_count += 1;
        }
    }

    /// Record a failure and ban the proxy once it reaches the threshold.
    pub fn mark_failure(&self, lease: &ProxyLease) -> FailureMark {
        let max_failures = self.config.ban_policy.max_failures;
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(lease.index) else {
            return FailureMark::default();
        };

        entry.proxy.fail_count = entry.proxy.fail_count.saturating_add(1);
        let fail_count = entry.proxy.fail_count;
        let banned = entry.banned_at.is_none() && fail_count >= max_failures;
        if banned {
            entry.banned_at = Some(Instant::now());
            log::warn!(
                "proxy {} banned after {} failures",
                entry.proxy.endpoint(),
                fail_count
            );
        }
        FailureMark { fail_count, banned }
    }

    /// Lift every ban and reset the failure count of the proxies it applied
    /// to. Returns how many proxies were unbanned.
    pub fn clear_bans(&self) -> usize {
        let mut state = self.state();
        let mut lifted = 0;
        for entry in state.entries.iter_mut().filter(|entry| entry.banned_at.is_some()) {
            entry.banned_at = None;
            entry.proxy.fail_count = 0;
            lifted += 1;
        }
        lifted
    }

    fn lift_expired_bans(&self, state: &mut PoolState) {
        let Some(ttl) = self.config.ban_policy.ban_duration else {
            return;
        };
        for entry in &mut state.entries {
            if let Some(since) = entry.banned_at
                && since.elapsed() >= ttl
            {
                log::debug!("ban on proxy {} expired", entry.proxy.endpoint());
                entry.banned_at = None;
                entry.proxy.fail_count = 0;
            }
        }
    }

    /// Probe one proxy against the echo endpoint. Any non-200 or transport
    /// failure counts as dead.
    pub async fn check(&self, proxy: &Proxy) -> bool {
        let alive = match self.probe(proxy).await {
            Ok(status) => status == reqwest::StatusCode::OK,
            Err(err) => {
                log::debug!("proxy {} health probe failed: {}", proxy.endpoint(), err);
                false
            }
        };
        if !alive {
            self.state().failed_checks += 1;
        }
        alive
    }

    async fn probe(&self, proxy: &Proxy) -> Result<reqwest::StatusCode, reqwest::Error> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(proxy.url())?)
            .timeout(self.config.check_timeout)
            .build()?;
        let response = client.get(&self.config.check_url).send().await?;
        Ok(response.status())
    }

    /// Sequentially probe every proxy and fold the results into its health.
    pub async fn check_all(&self) -> ProxyHealthReport {
        let snapshot = self.proxies();
        let mut report = ProxyHealthReport {
            total: snapshot.len(),
            ..Default::default()
        };

        for (index, proxy) in snapshot.into_iter().enumerate() {
            let lease = ProxyLease { index, proxy };
            if self.check(&lease.proxy).await {
                report.working += 1;
                self.mark_success(&lease);
            } else {
                report.failed += 1;
                self.mark_failure(&lease);
            }
        }

        report.banned = self.stats().banned;
        log::info!(
            "proxy sweep: {} total, {} working, {} failed, {} banned",
            report.total,
            report.working,
            report.failed,
            report.banned
        );
        report
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let state = self.state();
        let total = state.entries.len();
        let banned = state.entries.iter().filter(|entry| entry.banned_at.is_some()).count();
        let avg_success_rate = if total == 0 {
            0.0
        } else {
            state.entries.iter().map(|entry| entry.proxy.success_rate()).sum::<f64>() / total as f64
        };
        ProxyPoolStats {
            total,
            available: total - banned,
            banned,
            avg_success_rate,
            failed_checks: state.failed_checks,
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyPoolConfig::default())
    }
}
