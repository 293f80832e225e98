//! Engine selection and escalation.
//!
//! [`EngineSelector`] probes a target, starts at the cheapest tier expected to
//! get through its protection and climbs the ladder (Direct, Impersonate,
//! Browser, Unlocker) until an engine returns content that is not a challenge
//! page. Each tier runs at most once per fetch and the ladder never steps back
//! down.

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ConfigError, DEFAULT_REQUEST_TIMEOUT, Settings};
use crate::engines::{
	AttemptOutcome, BrowserEngine, BrowserEngineConfig, DirectEngine, EngineError, EngineRegistry,
	EngineTier, FetchEngine, FetchRequest, ImpersonateEngine, UnlockerCredentials, UnlockerEngine,
};
use crate::external_deps::captcha::{CaptchaError, CaptchaProvider, TwoCaptchaProvider};
use crate::modules::events::{
	AttemptEvent, CaptchaEvent, EscalationEvent, EventDispatcher, EventHandler, FetchEvent,
	FetchStatus, LoggingHandler, MetricsHandler, OutcomeEvent, ProxyBanEvent, RetrievalEvent,
};
use crate::modules::metrics::MetricsCollector;
use crate::modules::proxy::{ProxyLease, ProxyPool, ProxyProtocol};
use crate::modules::rate_limit::{RateLimitConfig, RateLimiter, backoff_delay};
use crate::protection::{
	ProtectionDetector, ProtectionProbe, ProtectionType, block_signature, find_captcha,
	recommended_tier,
};

/// The unlocker goes through a vendor that solves challenges server side.
pub const UNLOCKER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Result alias used across the orchestration layer.
pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	Cancelled,
	DeadlineExceeded,
}

impl fmt::Display for CancelReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			CancelReason::Cancelled => "cancelled by caller",
			CancelReason::DeadlineExceeded => "deadline exceeded",
		})
	}
}

/// High-level error surfaced by the selector.
#[derive(Debug, Error)]
pub enum FetchError {
	#[error("invalid url `{url}`: {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},
	#[error("every engine failed for {url}: {}", describe_attempts(.attempts))]
	Exhausted {
		url: String,
		attempts: Vec<FetchAttempt>,
	},
	#[error("forced {tier} engine failed for {url}: {outcome}")]
	Forced {
		url: String,
		tier: EngineTier,
		outcome: AttemptOutcome,
	},
	#[error("fetch of {url} stopped after {} attempts: {reason}", .attempts.len())]
	Cancelled {
		url: String,
		reason: CancelReason,
		attempts: Vec<FetchAttempt>,
	},
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("captcha provider setup failed: {0}")]
	Captcha(#[from] CaptchaError),
	#[error("http client setup failed: {0}")]
	Setup(#[from] reqwest::Error),
}

impl FetchError {
	/// Attempts made before the error, where the error carries them.
	pub fn attempts(&self) -> &[FetchAttempt] {
		match self {
			FetchError::Exhausted { attempts, .. } | FetchError::Cancelled { attempts, .. } => {
				attempts
			}
			_ => &[],
		}
	}
}

fn describe_attempts(attempts: &[FetchAttempt]) -> String {
	if attempts.is_empty() {
		return "no engine was tried".to_string();
	}
	attempts
		.iter()
		.map(|attempt| format!("{}: {}", attempt.tier, attempt.outcome))
		.collect::<Vec<_>>()
		.join("; ")
}

/// One rung of the ladder, including configuration skips.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttempt {
	pub tier: EngineTier,
	pub outcome: AttemptOutcome,
	pub latency: Duration,
	/// Proxy endpoint, without credentials.
	pub proxy: Option<String>,
	/// Why a captcha found on the blocked page was not solved.
	pub captcha_error: Option<String>,
}

impl FetchAttempt {
	fn skipped(tier: EngineTier, reason: String) -> Self {
		Self {
			tier,
			outcome: AttemptOutcome::ConfigurationError { reason },
			latency: Duration::ZERO,
			proxy: None,
			captcha_error: None,
		}
	}
}

/// Per-call knobs for [`EngineSelector::fetch_with`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
	/// Run exactly this tier. No detection, no escalation.
	pub forced_tier: Option<EngineTier>,
	/// Budget for the whole call, measured from its start.
	pub deadline: Option<Duration>,
	pub cancel: Option<CancellationToken>,
	/// Proxy country for this call, overriding the selector default.
	pub country: Option<String>,
}

impl FetchOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_forced_tier(mut self, tier: EngineTier) -> Self {
		self.forced_tier = Some(tier);
		self
	}

	pub fn with_deadline(mut self, deadline: Duration) -> Self {
		self.deadline = Some(deadline);
		self
	}

	pub fn with_cancel(mut self, token: CancellationToken) -> Self {
		self.cancel = Some(token);
		self
	}

	pub fn with_country(mut self, country: impl Into<String>) -> Self {
		self.country = Some(country.into());
		self
	}
}

/// Content plus everything learned while getting it.
#[derive(Debug, Clone)]
pub struct FetchResponse {
	pub url: Url,
	pub content: String,
	pub tier: EngineTier,
	/// `None` when detection was skipped.
	pub protection: Option<ProtectionType>,
	pub attempts: Vec<FetchAttempt>,
	pub elapsed: Duration,
}

/// Selector configuration used by the builder.
#[derive(Debug, Clone)]
pub struct EngineSelectorConfig {
	pub detect_protection: bool,
	pub apply_backoff: bool,
	pub enable_metrics: bool,
	/// Tiers that lease a proxy from the pool when one is configured.
	pub proxy_tiers: Vec<EngineTier>,
	pub proxy_protocol: ProxyProtocol,
	pub proxy_country: Option<String>,
	pub attempt_timeouts: BTreeMap<EngineTier, Duration>,
}

impl EngineSelectorConfig {
	pub fn attempt_timeout(&self, tier: EngineTier) -> Duration {
		self.attempt_timeouts
			.get(&tier)
			.copied()
			.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
	}
}

impl Default for EngineSelectorConfig {
	fn default() -> Self {
		let attempt_timeouts = EngineTier::LADDER
			.iter()
			.map(|tier| match tier {
				EngineTier::Unlocker => (*tier, UNLOCKER_ATTEMPT_TIMEOUT),
				_ => (*tier, DEFAULT_REQUEST_TIMEOUT),
			})
			.collect();
		Self {
			detect_protection: true,
			apply_backoff: true,
			enable_metrics: true,
			proxy_tiers: vec![EngineTier::Direct, EngineTier::Impersonate],
			proxy_protocol: ProxyProtocol::Http,
			proxy_country: None,
			attempt_timeouts,
		}
	}
}

/// Fluent builder for [`EngineSelector`].
pub struct EngineSelectorBuilder {
	config: EngineSelectorConfig,
	engines: EngineRegistry,
	default_engines: bool,
	browser: BrowserEngineConfig,
	unlocker: Option<UnlockerCredentials>,
	probe: Option<Arc<dyn ProtectionProbe>>,
	rate_limit: Option<RateLimitConfig>,
	rate_limiter: Option<Arc<RateLimiter>>,
	proxy_pool: Option<Arc<ProxyPool>>,
	captcha_provider: Option<Arc<dyn CaptchaProvider>>,
	captcha_api_key: Option<String>,
	metrics: Option<MetricsCollector>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl EngineSelectorBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineSelectorConfig::default(),
			engines: EngineRegistry::new(),
			default_engines: false,
			browser: BrowserEngineConfig::default(),
			unlocker: None,
			probe: None,
			rate_limit: Some(RateLimitConfig::default()),
			rate_limiter: None,
			proxy_pool: None,
			captcha_provider: None,
			captcha_api_key: None,
			metrics: None,
			handlers: Vec::new(),
		}
	}

	/// Apply environment-derived settings: rate limit, timeouts, proxy
	/// country, unlocker credentials and the 2Captcha key.
	pub fn with_settings(mut self, settings: &Settings) -> Self {
		self.rate_limit = Some(settings.rate_limit());
		self.rate_limiter = None;
		for tier in [EngineTier::Direct, EngineTier::Impersonate, EngineTier::Browser] {
			self.config
				.attempt_timeouts
				.insert(tier, settings.request_timeout);
		}
		self.config.proxy_country = settings.proxy_country.clone();
		self.unlocker = settings.unlocker_credentials();
		self.captcha_api_key = settings.twocaptcha_api_key.clone();
		self
	}

	/// Register an engine, replacing any engine already serving its tier.
	pub fn with_engine(mut self, engine: Arc<dyn FetchEngine>) -> Self {
		self.engines.register(engine);
		self
	}

	/// Fill every tier without an explicit engine with the stock one.
	pub fn with_default_engines(mut self) -> Self {
		self.default_engines = true;
		self
	}

	pub fn with_browser_config(mut self, config: BrowserEngineConfig) -> Self {
		self.browser = config;
		self
	}

	pub fn with_unlocker_credentials(mut self, credentials: UnlockerCredentials) -> Self {
		self.unlocker = Some(credentials);
		self
	}

	pub fn with_detector(mut self, probe: Arc<dyn ProtectionProbe>) -> Self {
		self.probe = Some(probe);
		self.config.detect_protection = true;
		self
	}

	/// Start every fetch at the direct tier without probing.
	pub fn disable_detection(mut self) -> Self {
		self.config.detect_protection = false;
		self
	}

	pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
		self.rate_limit = Some(config);
		self.rate_limiter = None;
		self
	}

	/// Share one limiter between several selectors.
	pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
		self.rate_limiter = Some(limiter);
		self
	}

	pub fn disable_rate_limit(mut self) -> Self {
		self.rate_limit = None;
		self.rate_limiter = None;
		self
	}

	pub fn with_proxy_pool(mut self, pool: Arc<ProxyPool>) -> Self {
		self.proxy_pool = Some(pool);
		self
	}

	pub fn with_proxy_tiers<I>(mut self, tiers: I) -> Self
	where
		I: IntoIterator<Item = EngineTier>,
	{
		self.config.proxy_tiers = tiers.into_iter().collect();
		self
	}

	pub fn with_proxy_protocol(mut self, protocol: ProxyProtocol) -> Self {
		self.config.proxy_protocol = protocol;
		self
	}

	pub fn with_proxy_country(mut self, country: impl Into<String>) -> Self {
		self.config.proxy_country = Some(country.into());
		self
	}

	pub fn with_captcha_provider(mut self, provider: Arc<dyn CaptchaProvider>) -> Self {
		self.captcha_provider = Some(provider);
		self
	}

	/// Record into an existing collector instead of a fresh one.
	pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
		self.metrics = Some(metrics);
		self.config.enable_metrics = true;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn with_attempt_timeout(mut self, tier: EngineTier, timeout: Duration) -> Self {
		self.config.attempt_timeouts.insert(tier, timeout);
		self
	}

	/// Escalate immediately instead of sleeping between tiers.
	pub fn disable_backoff(mut self) -> Self {
		self.config.apply_backoff = false;
		self
	}

	pub fn build(self) -> FetchResult<EngineSelector> {
		let mut engines = self.engines;
		if self.default_engines {
			if engines.get(EngineTier::Direct).is_none() {
				engines.register(Arc::new(DirectEngine::new()));
			}
			if engines.get(EngineTier::Impersonate).is_none() {
				engines.register(Arc::new(ImpersonateEngine::new()));
			}
			if engines.get(EngineTier::Browser).is_none() {
				engines.register(Arc::new(BrowserEngine::new(self.browser)));
			}
			if engines.get(EngineTier::Unlocker).is_none() {
				let mut unlocker = UnlockerEngine::new(self.unlocker);
				if let Some(country) = &self.config.proxy_country {
					unlocker = unlocker.with_country(Some(country.clone()));
				}
				engines.register(Arc::new(unlocker));
			}
		}

		let probe = match (self.config.detect_protection, self.probe) {
			(false, _) => None,
			(true, Some(probe)) => Some(probe),
			(true, None) => Some(Arc::new(ProtectionDetector::new()?) as Arc<dyn ProtectionProbe>),
		};

		let rate_limiter = match (self.rate_limiter, self.rate_limit) {
			(Some(shared), _) => Some(shared),
			(None, Some(config)) => Some(Arc::new(RateLimiter::new(config)?)),
			(None, None) => None,
		};

		let captcha = match (self.captcha_provider, self.captcha_api_key) {
			(Some(provider), _) => Some(provider),
			(None, Some(key)) => Some(Arc::new(TwoCaptchaProvider::new(key)?) as Arc<dyn CaptchaProvider>),
			(None, None) => None,
		};

		let metrics = self
			.config
			.enable_metrics
			.then(|| self.metrics.unwrap_or_default());

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in self.handlers {
			events.register_handler(handler);
		}

		log::debug!("engine selector ready with tiers {:?}", engines.tiers());

		Ok(EngineSelector {
			config: self.config,
			engines,
			probe,
			rate_limiter,
			proxy_pool: self.proxy_pool,
			captcha,
			metrics,
			events: Arc::new(events),
		})
	}
}

impl Default for EngineSelectorBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Cancellation token and deadline shared by every wait inside one fetch.
struct StopSignal {
	cancel: Option<CancellationToken>,
	deadline: Option<Instant>,
}

impl StopSignal {
	fn new(options: &FetchOptions, started: Instant) -> Self {
		Self {
			cancel: options.cancel.clone(),
			deadline: options.deadline.map(|budget| started + budget),
		}
	}

	fn check(&self) -> Result<(), CancelReason> {
		if self
			.cancel
			.as_ref()
			.is_some_and(CancellationToken::is_cancelled)
		{
			return Err(CancelReason::Cancelled);
		}
		if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
			return Err(CancelReason::DeadlineExceeded);
		}
		Ok(())
	}

	/// Run `future` unless the caller cancels or the deadline passes first.
	async fn race<F: Future>(&self, future: F) -> Result<F::Output, CancelReason> {
		self.check()?;
		let cancelled = async {
			match &self.cancel {
				Some(token) => token.cancelled().await,
				None => pending::<()>().await,
			}
		};
		let expired = async {
			match self.deadline {
				Some(deadline) => sleep_until(deadline).await,
				None => pending::<()>().await,
			}
		};

		tokio::select! {
			biased;
			_ = cancelled => Err(CancelReason::Cancelled),
			_ = expired => Err(CancelReason::DeadlineExceeded),
			output = future => Ok(output),
		}
	}
}

/// Why a call stopped without content; turned into a [`FetchError`] once the
/// attempt list is complete.
enum Halt {
	Exhausted,
	Forced(EngineTier, AttemptOutcome),
	Cancelled(CancelReason),
}

/// Result of running an engine once: the outcome plus the page text when
/// there is one (content on success, the challenge page when blocked).
type EngineRun = (AttemptOutcome, Option<String>);

/// Orchestrates detection, escalation, throttling, proxies and captchas.
pub struct EngineSelector {
	config: EngineSelectorConfig,
	engines: EngineRegistry,
	probe: Option<Arc<dyn ProtectionProbe>>,
	rate_limiter: Option<Arc<RateLimiter>>,
	proxy_pool: Option<Arc<ProxyPool>>,
	captcha: Option<Arc<dyn CaptchaProvider>>,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

impl EngineSelector {
	/// Selector with every stock engine and default settings.
	pub fn new() -> FetchResult<Self> {
		Self::builder().with_default_engines().build()
	}

	/// Selector configured from the process environment.
	pub fn from_env() -> FetchResult<Self> {
		let settings = Settings::from_env()?;
		Self::builder()
			.with_settings(&settings)
			.with_default_engines()
			.build()
	}

	/// Obtain a builder to customise the selector instance.
	pub fn builder() -> EngineSelectorBuilder {
		EngineSelectorBuilder::new()
	}

	pub fn config(&self) -> &EngineSelectorConfig {
		&self.config
	}

	pub fn engines(&self) -> &EngineRegistry {
		&self.engines
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	pub fn proxy_pool(&self) -> Option<&Arc<ProxyPool>> {
		self.proxy_pool.as_ref()
	}

	pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
		self.rate_limiter.as_ref()
	}

	/// Classify a target without fetching it. `None` when detection is off.
	pub async fn detect(&self, url: &str) -> Option<ProtectionType> {
		match &self.probe {
			Some(probe) => Some(probe.detect(url).await),
			None => None,
		}
	}

	/// Fetch a page's content, escalating as needed.
	pub async fn fetch(&self, url: &str) -> FetchResult<String> {
		self.fetch_with(url, FetchOptions::default())
			.await
			.map(|response| response.content)
	}

	pub async fn fetch_with(&self, url: &str, options: FetchOptions) -> FetchResult<FetchResponse> {
		let target = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
			url: url.to_string(),
			source,
		})?;

		let started = Instant::now();
		let stop = StopSignal::new(&options, started);
		let mut attempts = Vec::new();
		let mut protection = None;

		let outcome = match options.forced_tier {
			Some(tier) => {
				self.run_forced(&target, tier, &options, &stop, &mut attempts)
					.await
			}
			None => {
				self.run_ladder(&target, &options, &stop, &mut attempts, &mut protection)
					.await
			}
		};

		let elapsed = started.elapsed();
		let (status, tier) = match &outcome {
			Ok((tier, _)) => (FetchStatus::Succeeded, Some(*tier)),
			Err(Halt::Cancelled(_)) => (FetchStatus::Cancelled, None),
			Err(_) => (FetchStatus::Exhausted, None),
		};
		self.events.dispatch(RetrievalEvent::Finished(FetchEvent {
			url: target.to_string(),
			status,
			tier,
			attempts: attempts.len(),
			elapsed,
			timestamp: Utc::now(),
		}));

		match outcome {
			Ok((tier, content)) => Ok(FetchResponse {
				url: target,
				content,
				tier,
				protection,
				attempts,
				elapsed,
			}),
			Err(Halt::Exhausted) => Err(FetchError::Exhausted {
				url: target.to_string(),
				attempts,
			}),
			Err(Halt::Forced(tier, outcome)) => Err(FetchError::Forced {
				url: target.to_string(),
				tier,
				outcome,
			}),
			Err(Halt::Cancelled(reason)) => Err(FetchError::Cancelled {
				url: target.to_string(),
				reason,
				attempts,
			}),
		}
	}

	async fn run_ladder(
		&self,
		url: &Url,
		options: &FetchOptions,
		stop: &StopSignal,
		attempts: &mut Vec<FetchAttempt>,
		protection: &mut Option<ProtectionType>,
	) -> Result<(EngineTier, String), Halt> {
		let start = match &self.probe {
			Some(probe) => {
				let detected = stop
					.race(probe.detect(url.as_str()))
					.await
					.map_err(Halt::Cancelled)?;
				*protection = Some(detected);
				recommended_tier(detected)
			}
			None => EngineTier::Direct,
		};
		log::debug!("starting {url} at {start}");

		let mut failures = 0u32;
		let mut last_failed: Option<EngineTier> = None;

		for tier in start.ladder_from() {
			stop.check().map_err(Halt::Cancelled)?;

			let engine = match self.usable_engine(tier) {
				Ok(engine) => engine,
				Err(reason) => {
					self.record_skip(url, attempts, FetchAttempt::skipped(tier, reason));
					continue;
				}
			};

			if let Some(from) = last_failed {
				let delay = if self.config.apply_backoff {
					backoff_delay(failures.saturating_sub(1))
				} else {
					Duration::ZERO
				};
				self.events
					.dispatch(RetrievalEvent::Escalated(EscalationEvent {
						url: url.to_string(),
						from,
						to: tier,
						delay,
						timestamp: Utc::now(),
					}));
				if !delay.is_zero() {
					stop.race(sleep(delay)).await.map_err(Halt::Cancelled)?;
				}
			}

			let (attempt, content) = self
				.attempt(url, engine, options, stop)
				.await
				.map_err(Halt::Cancelled)?;
			let failed = attempt.outcome.is_failure();
			attempts.push(attempt);

			if let Some(content) = content {
				return Ok((tier, content));
			}
			if failed {
				failures += 1;
				last_failed = Some(tier);
			}
		}

		Err(Halt::Exhausted)
	}

	async fn run_forced(
		&self,
		url: &Url,
		tier: EngineTier,
		options: &FetchOptions,
		stop: &StopSignal,
		attempts: &mut Vec<FetchAttempt>,
	) -> Result<(EngineTier, String), Halt> {
		let engine = match self.usable_engine(tier) {
			Ok(engine) => engine,
			Err(reason) => {
				let skipped = FetchAttempt::skipped(tier, reason);
				let outcome = skipped.outcome.clone();
				self.record_skip(url, attempts, skipped);
				return Err(Halt::Forced(tier, outcome));
			}
		};

		let (attempt, content) = self
			.attempt(url, engine, options, stop)
			.await
			.map_err(Halt::Cancelled)?;
		let outcome = attempt.outcome.clone();
		attempts.push(attempt);
		match content {
			Some(content) => Ok((tier, content)),
			None => Err(Halt::Forced(tier, outcome)),
		}
	}

	fn usable_engine(&self, tier: EngineTier) -> Result<&Arc<dyn FetchEngine>, String> {
		match self.engines.get(tier) {
			None => Err(format!("no {tier} engine registered")),
			Some(engine) if !engine.is_configured() => Err(format!("{tier} engine is not configured")),
			Some(engine) => Ok(engine),
		}
	}

	fn record_skip(&self, url: &Url, attempts: &mut Vec<FetchAttempt>, skipped: FetchAttempt) {
		self.events
			.dispatch(RetrievalEvent::AttemptFinished(OutcomeEvent {
				url: url.to_string(),
				tier: skipped.tier,
				outcome: skipped.outcome.clone(),
				latency: Duration::ZERO,
				timestamp: Utc::now(),
			}));
		attempts.push(skipped);
	}

	/// One tier, including the captcha retry. Returns content only on
	/// success.
	async fn attempt(
		&self,
		url: &Url,
		engine: &Arc<dyn FetchEngine>,
		options: &FetchOptions,
		stop: &StopSignal,
	) -> Result<(FetchAttempt, Option<String>), CancelReason> {
		let tier = engine.tier();
		if let Some(limiter) = &self.rate_limiter {
			let waited = stop.race(limiter.acquire()).await?;
			if !waited.is_zero() {
				log::debug!("rate limiter held {url} for {:.2}s", waited.as_secs_f64());
			}
		}

		let lease = self.lease_proxy(tier, options);
		let proxy = lease.as_ref().map(|lease| lease.proxy.endpoint());
		let mut request =
			FetchRequest::new(url.clone()).with_timeout(self.config.attempt_timeout(tier));
		if let Some(lease) = &lease {
			request = request.with_proxy(lease.url());
		}

		self.events
			.dispatch(RetrievalEvent::AttemptStarted(AttemptEvent {
				url: url.to_string(),
				tier,
				proxy: proxy.clone(),
				timestamp: Utc::now(),
			}));

		let started = Instant::now();
		let (mut outcome, mut page) = self.run_engine(engine, &request, stop).await?;
		let mut captcha_error = None;

		if matches!(outcome, AttemptOutcome::Blocked { .. })
			&& engine.accepts_captcha_tokens()
			&& let Some(provider) = &self.captcha
			&& let Some(mut task) = page
				.as_deref()
				.and_then(|html| find_captcha(html, url.as_str()))
		{
			let kind = task.kind.label();
			let captcha = |detail: String| CaptchaEvent {
				url: url.to_string(),
				tier,
				kind: kind.to_string(),
				detail,
				timestamp: Utc::now(),
			};
			match stop.race(provider.solve(&mut task)).await? {
				Ok(solution) => {
					self.events.dispatch(RetrievalEvent::CaptchaSolved(captcha(
						solution.task_id.clone(),
					)));
					let retry = request.clone().with_captcha(solution);
					(outcome, page) = self.run_engine(engine, &retry, stop).await?;
				}
				Err(err) => {
					self.events
						.dispatch(RetrievalEvent::CaptchaFailed(captcha(err.to_string())));
					captcha_error = Some(err.to_string());
				}
			}
		}

		let latency = started.elapsed();
		if let Some(lease) = &lease {
			self.settle_proxy(lease, &outcome);
		}

		self.events
			.dispatch(RetrievalEvent::AttemptFinished(OutcomeEvent {
				url: url.to_string(),
				tier,
				outcome: outcome.clone(),
				latency,
				timestamp: Utc::now(),
			}));

		let content = match outcome {
			AttemptOutcome::Success => Some(page.unwrap_or_default()),
			_ => None,
		};
		Ok((
			FetchAttempt {
				tier,
				outcome,
				latency,
				proxy,
				captcha_error,
			},
			content,
		))
	}

	async fn run_engine(
		&self,
		engine: &Arc<dyn FetchEngine>,
		request: &FetchRequest,
		stop: &StopSignal,
	) -> Result<EngineRun, CancelReason> {
		let result = stop
			.race(tokio::time::timeout(request.timeout, engine.fetch(request)))
			.await?;

		Ok(match result {
			Err(_) => (
				AttemptOutcome::TransportError {
					reason: format!("no response within {:?}", request.timeout),
				},
				None,
			),
			Ok(Ok(body)) => match block_signature(&body) {
				Some(signature) => (
					AttemptOutcome::Blocked {
						signature: signature.to_string(),
					},
					Some(body),
				),
				None => (AttemptOutcome::Success, Some(body)),
			},
			Ok(Err(EngineError::Status { status, body, .. })) => match block_signature(&body) {
				Some(signature) => (
					AttemptOutcome::Blocked {
						signature: signature.to_string(),
					},
					Some(body),
				),
				None => (
					AttemptOutcome::TransportError {
						reason: format!("http {status}"),
					},
					None,
				),
			},
			Ok(Err(err)) if err.is_configuration() => (
				AttemptOutcome::ConfigurationError {
					reason: err.to_string(),
				},
				None,
			),
			Ok(Err(err)) => (
				AttemptOutcome::TransportError {
					reason: err.to_string(),
				},
				None,
			),
		})
	}

	fn lease_proxy(&self, tier: EngineTier, options: &FetchOptions) -> Option<ProxyLease> {
		let pool = self.proxy_pool.as_ref()?;
		if !self.config.proxy_tiers.contains(&tier) {
			return None;
		}
		let country = options
			.country
			.as_deref()
			.or(self.config.proxy_country.as_deref());
		let lease = pool.get(country, self.config.proxy_protocol);
		if lease.is_none() {
			log::debug!("no eligible proxy for the {tier} tier, connecting directly");
		}
		lease
	}

	fn settle_proxy(&self, lease: &ProxyLease, outcome: &AttemptOutcome) {
		let Some(pool) = &self.proxy_pool else {
			return;
		};
		match outcome {
			AttemptOutcome::Success => pool.mark_success(lease),
			outcome if outcome.is_failure() => {
				let mark = pool.mark_failure(lease);
				if mark.banned {
					self.events
						.dispatch(RetrievalEvent::ProxyBanned(ProxyBanEvent {
							proxy: lease.proxy.endpoint(),
							fail_count: mark.fail_count,
							timestamp: Utc::now(),
						}));
				}
			}
			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;

	struct FixedEngine {
		tier: EngineTier,
		body: &'static str,
	}

	#[async_trait]
	impl FetchEngine for FixedEngine {
		fn tier(&self) -> EngineTier {
			self.tier
		}

		async fn fetch(&self, _request: &FetchRequest) -> Result<String, EngineError> {
			Ok(self.body.to_string())
		}
	}

	fn selector(engines: Vec<FixedEngine>) -> EngineSelector {
		let mut builder = EngineSelector::builder()
			.disable_detection()
			.disable_rate_limit()
			.disable_backoff();
		for engine in engines {
			builder = builder.with_engine(Arc::new(engine));
		}
		builder.build().unwrap()
	}

	#[test]
	fn default_timeouts_follow_tier() {
		let config = EngineSelectorConfig::default();
		assert_eq!(config.attempt_timeout(EngineTier::Direct), DEFAULT_REQUEST_TIMEOUT);
		assert_eq!(config.attempt_timeout(EngineTier::Unlocker), UNLOCKER_ATTEMPT_TIMEOUT);
		assert_eq!(
			config.proxy_tiers,
			vec![EngineTier::Direct, EngineTier::Impersonate]
		);
	}

	#[test]
	fn settings_override_timeouts_and_country() {
		let settings = Settings {
			request_timeout: Duration::from_secs(12),
			proxy_country: Some("de".into()),
			..Settings::default()
		};
		let selector = EngineSelector::builder()
			.with_settings(&settings)
			.disable_detection()
			.build()
			.unwrap();
		assert_eq!(
			selector.config().attempt_timeout(EngineTier::Browser),
			Duration::from_secs(12)
		);
		assert_eq!(
			selector.config().attempt_timeout(EngineTier::Unlocker),
			UNLOCKER_ATTEMPT_TIMEOUT
		);
		assert_eq!(selector.config().proxy_country.as_deref(), Some("de"));
		assert!(selector.rate_limiter().is_some());
	}

	#[test]
	fn exhausted_message_lists_every_tier() {
		let err = FetchError::Exhausted {
			url: "https://example.com/".into(),
			attempts: vec![
				FetchAttempt::skipped(EngineTier::Browser, "browser engine is not configured".into()),
				FetchAttempt {
					tier: EngineTier::Unlocker,
					outcome: AttemptOutcome::Blocked {
						signature: "access denied".into(),
					},
					latency: Duration::from_secs(1),
					proxy: None,
					captcha_error: None,
				},
			],
		};
		let message = err.to_string();
		assert!(message.contains("browser: skipped"), "{message}");
		assert!(message.contains("unlocker: blocked (access denied)"), "{message}");
		assert_eq!(err.attempts().len(), 2);
	}

	#[tokio::test]
	async fn invalid_url_is_rejected_before_any_attempt() {
		let selector = selector(vec![]);
		let err = selector.fetch("not a url").await.unwrap_err();
		assert!(matches!(err, FetchError::InvalidUrl { .. }));
	}

	#[tokio::test]
	async fn blocked_body_escalates() {
		let selector = selector(vec![
			FixedEngine {
				tier: EngineTier::Direct,
				body: "<title>Just a moment...</title>",
			},
			FixedEngine {
				tier: EngineTier::Impersonate,
				body: "<h1>Catalogue</h1>",
			},
		]);

		let response = selector
			.fetch_with("https://shop.example/", FetchOptions::new())
			.await
			.unwrap();
		assert_eq!(response.tier, EngineTier::Impersonate);
		assert_eq!(response.content, "<h1>Catalogue</h1>");
		assert_eq!(response.protection, None);
		assert_eq!(response.attempts.len(), 2);
	}

	#[tokio::test]
	async fn cancelled_token_stops_before_first_attempt() {
		let selector = selector(vec![FixedEngine {
			tier: EngineTier::Direct,
			body: "ok",
		}]);
		let token = CancellationToken::new();
		token.cancel();

		let err = selector
			.fetch_with(
				"https://example.com/",
				FetchOptions::new().with_cancel(token),
			)
			.await
			.unwrap_err();
		match err {
			FetchError::Cancelled {
				reason, attempts, ..
			} => {
				assert_eq!(reason, CancelReason::Cancelled);
				assert!(attempts.is_empty());
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn stop_signal_honours_deadline() {
		let options = FetchOptions::new().with_deadline(Duration::from_secs(2));
		let stop = StopSignal::new(&options, Instant::now());
		let result = stop.race(sleep(Duration::from_secs(10))).await;
		assert_eq!(result, Err(CancelReason::DeadlineExceeded));
		assert_eq!(stop.check(), Err(CancelReason::DeadlineExceeded));
	}
}
