//! Settings and configuration module
//!
//! Reads the process environment into a typed [`Settings`] value that the
//! selector builder, the captcha provider and the unlocker engine consume.
//! Every lookup goes through a caller-supplied function so tests never touch
//! the real environment.

use std::time::Duration;

use thiserror::Error;

use crate::engines::unlocker::{DEFAULT_UNLOCKER_HOST, DEFAULT_UNLOCKER_PORT, UnlockerCredentials};
use crate::modules::rate_limit::{DEFAULT_BURST_LIMIT, DEFAULT_REQUESTS_PER_MINUTE, RateLimitConfig};

pub const DEFAULT_MAX_CONCURRENCY: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while validating configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("requests_per_minute must be positive, got {0}")]
    InvalidRate(f64),
    #[error("burst_limit must be at least 1")]
    InvalidBurst,
    #[error("invalid proxy `{0}`")]
    InvalidProxy(String),
}

/// Environment-derived settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bright_data_username: Option<String>,
    pub bright_data_password: Option<String>,
    pub bright_data_host: String,
    pub bright_data_port: u16,
    pub twocaptcha_api_key: Option<String>,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub requests_per_minute: f64,
    pub burst_limit: u32,
    pub proxy_country: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bright_data_username: None,
            bright_data_password: None,
            bright_data_host: DEFAULT_UNLOCKER_HOST.to_string(),
            bright_data_port: DEFAULT_UNLOCKER_PORT,
            twocaptcha_api_key: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst_limit: DEFAULT_BURST_LIMIT,
            proxy_country: None,
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = Self::default();
        let settings = Self {
            bright_data_username: text("BRIGHT_DATA_USERNAME"),
            bright_data_password: text("BRIGHT_DATA_PASSWORD"),
            bright_data_host: text("BRIGHT_DATA_HOST").unwrap_or(defaults.bright_data_host),
            bright_data_port: parse_or("BRIGHT_DATA_PORT", text("BRIGHT_DATA_PORT"), defaults.bright_data_port)?,
            twocaptcha_api_key: text("TWOCAPTCHA_API_KEY"),
            max_concurrency: parse_or("MAX_CONCURRENCY", text("MAX_CONCURRENCY"), defaults.max_concurrency)?,
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT",
                text("REQUEST_TIMEOUT"),
                defaults.request_timeout.as_secs(),
            )?),
            requests_per_minute: parse_or(
                "REQUESTS_PER_MINUTE",
                text("REQUESTS_PER_MINUTE"),
                defaults.requests_per_minute,
            )?,
            burst_limit: parse_or("BURST_LIMIT", text("BURST_LIMIT"), defaults.burst_limit)?,
            proxy_country: text("PROXY_COUNTRY").map(|country| country.to_ascii_lowercase()),
        };

        if settings.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENCY".into(),
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        settings.rate_limit().validate()?;
        Ok(settings)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.requests_per_minute,
            burst_limit: self.burst_limit,
        }
    }

    /// Unlocker credentials, present only when both halves are set.
    pub fn unlocker_credentials(&self) -> Option<UnlockerCredentials> {
        let username = self.bright_data_username.clone()?;
        let password = self.bright_data_password.clone()?;
        Some(
            UnlockerCredentials::new(username, password)
                .with_endpoint(self.bright_data_host.clone(), self.bright_data_port),
        )
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
            reason: err.to_string(),
        }),
    }
}
