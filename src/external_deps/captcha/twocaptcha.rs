use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;

use super::{
    CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaResult, CaptchaSolution,
    CaptchaTask, TaskStatus,
};

pub const DEFAULT_TWOCAPTCHA_URL: &str = "https://2captcha.com";

/// Reply envelope used by both `in.php` and `res.php` in JSON mode.
#[derive(Debug, Deserialize)]
struct ServiceReply {
    status: i64,
    #[serde(default)]
    request: Value,
}

impl ServiceReply {
    fn text(&self) -> String {
        match &self.request {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn is_not_ready(&self) -> bool {
        let text = self.text().to_ascii_lowercase();
        text == "capcha_not_ready" || text == "captcha_not_ready" || text == "not ready"
    }
}

/// Adapter for the 2Captcha submit/poll API.
#[derive(Debug, Clone)]
pub struct TwoCaptchaProvider {
    api_key: String,
    base_url: String,
    config: CaptchaConfig,
    client: reqwest::Client,
}

impl TwoCaptchaProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CaptchaError> {
        Self::with_config(api_key, CaptchaConfig::default())
    }

    pub fn with_config(api_key: impl Into<String>, config: CaptchaConfig) -> Result<Self, CaptchaError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CaptchaError::Configuration("2captcha api key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            api_key,
            base_url: DEFAULT_TWOCAPTCHA_URL.to_string(),
            config,
            client,
        })
    }

    /// Point the adapter at a compatible service (or a local mock).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_max_polls(mut self, polls: u32) -> Self {
        self.config.max_polls = polls.max(1);
        self
    }

    fn submission_form(&self, task: &CaptchaTask) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("key", self.api_key.clone()),
            ("pageurl", task.page_url.clone()),
            ("json", "1".to_string()),
        ];
        match &task.kind {
            CaptchaKind::ReCaptchaV2 { invisible } => {
                form.push(("method", "userrecaptcha".into()));
                form.push(("googlekey", task.site_key.clone()));
                form.push(("invisible", if *invisible { "1" } else { "0" }.into()));
            }
            CaptchaKind::ReCaptchaV3 { action, min_score } => {
                form.push(("method", "userrecaptcha".into()));
                form.push(("googlekey", task.site_key.clone()));
                form.push(("version", "v3".into()));
                form.push(("action", action.clone()));
                form.push(("min_score", min_score.to_string()));
            }
            CaptchaKind::HCaptcha => {
                form.push(("method", "hcaptcha".into()));
                form.push(("sitekey", task.site_key.clone()));
            }
            CaptchaKind::Turnstile => {
                form.push(("method", "turnstile".into()));
                form.push(("sitekey", task.site_key.clone()));
            }
        }
        form
    }

    async fn query(&self, params: &[(&str, &str)]) -> Result<ServiceReply, CaptchaError> {
        let response = self
            .client
            .get(format!("{}/res.php", self.base_url))
            .query(params)
            .send()
            .await?;
        parse_reply(response).await
    }

    /// Account balance in the service's currency.
    pub async fn get_balance(&self) -> Result<f64, CaptchaError> {
        let reply = self
            .query(&[("key", self.api_key.as_str()), ("action", "getbalance"), ("json", "1")])
            .await?;
        if reply.status != 1 {
            return Err(CaptchaError::Service(reply.text()));
        }
        let text = reply.text();
        text.parse::<f64>()
            .map_err(|_| CaptchaError::InvalidResponse(format!("balance `{text}`")))
    }
}

async fn parse_reply(response: reqwest::Response) -> Result<ServiceReply, CaptchaError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|_| CaptchaError::InvalidResponse(body))
}

#[async_trait]
impl CaptchaProvider for TwoCaptchaProvider {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    async fn submit(&self, task: &mut CaptchaTask) -> Result<String, CaptchaError> {
        let response = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&self.submission_form(task))
            .send()
            .await?;
        let reply = parse_reply(response).await?;

        if reply.status != 1 {
            task.status = TaskStatus::Failed;
            return Err(CaptchaError::Rejected(reply.text()));
        }

        let id = reply.text();
        log::debug!("2captcha accepted {} task {}", task.kind, id);
        task.id = Some(id.clone());
        task.status = TaskStatus::Pending;
        Ok(id)
    }

    async fn poll(&self, task: &mut CaptchaTask) -> CaptchaResult {
        let id = task.id.clone().ok_or(CaptchaError::NotSubmitted)?;

        for attempt in 1..=self.config.max_polls {
            sleep(self.config.poll_interval).await;
            let reply = self
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", id.as_str()),
                    ("json", "1"),
                ])
                .await?;

            if reply.status == 1 {
                let token = reply.text();
                log::info!("2captcha task {} solved after {} polls", id, attempt);
                task.status = TaskStatus::Ready;
                task.token = Some(token.clone());
                return Ok(CaptchaSolution {
                    kind: task.kind.clone(),
                    token,
                    task_id: id,
                });
            }

            if !reply.is_not_ready() {
                task.status = TaskStatus::Failed;
                return Err(CaptchaError::Service(reply.text()));
            }
        }

        task.status = TaskStatus::Failed;
        Err(CaptchaError::Timeout {
            polls: self.config.max_polls,
        })
    }
}
