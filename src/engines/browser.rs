//! Headless Chromium engine.
//!
//! One browser process is launched lazily and shared; every fetch gets its
//! own page, and a semaphore bounds how many pages are open at once. A page
//! and its permit travel together in a [`PageGuard`], so a fetch dropped
//! mid-flight by a timeout or cancellation still closes its tab. A
//! launch failure (no Chromium on the host) is reported as a configuration
//! error so the ladder skips this tier instead of counting a failed attempt.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::ScreenshotParams;
use futures_util::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use super::headers::DEFAULT_USER_AGENTS;
use super::{EngineError, EngineTier, FetchEngine, FetchRequest};
use crate::external_deps::captcha::{CaptchaKind, CaptchaSolution};

pub const BLOCKED_RESOURCE_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "svg", "woff", "woff2", "ttf"];

const LAUNCH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
];

const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined, configurable: true });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'], configurable: true });
"#;

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Time kept back from the caller's timeout so the page can be read and
/// closed before the caller gives up on the fetch.
const CLOSE_MARGIN: Duration = Duration::from_secs(2);
const MIN_NAVIGATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BrowserEngineConfig {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub max_pages: usize,
    pub block_resources: bool,
    pub viewport: (u32, u32),
    pub user_agent: String,
    /// Best-effort wait for this selector after navigation.
    pub wait_for: Option<String>,
    pub wait_for_timeout: Duration,
    /// Extra time for client-side scripts after the page is ready.
    pub settle_delay: Duration,
}

impl Default for BrowserEngineConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            max_pages: 4,
            block_resources: true,
            viewport: (1920, 1080),
            user_agent: DEFAULT_USER_AGENTS[0].to_string(),
            wait_for: None,
            wait_for_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
        }
    }
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// An open tab plus the permit that admitted it. Closing, explicitly or on
/// drop, releases the permit only after the target is gone.
pub struct PageGuard {
    page: Page,
    permit: Option<OwnedSemaphorePermit>,
}

impl PageGuard {
    fn new(page: Page, permit: OwnedSemaphorePermit) -> Self {
        Self {
            page,
            permit: Some(permit),
        }
    }

    pub async fn close(mut self) {
        let permit = self.permit.take();
        close_page(self.page.clone()).await;
        drop(permit);
    }
}

impl Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // `close` already ran.
        let Some(permit) = self.permit.take() else {
            return;
        };
        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::debug!("closing abandoned browser page");
                runtime.spawn(async move {
                    close_page(page).await;
                    drop(permit);
                });
            }
            Err(_) => log::warn!("browser page dropped outside a runtime, target left open"),
        }
    }
}

pub struct BrowserEngine {
    config: BrowserEngineConfig,
    session: Mutex<Option<BrowserSession>>,
    pages: Arc<Semaphore>,
}

impl BrowserEngine {
    pub fn new(config: BrowserEngineConfig) -> Self {
        let permits = config.max_pages.max(1);
        Self {
            config,
            session: Mutex::new(None),
            pages: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn config(&self) -> &BrowserEngineConfig {
        &self.config
    }

    async fn launch(&self) -> Result<BrowserSession, EngineError> {
        let (width, height) = self.config.viewport;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                ..Default::default()
            });
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.config.executable {
            builder = builder.chrome_executable(path);
        }
        for arg in LAUNCH_ARGS {
            builder = builder.arg(*arg);
        }

        let config = builder.build().map_err(|reason| EngineError::NotConfigured {
            tier: EngineTier::Browser,
            reason,
        })?;
        let (browser, mut handler) =
            Browser::launch(config)
                .await
                .map_err(|err| EngineError::NotConfigured {
                    tier: EngineTier::Browser,
                    reason: format!("chromium launch failed: {err}"),
                })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::debug!("chromium handler: {err}");
                }
            }
        });
        log::info!("chromium launched ({}x{})", width, height);
        Ok(BrowserSession { browser, handler })
    }

    /// Wait for a page slot, then open a prepared tab in it.
    async fn open_page(&self) -> Result<PageGuard, EngineError> {
        let permit = self.pages.clone().acquire_owned().await.map_err(|_| closed())?;
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.launch().await?);
        }
        let Some(session) = guard.as_ref() else {
            return Err(EngineError::Browser("browser session unavailable".into()));
        };

        let page = session.browser.new_page("about:blank").await.map_err(browser_err)?;
        drop(guard);
        let page = PageGuard::new(page, permit);

        page.set_user_agent(self.config.user_agent.clone())
            .await
            .map_err(browser_err)?;
        page.evaluate_on_new_document(STEALTH_SCRIPT)
            .await
            .map_err(browser_err)?;

        if self.config.block_resources {
            let patterns: Vec<String> = BLOCKED_RESOURCE_EXTENSIONS
                .iter()
                .map(|ext| format!("*.{ext}"))
                .collect();
            page.execute(EnableParams::default()).await.map_err(browser_err)?;
            page.execute(SetBlockedUrLsParams::new(patterns))
                .await
                .map_err(browser_err)?;
        }
        Ok(page)
    }

    /// Navigation budget inside a fetch limited to `limit`: room is left for
    /// the settle delay and for closing the page.
    pub fn navigation_budget(&self, limit: Duration) -> Duration {
        limit
            .saturating_sub(CLOSE_MARGIN + self.config.settle_delay)
            .max(MIN_NAVIGATION)
    }

    /// Tabs currently open in the shared browser. Zero when not launched.
    pub async fn open_pages(&self) -> usize {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => session.browser.pages().await.map(|pages| pages.len()).unwrap_or(0),
            None => 0,
        }
    }

    async fn navigate(&self, page: &Page, url: &str, limit: Duration) -> Result<(), EngineError> {
        let navigation = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match timeout(limit, navigation).await {
            Ok(result) => result.map_err(browser_err),
            Err(_) => Err(EngineError::Timeout(limit)),
        }
    }

    /// Poll for `selector` until it appears or `limit` passes. Never fails.
    async fn wait_for_selector(&self, page: &Page, selector: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if page.find_element(selector).await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                log::debug!("selector {selector} did not appear within {limit:?}");
                return false;
            }
            sleep(SELECTOR_POLL).await;
        }
    }

    async fn inject_captcha(&self, page: &Page, solution: &CaptchaSolution) -> Result<(), EngineError> {
        let script = captcha_injection_script(&solution.kind, &solution.token);
        page.evaluate(script).await.map_err(browser_err)?;
        // A submitted form navigates; a callback-only widget does not.
        let _ = timeout(self.config.wait_for_timeout, page.wait_for_navigation()).await;
        log::debug!("injected {} token", solution.kind);
        Ok(())
    }

    async fn render(&self, page: &Page, request: &FetchRequest) -> Result<String, EngineError> {
        self.navigate(page, request.url.as_str(), self.navigation_budget(request.timeout))
            .await?;

        if let Some(solution) = &request.captcha {
            self.inject_captcha(page, solution).await?;
        }
        if let Some(selector) = &self.config.wait_for {
            self.wait_for_selector(page, selector, self.config.wait_for_timeout)
                .await;
        }
        sleep(self.config.settle_delay).await;
        page.content().await.map_err(browser_err)
    }

    /// Load `url`, scroll to the bottom `scrolls` times with `delay` between,
    /// and return the resulting document. Useful for lazy-loaded listings.
    pub async fn scroll_and_fetch(
        &self,
        request: &FetchRequest,
        scrolls: u32,
        delay: Duration,
    ) -> Result<String, EngineError> {
        let page = self.open_page().await?;
        let result = async {
            self.navigate(&page, request.url.as_str(), self.navigation_budget(request.timeout))
                .await?;
            for _ in 0..scrolls {
                page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                    .await
                    .map_err(browser_err)?;
                sleep(delay).await;
            }
            page.content().await.map_err(browser_err)
        }
        .await;
        page.close().await;
        result
    }

    /// PNG screenshot of `url`.
    pub async fn screenshot(&self, request: &FetchRequest, full_page: bool) -> Result<Vec<u8>, EngineError> {
        let page = self.open_page().await?;
        let result = async {
            self.navigate(&page, request.url.as_str(), self.navigation_budget(request.timeout))
                .await?;
            sleep(self.config.settle_delay).await;
            page.screenshot(ScreenshotParams::builder().full_page(full_page).build())
                .await
                .map_err(browser_err)
        }
        .await;
        page.close().await;
        result
    }

    /// Shut the browser down. The next fetch relaunches it.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            if let Err(err) = session.browser.close().await {
                log::warn!("chromium close failed: {err}");
            }
            let _ = session.browser.wait().await;
            session.handler.abort();
        }
    }
}

impl Default for BrowserEngine {
    fn default() -> Self {
        Self::new(BrowserEngineConfig::default())
    }
}

#[async_trait]
impl FetchEngine for BrowserEngine {
    fn tier(&self) -> EngineTier {
        EngineTier::Browser
    }

    fn accepts_captcha_tokens(&self) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<String, EngineError> {
        let page = self.open_page().await?;
        log::debug!("browser GET {}", request.url);
        let result = self.render(&page, request).await;
        page.close().await;
        result
    }
}

async fn close_page(page: Page) {
    if let Err(err) = page.close().await {
        log::debug!("page close failed: {err}");
    }
}

fn browser_err(err: chromiumoxide::error::CdpError) -> EngineError {
    EngineError::Browser(err.to_string())
}

fn closed() -> EngineError {
    EngineError::Browser("page pool closed".into())
}

/// Script that writes `token` into the widget's response field(s) and hands
/// it to the page: the widget callback when declared, the enclosing form
/// otherwise.
pub fn captcha_injection_script(kind: &CaptchaKind, token: &str) -> String {
    let token = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".into());
    let field = kind.response_field();
    let widget = match kind {
        CaptchaKind::ReCaptchaV2 { .. } | CaptchaKind::ReCaptchaV3 { .. } => ".g-recaptcha",
        CaptchaKind::HCaptcha => ".h-captcha",
        CaptchaKind::Turnstile => ".cf-turnstile",
    };
    format!(
        r#"(() => {{
  const token = {token};
  const widget = document.querySelector('{widget}');
  let fields = Array.from(document.querySelectorAll('[name="{field}"], #{field}'));
  if (fields.length === 0) {{
    const field = document.createElement('textarea');
    field.name = '{field}';
    field.id = '{field}';
    field.style.display = 'none';
    (widget || document.body).appendChild(field);
    fields = [field];
  }}
  fields.forEach((f) => {{ f.value = token; f.innerHTML = token; }});
  const callback = widget && widget.getAttribute('data-callback');
  if (callback && typeof window[callback] === 'function') {{
    window[callback](token);
    return 'callback';
  }}
  const form = (widget && widget.closest('form')) || fields[0].closest('form');
  if (form) {{
    form.submit();
    return 'submitted';
  }}
  return 'injected';
}})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let engine = BrowserEngine::default();
        assert_eq!(engine.tier(), EngineTier::Browser);
        assert!(engine.accepts_captcha_tokens());
        assert_eq!(engine.config().viewport, (1920, 1080));
        assert_eq!(engine.config().wait_for_timeout, Duration::from_secs(5));
        assert_eq!(engine.config().max_pages, 4);
    }

    #[test]
    fn injection_targets_the_right_field() {
        let script = captcha_injection_script(&CaptchaKind::HCaptcha, "tok\"en");
        assert!(script.contains(r#"[name="h-captcha-response"]"#));
        assert!(script.contains(".h-captcha"));
        assert!(script.contains(r#"const token = "tok\"en";"#));

        let turnstile = captcha_injection_script(&CaptchaKind::Turnstile, "t");
        assert!(turnstile.contains("cf-turnstile-response"));
    }

    #[test]
    fn navigation_leaves_room_to_close_the_page() {
        let engine = BrowserEngine::default();
        assert_eq!(
            engine.navigation_budget(Duration::from_secs(30)),
            Duration::from_secs(27)
        );
        assert!(engine.navigation_budget(Duration::from_secs(30)) < Duration::from_secs(30));
        assert_eq!(engine.navigation_budget(Duration::from_secs(2)), MIN_NAVIGATION);
    }

    #[tokio::test]
    #[ignore = "requires a local Chromium install"]
    async fn abandoned_fetch_closes_its_tab() {
        let engine = BrowserEngine::new(BrowserEngineConfig {
            max_pages: 1,
            ..Default::default()
        });
        let request = FetchRequest::new(url::Url::parse("https://example.com").unwrap())
            .with_timeout(Duration::from_secs(30));

        engine.fetch(&request).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        let baseline = engine.open_pages().await;

        for _ in 0..3 {
            let cut_short =
                tokio::time::timeout(Duration::from_millis(300), engine.fetch(&request)).await;
            assert!(cut_short.is_err());
        }

        // The only slot frees up once each dropped page has been closed.
        let html = tokio::time::timeout(Duration::from_secs(30), engine.fetch(&request))
            .await
            .unwrap()
            .unwrap();
        assert!(html.contains("Example Domain"));
        sleep(Duration::from_millis(500)).await;
        assert!(engine.open_pages().await <= baseline);
        engine.close().await;
    }

    #[tokio::test]
    #[ignore = "requires a local Chromium install"]
    async fn renders_a_page() {
        let engine = BrowserEngine::new(BrowserEngineConfig {
            settle_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let request = FetchRequest::new(url::Url::parse("https://example.com").unwrap())
            .with_timeout(Duration::from_secs(30));
        let html = engine.fetch(&request).await.unwrap();
        assert!(html.contains("Example Domain"));
        engine.close().await;
    }
}
