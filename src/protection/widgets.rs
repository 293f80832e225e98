//! Locate solvable captcha widgets in a blocked page.
//!
//! Checks run from most to least specific: Turnstile, hCaptcha, reCAPTCHA v2
//! markup, then script-only reCAPTCHA v3.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::external_deps::captcha::{CaptchaKind, CaptchaTask};

const DEFAULT_V3_ACTION: &str = "verify";
const DEFAULT_V3_MIN_SCORE: f32 = 0.3;

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|err| panic!("invalid widget selector `{css}`: {err:?}"))
}

static TURNSTILE: Lazy<Selector> = Lazy::new(|| selector(".cf-turnstile[data-sitekey]"));
static HCAPTCHA: Lazy<Selector> = Lazy::new(|| selector(".h-captcha[data-sitekey]"));
static RECAPTCHA: Lazy<Selector> = Lazy::new(|| selector(".g-recaptcha[data-sitekey]"));

static RECAPTCHA_EXECUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"grecaptcha\.execute\(\s*['"]([\w-]+)['"]\s*,\s*\{\s*action\s*:\s*['"]([\w/]+)['"]"#)
        .unwrap_or_else(|err| panic!("invalid recaptcha execute regex: {err}"))
});
static RECAPTCHA_RENDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"recaptcha/(?:api|enterprise)\.js\?(?:[^"'\s]*&)?render=([\w-]{20,})"#)
        .unwrap_or_else(|err| panic!("invalid recaptcha render regex: {err}"))
});

/// Build a task for the first widget found, if any.
pub fn find_captcha(html: &str, page_url: &str) -> Option<CaptchaTask> {
    let document = Html::parse_document(html);

    let site_key = |selector: &Selector| {
        document
            .select(selector)
            .next()
            .and_then(|el| el.value().attr("data-sitekey").map(|key| (el, key.trim().to_string())))
            .filter(|(_, key)| !key.is_empty())
    };

    if let Some((_, key)) = site_key(&TURNSTILE) {
        return Some(CaptchaTask::new(CaptchaKind::Turnstile, key, page_url));
    }
    if let Some((_, key)) = site_key(&HCAPTCHA) {
        return Some(CaptchaTask::new(CaptchaKind::HCaptcha, key, page_url));
    }
    if let Some((element, key)) = site_key(&RECAPTCHA) {
        let invisible = element
            .value()
            .attr("data-size")
            .is_some_and(|size| size.eq_ignore_ascii_case("invisible"));
        return Some(CaptchaTask::new(
            CaptchaKind::ReCaptchaV2 { invisible },
            key,
            page_url,
        ));
    }

    if let Some(caps) = RECAPTCHA_EXECUTE.captures(html) {
        return Some(CaptchaTask::new(
            CaptchaKind::ReCaptchaV3 {
                action: caps[2].to_string(),
                min_score: DEFAULT_V3_MIN_SCORE,
            },
            &caps[1],
            page_url,
        ));
    }
    RECAPTCHA_RENDER.captures(html).map(|caps| {
        CaptchaTask::new(
            CaptchaKind::ReCaptchaV3 {
                action: DEFAULT_V3_ACTION.to_string(),
                min_score: DEFAULT_V3_MIN_SCORE,
            },
            &caps[1],
            page_url,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://shop.example/login";

    #[test]
    fn finds_turnstile() {
        let html = r#"<form><div class="cf-turnstile" data-sitekey="0x4AAAAAAABkMYinukE8nzY"></div></form>"#;
        let task = find_captcha(html, URL).unwrap();
        assert_eq!(task.kind, CaptchaKind::Turnstile);
        assert_eq!(task.site_key, "0x4AAAAAAABkMYinukE8nzY");
        assert_eq!(task.page_url, URL);
    }

    #[test]
    fn finds_invisible_recaptcha() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6Lc_aXkUAAAAA" data-size="invisible"></div>"#;
        let task = find_captcha(html, URL).unwrap();
        assert_eq!(task.kind, CaptchaKind::ReCaptchaV2 { invisible: true });
    }

    #[test]
    fn finds_hcaptcha_before_recaptcha() {
        let html = r#"<div class="g-recaptcha" data-sitekey="g"></div><div class="h-captcha" data-sitekey="h"></div>"#;
        let task = find_captcha(html, URL).unwrap();
        assert_eq!(task.kind, CaptchaKind::HCaptcha);
        assert_eq!(task.site_key, "h");
    }

    #[test]
    fn finds_v3_from_script() {
        let html = r#"<script>grecaptcha.ready(function() {
            grecaptcha.execute('6LdKey-v3_abc', {action: 'submit'}).then(cb);
        });</script>"#;
        let task = find_captcha(html, URL).unwrap();
        assert_eq!(task.site_key, "6LdKey-v3_abc");
        assert!(matches!(task.kind, CaptchaKind::ReCaptchaV3 { ref action, .. } if action == "submit"));
    }

    #[test]
    fn finds_v3_from_render_param() {
        let html = r#"<script src="https://www.google.com/recaptcha/api.js?render=6LcRenderKey000000000000"></script>"#;
        let task = find_captcha(html, URL).unwrap();
        assert_eq!(task.site_key, "6LcRenderKey000000000000");
    }

    #[test]
    fn plain_block_page_has_no_widget() {
        assert!(find_captcha("<h1>Access denied</h1>", URL).is_none());
        assert!(find_captcha(r#"<div class="g-recaptcha"></div>"#, URL).is_none());
    }
}
