use once_cell::sync::Lazy;
use regex::RegexSet;

/// Patterns used by the blocking detector's `captcha` counter (§4.4.4).
static CAPTCHA_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        "g-recaptcha",
        "recaptcha",
        "grecaptcha",
        "h-captcha",
        "hcaptcha",
        "cf-turnstile",
        "turnstile",
        "verify you are human",
        "prove you're human",
    ])
    .expect("static captcha pattern set")
});

pub fn looks_like_captcha(body: &str) -> bool {
    let lower = body.to_lowercase();
    CAPTCHA_PATTERNS.is_match(&lower)
}

/// True if the final response URL looks like a login/signin redirect
/// (§4.4.4 `login_redirect` counter).
pub fn looks_like_login_redirect(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.contains("/login") || lower.contains("/signin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_recaptcha() {
        assert!(looks_like_captcha("<div class=\"g-recaptcha\"></div>"));
    }

    #[test]
    fn plain_page_is_not_captcha() {
        assert!(!looks_like_captcha("<html><body>hello world</body></html>"));
    }
}
