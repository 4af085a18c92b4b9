use std::collections::VecDeque;

use crawlcorpus_core::SiteStatus;

const WINDOW: usize = 50;
const BLOCKED_429_403_THRESHOLD: u32 = 10;
const THROTTLED_429_403_THRESHOLD: u32 = 3;
const CAPTCHA_THRESHOLD: u32 = 2;
const LOGIN_REDIRECT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct FetchRecord {
    pub status_code: u16,
    pub is_captcha: bool,
    pub is_login_redirect: bool,
    pub is_duplicate: bool,
    pub quality_passed: bool,
}

/// Rolling window over the last 50 completed fetches (§4.4.4), from which
/// the job's derived `site_status` is recomputed after each fetch.
#[derive(Default)]
pub struct BlockingDetector {
    window: VecDeque<FetchRecord>,
}

impl BlockingDetector {
    pub fn new() -> Self {
        Self { window: VecDeque::with_capacity(WINDOW) }
    }

    pub fn record(&mut self, rec: FetchRecord) {
        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(rec);
    }

    pub fn dup_ratio(&self) -> f64 {
        let passed = self.window.iter().filter(|r| r.quality_passed).count();
        if passed == 0 {
            return 0.0;
        }
        let dups = self.window.iter().filter(|r| r.is_duplicate).count();
        dups as f64 / passed as f64
    }

    pub fn site_status(&self) -> SiteStatus {
        let block_429_403 = self
            .window
            .iter()
            .filter(|r| r.status_code == 429 || r.status_code == 403)
            .count() as u32;
        let captcha = self.window.iter().filter(|r| r.is_captcha).count() as u32;
        let login_redirect = self.window.iter().filter(|r| r.is_login_redirect).count() as u32;

        if block_429_403 > BLOCKED_429_403_THRESHOLD || captcha > CAPTCHA_THRESHOLD {
            SiteStatus::Blocked
        } else if block_429_403 > THROTTLED_429_403_THRESHOLD {
            SiteStatus::Throttled
        } else if login_redirect > LOGIN_REDIRECT_THRESHOLD {
            SiteStatus::LoginRequired
        } else {
            SiteStatus::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(status: u16) -> FetchRecord {
        FetchRecord {
            status_code: status,
            is_captcha: false,
            is_login_redirect: false,
            is_duplicate: false,
            quality_passed: true,
        }
    }

    #[test]
    fn normal_with_no_blocking_signals() {
        let mut d = BlockingDetector::new();
        for _ in 0..20 {
            d.record(rec(200));
        }
        assert_eq!(d.site_status(), SiteStatus::Normal);
    }

    #[test]
    fn blocked_once_429_count_exceeds_threshold() {
        let mut d = BlockingDetector::new();
        for _ in 0..11 {
            d.record(rec(429));
        }
        assert_eq!(d.site_status(), SiteStatus::Blocked);
    }

    #[test]
    fn throttled_in_the_middle_band() {
        let mut d = BlockingDetector::new();
        for _ in 0..5 {
            d.record(rec(403));
        }
        for _ in 0..5 {
            d.record(rec(200));
        }
        assert_eq!(d.site_status(), SiteStatus::Throttled);
    }
}
