//! Rate limiting: local sliding-window admission and server rate limit headers.
//!
//! [`RateLimiter`] is a reject-immediately limiter. Each operation key keeps the
//! timestamps of its admitted requests within a trailing window; a request is admitted
//! only while fewer than `max_requests` timestamps remain in the window. There is no
//! queueing: a denied caller gets a retry-after hint and must try the whole call later.
//!
//! [`RateLimitInfo`] is the remote side of the same concern: the hints a server sends
//! back in `Retry-After` and `X-RateLimit-*` headers when it throttles us.

use http::HeaderMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Maximum request count allowed within a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    /// How many requests may be admitted within one window.
    pub max_requests: usize,
    /// The trailing window length.
    pub window: Duration,
}

impl RateLimitRule {
    /// Creates a rule admitting `max_requests` per `window`.
    pub const fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Creates a rule admitting `max_requests` per minute.
    pub const fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self::per_minute(10)
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    admitted: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&self, rule: &RateLimitRule) -> bool {
        self.admitted.len() < rule.max_requests
    }

    fn retry_after(&self, now: Instant, rule: &RateLimitRule) -> Duration {
        if self.has_room(rule) {
            return Duration::ZERO;
        }
        // The window frees a slot once the entry at the head of the over-budget run expires.
        let blocking = self.admitted.len() - rule.max_requests;
        match self.admitted.get(blocking) {
            Some(&oldest) => (oldest + rule.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

/// Per-operation sliding-window rate limiter.
///
/// State for each key is created lazily on first use and guarded by its own lock, so
/// keys never contend with each other.
///
/// # Examples
///
/// ```
/// use callward::rate_limit::{RateLimiter, RateLimitRule};
///
/// let limiter = RateLimiter::new(RateLimitRule::per_minute(2));
///
/// assert!(limiter.try_acquire("gemini_text").is_ok());
/// assert!(limiter.try_acquire("gemini_text").is_ok());
/// let retry_after = limiter.try_acquire("gemini_text").unwrap_err();
/// assert!(retry_after.as_secs() > 0);
///
/// // Other keys are unaffected.
/// assert!(limiter.admit("gemini_segmentation"));
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    default_rule: RateLimitRule,
    rules: HashMap<String, RateLimitRule>,
    windows: Mutex<HashMap<String, Arc<Mutex<RateWindow>>>>,
}

impl RateLimiter {
    /// Creates a limiter applying `default_rule` to every key.
    pub fn new(default_rule: RateLimitRule) -> Self {
        Self::with_rules(default_rule, HashMap::new())
    }

    /// Creates a limiter with per-key rules and a fallback for unlisted keys.
    pub fn with_rules(default_rule: RateLimitRule, rules: HashMap<String, RateLimitRule>) -> Self {
        Self {
            default_rule,
            rules,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the rule that applies to `key`.
    pub fn rule(&self, key: &str) -> RateLimitRule {
        self.rules.get(key).copied().unwrap_or(self.default_rule)
    }

    fn window(&self, key: &str) -> Arc<Mutex<RateWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.entry(key.to_string()).or_default().clone()
    }

    /// Returns `true` if a request on `key` would be admitted now.
    ///
    /// This does not count the request; pair it with [`record_request`](Self::record_request),
    /// or use [`try_acquire`](Self::try_acquire) to do both atomically.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Counts a request on `key` against its window.
    pub fn record_request(&self, key: &str) {
        self.record_request_at(key, Instant::now())
    }

    /// Returns how long until `key` has room again, or zero if it has room now.
    pub fn retry_after(&self, key: &str) -> Duration {
        self.retry_after_at(key, Instant::now())
    }

    /// Admits and records a request on `key` under a single lock.
    ///
    /// # Errors
    ///
    /// Returns the retry-after duration if the window is full.
    pub fn try_acquire(&self, key: &str) -> std::result::Result<(), Duration> {
        self.try_acquire_at(key, Instant::now())
    }

    /// Returns the number of requests currently counted in `key`'s window.
    pub fn in_window(&self, key: &str) -> usize {
        let rule = self.rule(key);
        let window = self.window(key);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.prune(Instant::now(), rule.window);
        window.admitted.len()
    }

    /// Clears the window for `key`.
    pub fn reset(&self, key: &str) {
        let window = self.window(key);
        window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admitted
            .clear();
        tracing::debug!(operation = key, "Rate limit window reset");
    }

    /// Clears every window.
    pub fn reset_all(&self) {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn admit_at(&self, key: &str, now: Instant) -> bool {
        let rule = self.rule(key);
        let window = self.window(key);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.prune(now, rule.window);
        window.has_room(&rule)
    }

    fn record_request_at(&self, key: &str, now: Instant) {
        let window = self.window(key);
        window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admitted
            .push_back(now);
    }

    fn retry_after_at(&self, key: &str, now: Instant) -> Duration {
        let rule = self.rule(key);
        let window = self.window(key);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.prune(now, rule.window);
        window.retry_after(now, &rule)
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> std::result::Result<(), Duration> {
        let rule = self.rule(key);
        let window = self.window(key);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        window.prune(now, rule.window);
        if window.has_room(&rule) {
            window.admitted.push_back(now);
            Ok(())
        } else {
            let retry_after = window.retry_after(now, &rule);
            tracing::debug!(
                operation = key,
                in_window = window.admitted.len(),
                max_requests = rule.max_requests,
                retry_after_ms = retry_after.as_millis(),
                "Rate limit admission denied"
            );
            Err(retry_after)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitRule::default())
    }
}

/// Information extracted from server rate limit headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// When the rate limit resets (from X-RateLimit-Reset or RateLimit-Reset headers).
    pub reset_at: Option<SystemTime>,

    /// How long to wait before retrying (from Retry-After header).
    pub retry_after: Option<Duration>,

    /// Number of requests remaining in the current window.
    pub remaining: Option<u64>,
}

impl RateLimitInfo {
    /// Extracts rate limit information from HTTP response headers.
    ///
    /// Parses `Retry-After` (seconds or HTTP date), `X-RateLimit-Reset` and
    /// `RateLimit-Reset` (Unix timestamps) and `X-RateLimit-Remaining`.
    ///
    /// # Examples
    ///
    /// ```
    /// use callward::rate_limit::RateLimitInfo;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("retry-after", "60".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers);
    /// assert!(info.is_rate_limited());
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            reset_at: parse_rate_limit_reset(headers),
            retry_after: parse_retry_after(headers),
            remaining: parse_rate_limit_remaining(headers),
        }
    }

    /// Returns the recommended delay before retrying, capped by `max_wait`.
    ///
    /// Prefers `retry_after`, otherwise derives the delay from `reset_at`.
    pub fn delay(&self, max_wait: Duration) -> Option<Duration> {
        if let Some(retry_after) = self.retry_after {
            return Some(retry_after.min(max_wait));
        }

        if let Some(reset_at) = self.reset_at {
            if let Ok(until_reset) = reset_at.duration_since(SystemTime::now()) {
                return Some(until_reset.min(max_wait));
            }
        }

        None
    }

    /// Returns `true` if the headers indicate an active limit.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some() || self.remaining == Some(0)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    date_time.duration_since(SystemTime::now()).ok()
}

fn parse_rate_limit_reset(headers: &HeaderMap) -> Option<SystemTime> {
    ["x-ratelimit-reset", "ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok()?.trim().parse::<u64>().ok())
        .map(|timestamp| UNIX_EPOCH + Duration::from_secs(timestamp))
        .next()
}

fn parse_rate_limit_remaining(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-ratelimit-remaining")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use proptest::prelude::*;

    #[test]
    fn test_admits_up_to_max_then_denies() {
        let limiter = RateLimiter::new(RateLimitRule::per_minute(3));
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.try_acquire_at("k", start + Duration::from_secs(i)).is_ok());
        }
        let retry_after = limiter
            .try_acquire_at("k", start + Duration::from_secs(10))
            .unwrap_err();
        // Oldest entry (t=0) leaves the window at t=60.
        assert_eq!(retry_after, Duration::from_secs(50));
        assert_eq!(limiter.in_window("k"), 3);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(RateLimitRule::per_minute(1));
        let start = Instant::now();

        assert!(limiter.try_acquire_at("k", start).is_ok());
        assert!(!limiter.admit_at("k", start + Duration::from_secs(59)));
        assert!(limiter.admit_at("k", start + Duration::from_secs(60)));
        assert_eq!(
            limiter.retry_after_at("k", start + Duration::from_secs(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_admit_does_not_record() {
        let limiter = RateLimiter::new(RateLimitRule::per_minute(1));
        let now = Instant::now();
        assert!(limiter.admit_at("k", now));
        assert!(limiter.admit_at("k", now));
        limiter.record_request_at("k", now);
        assert!(!limiter.admit_at("k", now));
    }

    #[test]
    fn test_keys_are_independent_and_rules_apply_per_key() {
        let mut rules = HashMap::new();
        rules.insert("gemini_segmentation".to_string(), RateLimitRule::per_minute(1));
        let limiter = RateLimiter::with_rules(RateLimitRule::per_minute(5), rules);

        assert!(limiter.try_acquire("gemini_segmentation").is_ok());
        assert!(limiter.try_acquire("gemini_segmentation").is_err());
        for _ in 0..5 {
            assert!(limiter.try_acquire("gemini_text").is_ok());
        }
        assert!(limiter.try_acquire("gemini_text").is_err());
    }

    #[test]
    fn test_reset_clears_window() {
        let limiter = RateLimiter::new(RateLimitRule::per_minute(1));
        limiter.record_request("k");
        assert!(!limiter.admit("k"));
        limiter.reset("k");
        assert!(limiter.admit("k"));
    }

    #[test]
    fn test_concurrent_acquire_never_overshoots() {
        let limiter = Arc::new(RateLimiter::new(RateLimitRule::per_minute(25)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20).filter(|_| limiter.try_acquire("k").is_ok()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 25);
        assert_eq!(limiter.in_window("k"), 25);
    }

    proptest! {
        #[test]
        fn admitted_requests_never_exceed_max_in_any_window(
            max_requests in 1usize..8,
            window_ms in 100u64..5_000,
            gaps in proptest::collection::vec(0u64..2_000, 1..120),
        ) {
            let window = Duration::from_millis(window_ms);
            let limiter = RateLimiter::new(RateLimitRule::new(max_requests, window));
            let start = Instant::now();
            let mut now = start;
            let mut admitted: Vec<Instant> = Vec::new();

            for gap in gaps {
                now += Duration::from_millis(gap);
                if limiter.try_acquire_at("k", now).is_ok() {
                    admitted.push(now);
                } else {
                    prop_assert!(limiter.retry_after_at("k", now) > Duration::ZERO);
                }
                // Every trailing window ending at an admission holds at most max_requests.
                for &end in &admitted {
                    let count = admitted
                        .iter()
                        .filter(|&&t| t <= end && end.saturating_duration_since(t) < window)
                        .count();
                    prop_assert!(count <= max_requests);
                }
            }
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("60"));

        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_rate_limit_reset_and_remaining() {
        let mut headers = HeaderMap::new();
        let future_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 120;
        headers.insert(
            "ratelimit-reset",
            HeaderValue::from_str(&future_timestamp.to_string()).unwrap(),
        );
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));

        let info = RateLimitInfo::from_headers(&headers);
        assert!(info.reset_at.is_some());
        assert_eq!(info.remaining, Some(0));
        assert!(info.is_rate_limited());
        let delay = info.delay(Duration::from_secs(300)).unwrap();
        assert!(delay > Duration::from_secs(100) && delay <= Duration::from_secs(120));
    }

    #[test]
    fn test_rate_limit_delay_capped_by_max_wait() {
        let info = RateLimitInfo {
            reset_at: None,
            retry_after: Some(Duration::from_secs(600)),
            remaining: Some(0),
        };

        assert_eq!(
            info.delay(Duration::from_secs(300)),
            Some(Duration::from_secs(300))
        );
    }
}
