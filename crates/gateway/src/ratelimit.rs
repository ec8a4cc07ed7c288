//! Per-key rate limiting.
//!
//! Two interchangeable algorithms share the `allow(key)` contract: a token
//! bucket with lazy refill and a sliding window over admission timestamps.
//! A manager routes each call to the per-service limiter, falling back to a
//! `*` global limiter; with neither registered the call is unlimited.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use specgate_core::context::META_AUTH_CONTEXT;
use specgate_core::{CallContext, RequestView};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often the idle-entry reaper sweeps.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Entries untouched for this long are evicted by the reaper.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Rate limiting configuration shared by both algorithms.
///
/// The refill rate is `requests_per_minute / window` tokens per second; with
/// the default one-minute window the field name is exact, while a different
/// window rescales the rate accordingly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Token-bucket capacity. Defaults to `requests_per_minute` when zero.
    pub burst_size: u32,
    #[serde(with = "duration_secs")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_minute: 100, burst_size: 100, window: Duration::from_secs(60) }
    }
}

impl RateLimitConfig {
    /// Apply the documented defaults to zero-valued fields.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.requests_per_minute == 0 {
            self.requests_per_minute = 100;
        }
        if self.burst_size == 0 {
            self.burst_size = self.requests_per_minute;
        }
        if self.window.is_zero() {
            self.window = Duration::from_secs(60);
        }
        self
    }

    fn tokens_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / self.window.as_secs_f64()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Time until the next call would be admitted; zero when allowed.
    pub retry_after: Duration,
}

impl Decision {
    const ALLOWED: Self = Self { allowed: true, retry_after: Duration::ZERO };

    fn denied(retry_after: Duration) -> Self {
        Self { allowed: false, retry_after }
    }
}

/// Per-key admission controller.
pub trait Limiter: Send + Sync {
    fn allow(&self, key: &str) -> Decision;
    fn reset(&self, key: &str);
    fn config(&self) -> RateLimitConfig;
    /// Drop entries idle for longer than `idle`.
    fn sweep_idle(&self, idle: Duration);
}

// --- token bucket -----------------------------------------------------------

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter: capacity `burst_size`, lazy refill on access.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config: config.normalized(), buckets: Mutex::new(HashMap::new()) }
    }

    fn allow_at(&self, key: &str, now: Instant) -> Decision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| TokenBucket {
            tokens: f64::from(self.config.burst_size),
            last_refill: now,
        });

        let rate = self.config.tokens_per_second();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * rate).min(f64::from(self.config.burst_size));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Decision::ALLOWED;
        }

        let seconds_to_wait = (1.0 - bucket.tokens) / rate;
        Decision::denied(Duration::from_secs_f64(seconds_to_wait))
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> Decision {
        self.allow_at(key, Instant::now())
    }

    fn reset(&self, key: &str) {
        self.buckets.lock().remove(key);
    }

    fn config(&self) -> RateLimitConfig {
        self.config.clone()
    }

    fn sweep_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= idle);
    }
}

// --- sliding window ---------------------------------------------------------

/// Sliding-window limiter: keeps admission timestamps and prunes on access.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config: config.normalized(), windows: Mutex::new(HashMap::new()) }
    }

    fn allow_at(&self, key: &str, now: Instant) -> Decision {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_default();

        let horizon = now.checked_sub(self.config.window);
        window.retain(|&at| horizon.is_none_or(|h| at > h));

        if window.len() < self.config.requests_per_minute as usize {
            window.push(now);
            return Decision::ALLOWED;
        }

        let retry_after = window
            .first()
            .map(|&oldest| (oldest + self.config.window).saturating_duration_since(now))
            .unwrap_or(self.config.window);
        Decision::denied(retry_after)
    }
}

impl Limiter for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> Decision {
        self.allow_at(key, Instant::now())
    }

    fn reset(&self, key: &str) {
        self.windows.lock().remove(key);
    }

    fn config(&self) -> RateLimitConfig {
        self.config.clone()
    }

    fn sweep_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.windows.lock().retain(|_, window| {
            window.last().is_some_and(|&at| now.saturating_duration_since(at) <= idle)
        });
    }
}

// --- key functions ----------------------------------------------------------

/// Pure mapping from an inbound call to a limiter key.
pub type KeyFn = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

/// Client IP: first non-empty `X-Forwarded-For` component, then `X-Real-IP`,
/// then the peer address.
#[must_use]
pub fn client_ip(request: &RequestView) -> String {
    if let Some(forwarded) = request.header("X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|part| !part.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = request.header("X-Real-IP")
        && !real_ip.is_empty()
    {
        return real_ip.to_string();
    }
    request.remote_addr.clone().unwrap_or_else(|| "unknown".to_string())
}

/// Default key function: the client IP.
#[must_use]
pub fn client_ip_key() -> KeyFn {
    Arc::new(|ctx| client_ip(ctx.request()))
}

/// Key on the authenticated user id when present, falling back to the IP.
#[must_use]
pub fn user_key() -> KeyFn {
    Arc::new(|ctx| {
        let user_id = ctx
            .metadata_value(META_AUTH_CONTEXT)
            .and_then(|auth| auth.get("userId"))
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty());
        match user_id {
            Some(id) => format!("user:{id}"),
            None => format!("ip:{}", client_ip(ctx.request())),
        }
    })
}

/// Key on (service, client IP).
#[must_use]
pub fn service_ip_key() -> KeyFn {
    Arc::new(|ctx| {
        format!("service:{}:ip:{}", ctx.request().service_name, client_ip(ctx.request()))
    })
}

// --- manager ----------------------------------------------------------------

/// Service name under which the global fallback limiter registers.
pub const GLOBAL_LIMITER: &str = "*";

struct ServiceLimiter {
    limiter: Arc<dyn Limiter>,
    key_fn: KeyFn,
}

/// Routes admission checks to per-service limiters with a global fallback.
pub struct RateLimitManager {
    limiters: RwLock<HashMap<String, ServiceLimiter>>,
    enabled: bool,
}

impl RateLimitManager {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { limiters: RwLock::new(HashMap::new()), enabled }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_service_limiter(
        &self,
        service_name: &str,
        limiter: Arc<dyn Limiter>,
        key_fn: KeyFn,
    ) {
        tracing::info!(
            service = service_name,
            requests_per_minute = limiter.config().requests_per_minute,
            "set rate limiter"
        );
        self.limiters
            .write()
            .insert(service_name.to_string(), ServiceLimiter { limiter, key_fn });
    }

    pub fn set_global_limiter(&self, limiter: Arc<dyn Limiter>, key_fn: KeyFn) {
        self.set_service_limiter(GLOBAL_LIMITER, limiter, key_fn);
    }

    /// Admission check for one call. The per-service limiter overrides the
    /// global one; with neither present the call is admitted.
    #[must_use]
    pub fn check(&self, ctx: &CallContext) -> Decision {
        if !self.enabled {
            return Decision::ALLOWED;
        }

        let limiters = self.limiters.read();
        let Some(service_limiter) = limiters
            .get(&ctx.request().service_name)
            .or_else(|| limiters.get(GLOBAL_LIMITER))
        else {
            return Decision::ALLOWED;
        };

        let key = (service_limiter.key_fn)(ctx);
        let decision = service_limiter.limiter.allow(&key);
        if !decision.allowed {
            tracing::debug!(
                service = %ctx.request().service_name,
                key = %key,
                retry_after_secs = decision.retry_after.as_secs_f64(),
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Reset one key across every registered limiter.
    pub fn reset_key(&self, key: &str) {
        for service_limiter in self.limiters.read().values() {
            service_limiter.limiter.reset(key);
        }
    }

    /// Per-service config summary for the control surface.
    #[must_use]
    pub fn stats(&self) -> HashMap<String, RateLimitConfig> {
        self.limiters
            .read()
            .iter()
            .map(|(service, sl)| (service.clone(), sl.limiter.config()))
            .collect()
    }

    /// Spawn the idle-entry reaper sweeping all registered limiters.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for service_limiter in manager.limiters.read().values() {
                            service_limiter.limiter.sweep_idle(IDLE_TIMEOUT);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket_config(rpm: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            burst_size: burst,
            window: Duration::from_secs(60),
        }
    }

    #[test]
    fn token_bucket_burst_then_refill() {
        // 60/min over a 60s window = 1 token/second.
        let limiter = TokenBucketLimiter::new(bucket_config(60, 10));
        let start = Instant::now();

        for _ in 0..10 {
            assert!(limiter.allow_at("k", start).allowed);
        }

        let denied = limiter.allow_at("k", start);
        assert!(!denied.allowed);
        let retry = denied.retry_after.as_secs_f64();
        assert!((0.9..=1.1).contains(&retry), "retryAfter was {retry}s");

        // Two seconds later: one call admitted, roughly one token left over.
        let later = start + Duration::from_secs(2);
        assert!(limiter.allow_at("k", later).allowed);
        assert!(limiter.allow_at("k", later).allowed);
        assert!(!limiter.allow_at("k", later).allowed);
    }

    #[test]
    fn token_bucket_never_exceeds_burst_plus_refill() {
        let limiter = TokenBucketLimiter::new(bucket_config(60, 5));
        let start = Instant::now();

        let mut admitted = 0;
        for i in 0..60 {
            // Ten calls per second for six seconds.
            let at = start + Duration::from_millis(i * 100);
            if limiter.allow_at("k", at).allowed {
                admitted += 1;
            }
        }
        // burst (5) + 6s * 1/s, with float slack.
        assert!(admitted <= 11, "admitted {admitted}");
    }

    #[test]
    fn token_bucket_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(bucket_config(60, 1));
        let now = Instant::now();
        assert!(limiter.allow_at("a", now).allowed);
        assert!(!limiter.allow_at("a", now).allowed);
        assert!(limiter.allow_at("b", now).allowed);

        limiter.reset("a");
        assert!(limiter.allow_at("a", now).allowed);
    }

    #[test]
    fn sliding_window_caps_any_window() {
        let config = RateLimitConfig {
            requests_per_minute: 3,
            burst_size: 3,
            window: Duration::from_secs(10),
        };
        let limiter = SlidingWindowLimiter::new(config);
        let start = Instant::now();

        assert!(limiter.allow_at("k", start).allowed);
        assert!(limiter.allow_at("k", start + Duration::from_secs(1)).allowed);
        assert!(limiter.allow_at("k", start + Duration::from_secs(2)).allowed);

        let denied = limiter.allow_at("k", start + Duration::from_secs(3));
        assert!(!denied.allowed);
        // Oldest admission at t=0, window 10s: retry in ~7s.
        assert_eq!(denied.retry_after, Duration::from_secs(7));

        // Once the oldest admission leaves the window, room opens up.
        assert!(limiter.allow_at("k", start + Duration::from_secs(11)).allowed);
    }

    #[test]
    fn sweep_evicts_idle_entries_only() {
        let limiter = TokenBucketLimiter::new(bucket_config(60, 10));
        limiter.allow("idle");
        limiter.sweep_idle(Duration::ZERO);
        // The evicted bucket is recreated full on next use.
        let decision = limiter.allow("idle");
        assert!(decision.allowed);

        let windows = SlidingWindowLimiter::new(bucket_config(3, 3));
        windows.allow("busy");
        windows.sweep_idle(Duration::from_secs(600));
        assert!(windows.windows.lock().contains_key("busy"));
    }

    #[test]
    fn client_ip_prefers_first_forwarded_component() {
        let mut request = RequestView::new("GET", "/", "svc", "op");
        request
            .headers
            .insert("X-Forwarded-For".into(), " 203.0.113.9, 10.0.0.1, 10.0.0.2".into());
        request.headers.insert("X-Real-IP".into(), "198.51.100.7".into());
        request.remote_addr = Some("192.0.2.1:9999".into());
        assert_eq!(client_ip(&request), "203.0.113.9");

        request.headers.remove("X-Forwarded-For");
        assert_eq!(client_ip(&request), "198.51.100.7");

        request.headers.remove("X-Real-IP");
        assert_eq!(client_ip(&request), "192.0.2.1:9999");
    }

    #[test]
    fn user_key_falls_back_to_ip() {
        let mut request = RequestView::new("GET", "/", "svc", "op");
        request.remote_addr = Some("192.0.2.1".into());
        let mut ctx = CallContext::new(request);

        let key_fn = user_key();
        assert_eq!(key_fn(&ctx), "ip:192.0.2.1");

        ctx.set_metadata(META_AUTH_CONTEXT, json!({ "userId": "alice" }));
        assert_eq!(key_fn(&ctx), "user:alice");
    }

    #[test]
    fn manager_prefers_service_limiter_over_global() {
        let manager = RateLimitManager::new(true);
        manager.set_global_limiter(
            Arc::new(TokenBucketLimiter::new(bucket_config(60, 100))),
            client_ip_key(),
        );
        manager.set_service_limiter(
            "strict",
            Arc::new(TokenBucketLimiter::new(bucket_config(60, 1))),
            client_ip_key(),
        );

        let mut request = RequestView::new("GET", "/", "strict", "op");
        request.remote_addr = Some("192.0.2.1".into());
        let ctx = CallContext::new(request);

        assert!(manager.check(&ctx).allowed);
        let denied = manager.check(&ctx);
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);

        // Another service falls through to the roomy global limiter.
        let mut request = RequestView::new("GET", "/", "other", "op");
        request.remote_addr = Some("192.0.2.1".into());
        let ctx = CallContext::new(request);
        assert!(manager.check(&ctx).allowed);
    }

    #[test]
    fn absent_limiters_mean_unlimited() {
        let manager = RateLimitManager::new(true);
        let ctx = CallContext::new(RequestView::new("GET", "/", "svc", "op"));
        for _ in 0..1000 {
            assert!(manager.check(&ctx).allowed);
        }

        let disabled = RateLimitManager::new(false);
        assert!(disabled.check(&ctx).allowed);
    }
}
