//! Gateway configuration with per-section defaults.
//!
//! Loading (files, flags, env) belongs to the surrounding shell; the core
//! only defines the deserializable shape and its defaults.

use crate::breaker::BreakerConfig;
use crate::ratelimit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub upstream: UpstreamSettings,
    pub circuit_breaker: BreakerSettings,
    pub rate_limit: RateLimitSettings,
    pub specs: SpecSettings,
    /// Overrides overlaid on the security-headers hook defaults.
    pub security_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    pub timeout_secs: u64,
    pub max_response_bytes: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self { timeout_secs: 30, max_response_bytes: 10 * 1024 * 1024 }
    }
}

impl UpstreamSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub max_failures: u32,
    pub reset_timeout_secs: u64,
    pub success_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            reset_timeout_secs: 60,
            success_threshold: 1,
            timeout_secs: 30,
        }
    }
}

impl BreakerSettings {
    #[must_use]
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.max_failures,
            reset_timeout: Duration::from_secs(self.reset_timeout_secs),
            success_threshold: self.success_threshold,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_minute: u32,
    /// Zero falls back to `requests_per_minute`.
    pub burst_size: u32,
    pub window_secs: u64,
    pub algorithm: LimitAlgorithm,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 100,
            burst_size: 0,
            window_secs: 60,
            algorithm: LimitAlgorithm::TokenBucket,
        }
    }
}

impl RateLimitSettings {
    #[must_use]
    pub fn to_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.requests_per_minute,
            burst_size: self.burst_size,
            window: Duration::from_secs(self.window_secs),
        }
        .normalized()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpecSettings {
    /// Default TTL applied when a registration does not specify one.
    pub default_ttl_secs: u64,
    pub max_size_bytes: usize,
    pub fetch_timeout_secs: u64,
    /// How often the registry janitor sweeps.
    pub cleanup_interval_secs: u64,
}

impl Default for SpecSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_size_bytes: 10 * 1024 * 1024,
            fetch_timeout_secs: 30,
            cleanup_interval_secs: 60,
        }
    }
}

impl SpecSettings {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GatewayConfig::default();
        assert_eq!(config.upstream.timeout(), Duration::from_secs(30));
        assert!(config.circuit_breaker.enabled);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.specs.default_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "rateLimit": { "enabled": true, "requestsPerMinute": 10, "algorithm": "sliding-window" },
                "circuitBreaker": { "maxFailures": 3 }
            }"#,
        )
        .unwrap();

        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.algorithm, LimitAlgorithm::SlidingWindow);
        assert_eq!(config.rate_limit.to_limit_config().burst_size, 10);
        assert_eq!(config.circuit_breaker.max_failures, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.circuit_breaker.timeout_secs, 30);
        assert_eq!(config.specs.max_size_bytes, 10 * 1024 * 1024);
    }
}
