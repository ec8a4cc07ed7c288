//! Data model shared between the registry, compiler, and control surface.

use chrono::{DateTime, Utc};
use openapiv3::OpenAPI;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Authentication scheme attached to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Basic,
    Bearer,
    OAuth2,
    ApiKey,
}

impl AuthType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Bearer => "bearer",
            Self::OAuth2 => "oauth2",
            Self::ApiKey => "apikey",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication requirements for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    /// Provider-specific configuration (users, secrets, introspection URL…).
    #[serde(default)]
    pub config: serde_json::Value,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Where a spec document came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecSource {
    Url(String),
    File(PathBuf),
}

impl SpecSource {
    /// Classify a raw location string: `http(s)://` means URL, anything else
    /// is treated as a local path.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Self::Url(raw.to_string())
        } else {
            Self::File(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for SpecSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => f.write_str(&path.display().to_string()),
        }
    }
}

/// One registered OpenAPI document together with its metadata.
///
/// Entries are immutable after creation; the registry replaces whole entries
/// rather than mutating them in place.
#[derive(Debug, Clone)]
pub struct SpecEntry {
    /// Deterministic id: `serviceName ":" source`.
    pub id: String,
    pub service_name: String,
    pub source: SpecSource,
    pub spec: Arc<OpenAPI>,
    pub fetched_at: DateTime<Utc>,
    /// Zero means the entry never expires.
    pub ttl: Duration,
    /// Static headers forwarded on every upstream call for this service.
    pub headers: HashMap<String, String>,
    pub auth_policy: Option<AuthPolicy>,
}

impl SpecEntry {
    /// Age since the spec was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or_default()
    }

    /// Whether the TTL has elapsed. Entries with a zero TTL never expire.
    #[must_use]
    pub fn expired(&self) -> bool {
        !self.ttl.is_zero() && self.age() > self.ttl
    }

    /// How long the entry has been past its TTL, if at all.
    #[must_use]
    pub fn expired_for(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            return None;
        }
        self.age().checked_sub(self.ttl).filter(|d| !d.is_zero())
    }

    /// Wire-level snapshot of this entry.
    #[must_use]
    pub fn snapshot(&self) -> SpecSnapshot {
        SpecSnapshot {
            id: self.id.clone(),
            service_name: self.service_name.clone(),
            url: self.source.to_string(),
            fetched_at: self.fetched_at,
            ttl_secs: self.ttl.as_secs(),
            title: self.spec.info.title.clone(),
            version: self.spec.info.version.clone(),
            path_count: self.spec.paths.paths.len(),
        }
    }
}

/// Serializable summary of a [`SpecEntry`], used by the control surface and
/// as the payload of spec change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecSnapshot {
    pub id: String,
    pub service_name: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub title: String,
    pub version: String,
    pub path_count: usize,
}

/// One proxied route, as reported by the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub path: String,
    pub method: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Usage counters for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub service_name: String,
    pub request_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spec_url: String,
    #[serde(default)]
    pub route_count: usize,
}
