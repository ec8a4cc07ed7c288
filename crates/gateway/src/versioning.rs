//! Multi-version spec resolution.
//!
//! One logical service may be registered under several versions; the manager
//! extracts the intended version from an inbound request using one of four
//! syntactic strategies and falls back to the highest backward-compatible
//! version when the exact one is absent.

use parking_lot::RwLock;
use regex::Regex;
use specgate_core::{GatewayError, RequestView, ResponseView, Result, SpecEntry, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

/// Pattern: `/v{major}[.{minor}]/…`
static PATH_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/v(\d+)(?:\.(\d+))?(?:/|$)").expect("static regex"));

/// Pattern: `application/vnd.{service}.v{major}[.{minor}]` inside a media type.
static MEDIA_TYPE_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"application/vnd\.[^.]+\.v(\d+)(?:\.(\d+))?").expect("static regex"));

/// How the intended version is extracted from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionStrategy {
    /// `/v1/users`, `/v2.1/users`
    Path,
    /// `Accept: application/vnd.api.v1+json`
    AcceptHeader,
    /// `Content-Type: application/vnd.api.v1+json`
    ContentType,
    /// `?version=1.2` or `?v=1.2`
    Query,
}

impl VersionStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::AcceptHeader => "header",
            Self::ContentType => "content",
            Self::Query => "query",
        }
    }
}

/// One versioned registration of a service.
#[derive(Debug, Clone)]
pub struct VersionedSpec {
    pub version: Version,
    pub entry: Arc<SpecEntry>,
    pub deprecated: bool,
}

/// The outcome of version resolution for one request.
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub entry: Arc<SpecEntry>,
    pub version: Version,
    pub strategy: VersionStrategy,
    pub deprecated: bool,
}

impl ResolvedVersion {
    /// Write version metadata back into the response.
    pub fn annotate(&self, response: &mut ResponseView) {
        response.headers.insert("API-Version".to_string(), self.version.to_string());
        response
            .headers
            .insert("API-Version-Strategy".to_string(), self.strategy.as_str().to_string());
        if self.deprecated {
            response.headers.insert("API-Deprecated".to_string(), "true".to_string());
        }
    }
}

/// Manages the version → spec mapping per service.
pub struct VersionManager {
    specs: RwLock<HashMap<String, BTreeMap<Version, VersionedSpec>>>,
    strategy: VersionStrategy,
}

impl VersionManager {
    #[must_use]
    pub fn new(strategy: VersionStrategy) -> Self {
        Self { specs: RwLock::new(HashMap::new()), strategy }
    }

    #[must_use]
    pub fn strategy(&self) -> VersionStrategy {
        self.strategy
    }

    /// Register a versioned spec, replacing any previous registration of the
    /// same version.
    pub fn add_version(&self, service_name: &str, versioned: VersionedSpec) {
        tracing::info!(
            service = service_name,
            version = %versioned.version,
            strategy = self.strategy.as_str(),
            "added versioned spec"
        );
        self.specs
            .write()
            .entry(service_name.to_string())
            .or_default()
            .insert(versioned.version.clone(), versioned);
    }

    /// Drop every version of a service. Returns whether the service existed.
    pub fn remove_service(&self, service_name: &str) -> bool {
        self.specs.write().remove(service_name).is_some()
    }

    #[must_use]
    pub fn has_service(&self, service_name: &str) -> bool {
        self.specs.read().contains_key(service_name)
    }

    /// Exact version lookup.
    pub fn get_version(&self, service_name: &str, version: &Version) -> Result<VersionedSpec> {
        let specs = self.specs.read();
        let versions = specs
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;
        versions.get(version).cloned().ok_or_else(|| {
            GatewayError::NotFound(format!("version '{version}' of service '{service_name}'"))
        })
    }

    /// Highest registered version of a service.
    pub fn latest(&self, service_name: &str) -> Result<VersionedSpec> {
        let specs = self.specs.read();
        let versions = specs
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;
        versions
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))
    }

    /// Exact match first, otherwise the highest version with the same major
    /// and a minor at least as high as requested.
    pub fn compatible(&self, service_name: &str, requested: &Version) -> Result<VersionedSpec> {
        let specs = self.specs.read();
        let versions = specs
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        if let Some(exact) = versions.get(requested) {
            return Ok(exact.clone());
        }

        versions
            .values()
            .filter(|v| v.version.is_compatible_with(requested))
            .next_back()
            .cloned()
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "no compatible version for '{requested}' of service '{service_name}'"
                ))
            })
    }

    #[must_use]
    pub fn list_versions(&self, service_name: &str) -> Vec<Version> {
        self.specs
            .read()
            .get(service_name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Flag a version as deprecated; resolution then adds a deprecation
    /// header to responses.
    pub fn set_deprecated(&self, service_name: &str, version: &Version, deprecated: bool) -> Result<()> {
        let mut specs = self.specs.write();
        let versioned = specs
            .get_mut(service_name)
            .and_then(|versions| versions.get_mut(version))
            .ok_or_else(|| {
                GatewayError::NotFound(format!("version '{version}' of service '{service_name}'"))
            })?;
        versioned.deprecated = deprecated;
        Ok(())
    }

    /// Resolve the spec serving this request. A request carrying no version
    /// information resolves to the highest version.
    pub fn resolve(&self, request: &RequestView, service_name: &str) -> Result<ResolvedVersion> {
        let requested = self.requested_version(request);

        let versioned = match &requested {
            Some(version) => self.compatible(service_name, version)?,
            None => self.latest(service_name)?,
        };

        tracing::debug!(
            service = service_name,
            requested = requested.as_ref().map(ToString::to_string).unwrap_or_default(),
            resolved = %versioned.version,
            strategy = self.strategy.as_str(),
            "resolved spec version"
        );

        Ok(ResolvedVersion {
            entry: versioned.entry,
            version: versioned.version,
            strategy: self.strategy,
            deprecated: versioned.deprecated,
        })
    }

    fn requested_version(&self, request: &RequestView) -> Option<Version> {
        match self.strategy {
            VersionStrategy::Path => capture_version(&PATH_VERSION, &request.path),
            VersionStrategy::AcceptHeader => {
                capture_version(&MEDIA_TYPE_VERSION, request.header("Accept")?)
            }
            VersionStrategy::ContentType => {
                capture_version(&MEDIA_TYPE_VERSION, request.header("Content-Type")?)
            }
            VersionStrategy::Query => {
                let raw = request.query_param("version").or_else(|| request.query_param("v"))?;
                raw.parse().ok()
            }
        }
    }
}

fn capture_version(regex: &Regex, haystack: &str) -> Option<Version> {
    let captures = regex.captures(haystack)?;
    let major = captures.get(1)?.as_str().parse().ok()?;
    let minor = captures.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    Some(Version::new(major, minor, 0))
}
