//! The control surface consumed by admin HTTP and MCP adapters.

use crate::breaker::BreakerStats;
use crate::engine::Gateway;
use crate::ratelimit::RateLimitConfig;
use crate::registry::RegistryStats;
use crate::versioning::VersionedSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specgate_core::{
    AuthPolicy, AuthType, GatewayError, Result, RouteInfo, ServiceStats, SpecEntry, SpecSnapshot,
    Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Route listing returned by `inspect_route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteListing {
    pub routes: Vec<RouteInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_policy: Option<AuthPolicy>,
}

/// Global counters returned by `get_stats` without a service filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStats {
    pub registry: RegistryStats,
    pub services: Vec<ServiceStats>,
    pub breakers: Vec<BreakerStats>,
    pub rate_limiters: HashMap<String, RateLimitConfig>,
}

/// Administrative operations over the engine's state.
#[derive(Clone)]
pub struct ControlSurface {
    gateway: Arc<Gateway>,
}

impl ControlSurface {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// All registered specs.
    #[must_use]
    pub fn list_specs(&self) -> Vec<SpecSnapshot> {
        let mut snapshots: Vec<SpecSnapshot> =
            self.gateway.registry().list().iter().map(|entry| entry.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        snapshots
    }

    /// Fetch and register a new service.
    ///
    /// # Errors
    ///
    /// *duplicate* when the service name is taken, plus anything the fetcher
    /// can fail with. Fetch failures also surface as `spec.error` events.
    pub async fn add_spec(
        &self,
        source: &str,
        service_name: &str,
        ttl: Option<Duration>,
        headers: HashMap<String, String>,
    ) -> Result<SpecSnapshot> {
        if self.gateway.registry().get(service_name).is_some() {
            return Err(GatewayError::Duplicate(format!(
                "service '{service_name}' is already registered"
            )));
        }

        let ttl = ttl.unwrap_or_else(|| self.gateway.config().specs.default_ttl());
        let entry = match self.gateway.fetcher().fetch(source, service_name, &headers, ttl).await {
            Ok(entry) => entry,
            Err(err) => {
                self.gateway.registry().emit_error(service_name, err.to_string());
                return Err(err);
            }
        };

        let snapshot = entry.snapshot();
        self.register(entry);
        Ok(snapshot)
    }

    /// Re-fetch an existing service from its recorded source, preserving its
    /// auth policy.
    ///
    /// # Errors
    ///
    /// *not-found* for unknown services; fetch failures surface as
    /// `spec.error` events and are returned.
    pub async fn refresh_spec(&self, service_name: &str) -> Result<SpecSnapshot> {
        let (existing, _fresh) = self
            .gateway
            .registry()
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        let source = existing.source.to_string();
        let fetched = self
            .gateway
            .fetcher()
            .fetch(&source, service_name, &existing.headers, existing.ttl)
            .await;

        let mut entry = match fetched {
            Ok(entry) => entry,
            Err(err) => {
                self.gateway.registry().emit_error(service_name, err.to_string());
                return Err(err);
            }
        };
        entry.auth_policy = existing.auth_policy.clone();

        let snapshot = entry.snapshot();
        self.register(entry);
        Ok(snapshot)
    }

    /// Remove a service from the registry and version manager.
    ///
    /// # Errors
    ///
    /// *not-found* when the service is unknown.
    pub fn remove_spec(&self, service_name: &str) -> Result<()> {
        if !self.gateway.registry().remove(service_name) {
            return Err(GatewayError::NotFound(format!("service '{service_name}'")));
        }
        self.gateway.versions().remove_service(service_name);
        Ok(())
    }

    /// The routes a service exposes, with its auth policy if one is attached.
    ///
    /// # Errors
    ///
    /// *not-found* when the service is unknown.
    pub fn inspect_route(&self, service_name: &str) -> Result<RouteListing> {
        let (entry, _fresh) = self
            .gateway
            .registry()
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        let operations = self.gateway.operations(service_name)?;
        Ok(RouteListing {
            routes: specgate_openapi_tools::compiler::routes(service_name, &operations),
            auth_policy: entry.auth_policy.clone(),
        })
    }

    /// Global counters, or the per-service view when a name is given.
    ///
    /// # Errors
    ///
    /// *not-found* when the named service is unknown.
    pub fn get_stats(&self, service_name: Option<&str>) -> Result<Value> {
        match service_name {
            None => {
                let stats = ControlStats {
                    registry: self.gateway.registry().stats(),
                    services: self.gateway.stats().all(),
                    breakers: self.gateway.breakers().all_stats(),
                    rate_limiters: self.gateway.limiters().stats(),
                };
                serde_json::to_value(stats)
                    .map_err(|e| GatewayError::Internal(format!("failed to serialize stats: {e}")))
            }
            Some(service_name) => {
                let (entry, _fresh) = self
                    .gateway
                    .registry()
                    .get(service_name)
                    .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

                let mut stats =
                    self.gateway.stats().service(service_name).unwrap_or_else(|| ServiceStats {
                        service_name: service_name.to_string(),
                        ..ServiceStats::default()
                    });
                stats.spec_fetched_at = Some(entry.fetched_at);
                stats.spec_url = entry.source.to_string();
                stats.route_count = self.gateway.operations(service_name)?.len();

                serde_json::to_value(stats)
                    .map_err(|e| GatewayError::Internal(format!("failed to serialize stats: {e}")))
            }
        }
    }

    /// Attach an auth policy to a service and register its provider.
    ///
    /// # Errors
    ///
    /// *not-found* for unknown services, *invalid-arg* for unknown policy
    /// types or invalid provider configuration.
    pub fn enable_auth_policy(
        &self,
        service_name: &str,
        auth_type: &str,
        config: Value,
        required: bool,
        scopes: Vec<String>,
    ) -> Result<AuthPolicy> {
        let auth_type = match auth_type {
            "basic" => AuthType::Basic,
            "bearer" => AuthType::Bearer,
            "oauth2" => AuthType::OAuth2,
            other => {
                return Err(GatewayError::InvalidArg(format!(
                    "unknown auth type '{other}' (expected basic, bearer, or oauth2)"
                )));
            }
        };

        let (entry, _fresh) = self
            .gateway
            .registry()
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        let policy = AuthPolicy { auth_type, config, required, scopes };
        self.gateway.auth().register_for_policy(&policy)?;

        let mut updated: SpecEntry = (*entry).clone();
        updated.auth_policy = Some(policy.clone());
        self.register(updated);

        tracing::info!(service = service_name, auth_type = %auth_type, "enabled auth policy");
        Ok(policy)
    }

    /// Detach a service's auth policy.
    ///
    /// # Errors
    ///
    /// *not-found* when the service is unknown.
    pub fn disable_auth_policy(&self, service_name: &str) -> Result<()> {
        let (entry, _fresh) = self
            .gateway
            .registry()
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        let mut updated: SpecEntry = (*entry).clone();
        updated.auth_policy = None;
        self.register(updated);

        tracing::info!(service = service_name, "disabled auth policy");
        Ok(())
    }

    /// Insert an entry into the registry and mirror it in the version
    /// manager using the spec's declared `info.version`.
    fn register(&self, entry: SpecEntry) {
        let service_name = entry.service_name.clone();
        let declared_version = entry.spec.info.version.parse::<Version>();

        self.gateway.registry().add(entry);

        // The registry owns the entry now; mirror the stored Arc.
        if let Some((stored, _fresh)) = self.gateway.registry().get(&service_name) {
            match declared_version {
                Ok(version) => {
                    self.gateway.versions().add_version(
                        &service_name,
                        VersionedSpec { version, entry: stored, deprecated: false },
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        service = %service_name,
                        declared = %stored.spec.info.version,
                        "spec declares an unparseable version, skipping version registration"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use serde_json::json;
    use specgate_core::ErrorKind;

    const PETSTORE: &str = r#"
openapi: 3.0.0
info:
  title: Petstore
  version: 1.0.0
servers:
  - url: https://api.example.com
paths:
  /pets:
    get:
      operationId: listPets
      summary: List all pets
      tags: [pets]
      responses:
        "200":
          description: ok
"#;

    fn surface_with_spec() -> (ControlSurface, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("petstore.yaml");
        std::fs::write(&path, PETSTORE).unwrap();

        let gateway = Gateway::new(GatewayConfig::default()).unwrap();
        let surface = ControlSurface::new(gateway);
        (surface, dir)
    }

    async fn add_petstore(surface: &ControlSurface, dir: &tempfile::TempDir) -> SpecSnapshot {
        let path = dir.path().join("petstore.yaml");
        surface
            .add_spec(path.to_str().unwrap(), "petstore", None, HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_list_inspect_remove_round_trip() {
        let (surface, dir) = surface_with_spec();
        let snapshot = add_petstore(&surface, &dir).await;
        assert_eq!(snapshot.service_name, "petstore");
        assert_eq!(snapshot.title, "Petstore");
        assert_eq!(snapshot.path_count, 1);

        let listed = surface.list_specs();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], snapshot);

        let listing = surface.inspect_route("petstore").unwrap();
        assert_eq!(listing.routes.len(), 1);
        assert_eq!(listing.routes[0].operation_id.as_deref(), Some("listPets"));
        assert_eq!(listing.routes[0].tags, vec!["pets"]);
        assert!(listing.auth_policy.is_none());

        surface.remove_spec("petstore").unwrap();
        assert!(surface.list_specs().is_empty());
        assert_eq!(surface.remove_spec("petstore").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let (surface, dir) = surface_with_spec();
        add_petstore(&surface, &dir).await;

        let path = dir.path().join("petstore.yaml");
        let err = surface
            .add_spec(path.to_str().unwrap(), "petstore", None, HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn refresh_preserves_auth_policy_and_emits_update() {
        let (surface, dir) = surface_with_spec();
        let mut events = surface.gateway.registry().take_events().unwrap();
        add_petstore(&surface, &dir).await;

        surface
            .enable_auth_policy(
                "petstore",
                "basic",
                json!({ "users": { "admin": "pw" } }),
                true,
                vec![],
            )
            .unwrap();

        let refreshed = surface.refresh_spec("petstore").await.unwrap();
        assert_eq!(refreshed.service_name, "petstore");

        let listing = surface.inspect_route("petstore").unwrap();
        assert_eq!(listing.auth_policy.unwrap().auth_type, AuthType::Basic);

        // added, updated (policy), updated (refresh)
        assert_eq!(events.recv().await.unwrap().kind, specgate_core::SpecEventKind::Added);
        assert_eq!(events.recv().await.unwrap().kind, specgate_core::SpecEventKind::Updated);
        assert_eq!(events.recv().await.unwrap().kind, specgate_core::SpecEventKind::Updated);
    }

    #[tokio::test]
    async fn refresh_failure_emits_error_event() {
        let (surface, dir) = surface_with_spec();
        add_petstore(&surface, &dir).await;
        let mut events = surface.gateway.registry().take_events().unwrap();

        std::fs::write(dir.path().join("petstore.yaml"), "not: [valid").unwrap();
        let err = surface.refresh_spec("petstore").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSpec);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, specgate_core::SpecEventKind::Error);
        assert!(event.error.is_some());
    }

    #[tokio::test]
    async fn auth_policy_type_validation() {
        let (surface, dir) = surface_with_spec();
        add_petstore(&surface, &dir).await;

        let err = surface
            .enable_auth_policy("petstore", "apikey", json!({}), true, vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);

        let err = surface
            .enable_auth_policy("ghost", "basic", json!({}), true, vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = surface
            .enable_auth_policy("petstore", "basic", json!({}), true, vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArg);

        surface
            .enable_auth_policy(
                "petstore",
                "basic",
                json!({ "users": { "a": "b" } }),
                true,
                vec![],
            )
            .unwrap();
        surface.disable_auth_policy("petstore").unwrap();
        assert!(surface.inspect_route("petstore").unwrap().auth_policy.is_none());
    }

    #[tokio::test]
    async fn stats_shapes() {
        let (surface, dir) = surface_with_spec();
        add_petstore(&surface, &dir).await;

        let global = surface.get_stats(None).unwrap();
        assert_eq!(global["registry"]["totalSpecs"], 1);
        assert_eq!(global["registry"]["services"][0], "petstore");

        let per_service = surface.get_stats(Some("petstore")).unwrap();
        assert_eq!(per_service["serviceName"], "petstore");
        assert_eq!(per_service["routeCount"], 1);

        assert_eq!(surface.get_stats(Some("ghost")).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn versions_are_mirrored_from_spec_info() {
        let (surface, dir) = surface_with_spec();
        add_petstore(&surface, &dir).await;

        let versions = surface.gateway.versions().list_versions("petstore");
        assert_eq!(versions, vec!["1.0.0".parse::<Version>().unwrap()]);
    }
}
