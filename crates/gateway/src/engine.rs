//! The gateway facade: binds operations, runs the pipeline, dispatches
//! upstream, and annotates version metadata.
//!
//! Everything is composed from explicit instances threaded through this
//! constructor; there is no process-wide mutable state.

use crate::auth::AuthManager;
use crate::breaker::BreakerManager;
use crate::config::{GatewayConfig, LimitAlgorithm};
use crate::dispatch::{UpstreamDispatcher, UpstreamResponse};
use crate::hooks::{
    AuthenticationHook, ErrorHandlingHook, LoggingHook, MetricsHook, RequestValidationHook,
    SecurityHeadersHook,
};
use crate::pipeline::{HookManager, Phase, PipelineExecutor, PRIORITY_LOW};
use crate::ratelimit::{
    client_ip_key, RateLimitManager, SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::registry::SpecRegistry;
use crate::stats::StatsRecorder;
use crate::versioning::{ResolvedVersion, VersionManager, VersionStrategy};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use specgate_core::context::{META_AUTH_POLICY, META_PARAM_TYPES, META_REQUIRED_PARAMS};
use specgate_core::{
    CallContext, GatewayError, RequestView, ResponseView, Result, SpecEntry, SpecSource,
};
use specgate_openapi_tools::{compile, Operation, SpecFetcher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

struct CompiledOperations {
    entry_id: String,
    fetched_at: DateTime<Utc>,
    operations: Arc<Vec<Operation>>,
}

/// The assembled request-path engine.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<SpecRegistry>,
    versions: Arc<VersionManager>,
    hooks: Arc<HookManager>,
    pipeline: PipelineExecutor,
    dispatcher: Arc<UpstreamDispatcher>,
    fetcher: SpecFetcher,
    auth: Arc<AuthManager>,
    stats: Arc<StatsRecorder>,
    breakers: Arc<BreakerManager>,
    limiters: Arc<RateLimitManager>,
    compiled: RwLock<HashMap<String, CompiledOperations>>,
}

impl Gateway {
    /// Assemble the engine and register the built-in hooks.
    ///
    /// # Errors
    ///
    /// *duplicate* if built-in hook registration collides (which would mean a
    /// broken construction, not caller input).
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        Self::with_version_strategy(config, VersionStrategy::Path)
    }

    /// Assemble the engine with an explicit version-resolution strategy.
    pub fn with_version_strategy(
        config: GatewayConfig,
        strategy: VersionStrategy,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(SpecRegistry::new());
        let versions = Arc::new(VersionManager::new(strategy));
        let auth = Arc::new(AuthManager::new());
        let stats = Arc::new(StatsRecorder::new());

        let breakers = Arc::new(BreakerManager::new(
            config.circuit_breaker.to_breaker_config(),
            config.circuit_breaker.enabled,
        ));

        let limiters = Arc::new(RateLimitManager::new(config.rate_limit.enabled));
        if config.rate_limit.enabled {
            let limit_config = config.rate_limit.to_limit_config();
            let limiter: Arc<dyn crate::ratelimit::Limiter> = match config.rate_limit.algorithm {
                LimitAlgorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(limit_config)),
                LimitAlgorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(limit_config)),
            };
            limiters.set_global_limiter(limiter, client_ip_key());
        }

        let hooks = Arc::new(HookManager::new());
        hooks.register(Arc::new(AuthenticationHook::new(Arc::clone(&auth))))?;
        hooks.register(Arc::new(RequestValidationHook::new()))?;
        hooks.register(Arc::new(LoggingHook::new(Phase::PreRequest, PRIORITY_LOW)))?;
        hooks.register(Arc::new(SecurityHeadersHook::new(config.security_headers.clone())))?;
        hooks.register(Arc::new(LoggingHook::new(Phase::PostResponse, PRIORITY_LOW)))?;
        hooks.register(Arc::new(MetricsHook::new(Arc::clone(&stats))))?;
        hooks.register(Arc::new(ErrorHandlingHook::new()))?;

        let pipeline = PipelineExecutor::new(Arc::clone(&hooks))
            .with_rate_limits(Arc::clone(&limiters))
            .with_breakers(Arc::clone(&breakers));

        let dispatcher = Arc::new(UpstreamDispatcher::new(
            config.upstream.timeout(),
            config.upstream.max_response_bytes,
        ));

        let fetcher = SpecFetcher::new(config.specs.fetch_timeout(), config.specs.max_size_bytes);

        Ok(Arc::new(Self {
            config,
            registry,
            versions,
            hooks,
            pipeline,
            dispatcher,
            fetcher,
            auth,
            stats,
            breakers,
            limiters,
            compiled: RwLock::new(HashMap::new()),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SpecRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }

    #[must_use]
    pub fn limiters(&self) -> &Arc<RateLimitManager> {
        &self.limiters
    }

    #[must_use]
    pub fn fetcher(&self) -> &SpecFetcher {
        &self.fetcher
    }

    /// Spawn the registry janitor and limiter reaper under one cancellation
    /// token.
    pub fn spawn_background_tasks(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.registry.spawn_janitor(self.config.specs.cleanup_interval(), cancel.clone()),
            self.limiters.spawn_reaper(cancel.clone()),
        ]
    }

    /// Compiled operations for a service, cached per entry fetch.
    pub fn operations(&self, service_name: &str) -> Result<Arc<Vec<Operation>>> {
        let (entry, _fresh) = self
            .registry
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;
        Ok(self.operations_for(&entry))
    }

    fn operations_for(&self, entry: &SpecEntry) -> Arc<Vec<Operation>> {
        {
            let compiled = self.compiled.read();
            if let Some(cached) = compiled.get(&entry.service_name)
                && cached.entry_id == entry.id
                && cached.fetched_at == entry.fetched_at
            {
                return Arc::clone(&cached.operations);
            }
        }

        let operations = Arc::new(compile(&entry.spec));
        tracing::debug!(
            service = %entry.service_name,
            operations = operations.len(),
            "compiled spec operations"
        );
        self.compiled.write().insert(
            entry.service_name.clone(),
            CompiledOperations {
                entry_id: entry.id.clone(),
                fetched_at: entry.fetched_at,
                operations: Arc::clone(&operations),
            },
        );
        Arc::clone(&operations)
    }

    /// MCP tool definitions for a service.
    pub fn tools(&self, service_name: &str) -> Result<Vec<rmcp::model::Tool>> {
        Ok(self.operations(service_name)?.iter().map(|op| op.tool.to_tool()).collect())
    }

    /// The per-operation executor of the dispatcher contract.
    pub fn executor(
        &self,
        service_name: &str,
        operation_id: &str,
    ) -> Result<impl Fn(CancellationToken, Map<String, Value>) -> BoxFuture<'static, Result<UpstreamResponse>>>
    {
        let (entry, _fresh) = self
            .registry
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;
        let operation = self.find_operation(&entry, operation_id)?;
        let base_url = resolve_base_url(&entry)?;
        Ok(self.dispatcher.executor(base_url, entry.headers.clone(), Arc::new(operation)))
    }

    fn find_operation(&self, entry: &SpecEntry, operation_id: &str) -> Result<Operation> {
        self.operations_for(entry)
            .iter()
            .find(|op| op.operation_id == operation_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::NotFound(format!(
                    "operation '{operation_id}' in service '{}'",
                    entry.service_name
                ))
            })
    }

    /// Run one call through the full pipeline and return the response view.
    ///
    /// Version resolution uses the constructed request view, so the header
    /// and query strategies apply here; path-strategy resolution needs the
    /// shell to consult [`Gateway::versions`] with the raw inbound path.
    ///
    /// # Errors
    ///
    /// Any taxonomy kind; on-error hooks have already run when this returns
    /// an error.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        service_name: &str,
        operation_id: &str,
        arguments: Map<String, Value>,
        headers: HashMap<String, String>,
        remote_addr: Option<String>,
    ) -> Result<ResponseView> {
        let (base_entry, _fresh) = self
            .registry
            .get(service_name)
            .ok_or_else(|| GatewayError::NotFound(format!("service '{service_name}'")))?;

        let operation = self.find_operation(&base_entry, operation_id)?;
        let arguments = bind_arguments(&operation, arguments)?;

        let mut request =
            RequestView::new(operation.method.clone(), operation.path.clone(), service_name, operation_id);
        request.headers = headers;
        request.remote_addr = remote_addr;
        request.parameters = arguments;

        // A service registered with versions resolves through the version
        // manager; the operation may live in a different entry there.
        let (entry, resolved, operation) = if self.versions.has_service(service_name) {
            let resolved: ResolvedVersion = self.versions.resolve(&request, service_name)?;
            let operation = if resolved.entry.id == base_entry.id
                && resolved.entry.fetched_at == base_entry.fetched_at
            {
                operation
            } else {
                self.find_operation(&resolved.entry, operation_id)?
            };
            (Arc::clone(&resolved.entry), Some(resolved), operation)
        } else {
            (base_entry, None, operation)
        };

        let base_url = resolve_base_url(&entry)?;
        let static_headers = entry.headers.clone();

        let mut ctx = CallContext::new(request);
        ctx.set_metadata(META_REQUIRED_PARAMS, json!(operation.required_parameter_names()));
        let param_types: HashMap<&str, &str> = operation
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p.scalar.as_str()))
            .collect();
        ctx.set_metadata(META_PARAM_TYPES, json!(param_types));
        if let Some(policy) = &entry.auth_policy {
            ctx.set_metadata(META_AUTH_POLICY, serde_json::to_value(policy).unwrap_or(Value::Null));
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let operation = Arc::new(operation);
        let upstream = move |cancel: CancellationToken, frozen: RequestView| async move {
            dispatcher
                .dispatch(&cancel, &base_url, &static_headers, &operation, &frozen.parameters)
                .await
        };

        self.pipeline.execute(cancel, &mut ctx, upstream).await?;

        let mut view = ctx
            .response
            .take()
            .ok_or_else(|| GatewayError::Internal("pipeline completed without a response".into()))?;
        if let Some(resolved) = resolved {
            resolved.annotate(&mut view);
        }
        Ok(view)
    }
}

/// Apply defaults and validate scalar types and enumerations for a binding.
fn bind_arguments(operation: &Operation, mut arguments: Map<String, Value>) -> Result<Map<String, Value>> {
    for param in &operation.parameters {
        if !arguments.contains_key(&param.name) {
            if let Some(default) = &param.default {
                arguments.insert(param.name.clone(), default.clone());
            }
            continue;
        }

        let value = &arguments[param.name.as_str()];
        if value.is_null() {
            continue;
        }
        if !param.scalar.accepts(value) {
            return Err(GatewayError::InvalidArg(format!(
                "parameter '{}' must be of type {}",
                param.name,
                param.scalar.as_str()
            )));
        }
        if !param.allowed.is_empty() && !param.allowed.contains(value) {
            return Err(GatewayError::InvalidArg(format!(
                "parameter '{}' must be one of {:?}",
                param.name, param.allowed
            )));
        }
    }
    Ok(arguments)
}

/// The upstream base URL from the spec's `servers`, resolved against the spec
/// source URL when relative.
fn resolve_base_url(entry: &SpecEntry) -> Result<String> {
    let server_url = entry
        .spec
        .servers
        .first()
        .map(|server| server.url.clone())
        .ok_or_else(|| {
            GatewayError::InvalidSpec(format!(
                "spec for '{}' declares no server URL",
                entry.service_name
            ))
        })?;

    if server_url.starts_with("http://") || server_url.starts_with("https://") {
        return Ok(server_url);
    }

    if let SpecSource::Url(spec_url) = &entry.source {
        let mut base = Url::parse(spec_url).map_err(|e| {
            GatewayError::InvalidSpec(format!("invalid spec URL '{spec_url}': {e}"))
        })?;
        base.set_fragment(None);
        let joined = base.join(&server_url).map_err(|e| {
            GatewayError::InvalidSpec(format!("invalid server URL '{server_url}': {e}"))
        })?;
        return Ok(joined.to_string());
    }

    Err(GatewayError::InvalidSpec(format!(
        "server URL '{server_url}' for '{}' must be absolute",
        entry.service_name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn entry_with_spec(raw: &str, source: &str) -> SpecEntry {
        let spec: openapiv3::OpenAPI = serde_yaml::from_str(raw).unwrap();
        SpecEntry {
            id: format!("svc:{source}"),
            service_name: "svc".to_string(),
            source: SpecSource::parse(source),
            spec: Arc::new(spec),
            fetched_at: Utc::now(),
            ttl: Duration::ZERO,
            headers: HashMap::new(),
            auth_policy: None,
        }
    }

    const SPEC_WITH_SERVER: &str = r#"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
servers:
  - url: https://api.example.com/v2
paths:
  /pets:
    get:
      operationId: listPets
      parameters:
        - name: limit
          in: query
          schema:
            type: integer
            default: 20
        - name: status
          in: query
          schema:
            type: string
            enum: [available, sold]
      responses:
        "200":
          description: ok
"#;

    #[test]
    fn base_url_comes_from_servers() {
        let entry = entry_with_spec(SPEC_WITH_SERVER, "inline");
        assert_eq!(resolve_base_url(&entry).unwrap(), "https://api.example.com/v2");
    }

    #[test]
    fn relative_server_url_resolves_against_spec_url() {
        let raw = SPEC_WITH_SERVER.replace("https://api.example.com/v2", "/v2");
        let entry = entry_with_spec(&raw, "https://petstore.example.com/api/openapi.json");
        assert_eq!(resolve_base_url(&entry).unwrap(), "https://petstore.example.com/v2");
    }

    #[test]
    fn relative_server_url_without_spec_url_is_invalid() {
        let raw = SPEC_WITH_SERVER.replace("https://api.example.com/v2", "/v2");
        let entry = entry_with_spec(&raw, "local.yaml");
        assert_eq!(
            resolve_base_url(&entry).unwrap_err().kind(),
            specgate_core::ErrorKind::InvalidSpec
        );
    }

    #[test]
    fn binding_applies_defaults_and_validates() {
        let entry = entry_with_spec(SPEC_WITH_SERVER, "inline");
        let operations = compile(&entry.spec);
        let operation = &operations[0];

        let bound = bind_arguments(operation, Map::new()).unwrap();
        assert_eq!(bound["limit"], json!(20));

        let mut args = Map::new();
        args.insert("limit".into(), json!("ten"));
        let err = bind_arguments(operation, args).unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::InvalidArg);

        let mut args = Map::new();
        args.insert("status".into(), json!("missing"));
        let err = bind_arguments(operation, args).unwrap_err();
        assert!(err.to_string().contains("status"));

        let mut args = Map::new();
        args.insert("status".into(), json!("sold"));
        bind_arguments(operation, args).unwrap();
    }

    #[tokio::test]
    async fn unknown_service_and_operation_are_not_found() {
        let gateway = Gateway::new(GatewayConfig::default()).unwrap();
        let err = gateway.operations("ghost").unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::NotFound);

        gateway.registry().add(entry_with_spec(SPEC_WITH_SERVER, "inline"));
        assert_eq!(gateway.operations("svc").unwrap().len(), 1);
        assert_eq!(gateway.tools("svc").unwrap().len(), 1);

        let err = gateway
            .call(
                &CancellationToken::new(),
                "svc",
                "nope",
                Map::new(),
                HashMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn compiled_operations_are_cached_per_fetch() {
        let gateway = Gateway::new(GatewayConfig::default()).unwrap();
        gateway.registry().add(entry_with_spec(SPEC_WITH_SERVER, "inline"));

        let first = gateway.operations("svc").unwrap();
        let second = gateway.operations("svc").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A refreshed entry invalidates the cache.
        gateway.registry().add(entry_with_spec(SPEC_WITH_SERVER, "inline"));
        let third = gateway.operations("svc").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
