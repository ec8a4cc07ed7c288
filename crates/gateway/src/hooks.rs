//! Built-in hooks.
//!
//! The core ships logging, request validation, transform, security headers,
//! metrics, error shaping, and authentication hooks; callers register their
//! own alongside these through the [`crate::pipeline::HookManager`].

use crate::auth::AuthManager;
use crate::pipeline::{Hook, Phase, META_ERROR_PAYLOAD, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM};
use crate::stats::StatsRecorder;
use async_trait::async_trait;
use serde_json::Value;
use specgate_core::context::{META_AUTH_CONTEXT, META_AUTH_POLICY, META_PARAM_TYPES, META_REQUIRED_PARAMS};
use specgate_core::{AuthPolicy, CallContext, GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records request and response information with elapsed time.
pub struct LoggingHook {
    phase: Phase,
    priority: i32,
}

impl LoggingHook {
    #[must_use]
    pub fn new(phase: Phase, priority: i32) -> Self {
        Self { phase, priority }
    }
}

#[async_trait]
impl Hook for LoggingHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        let request = ctx.request();
        match &ctx.response {
            Some(response) => {
                tracing::info!(
                    service = %request.service_name,
                    operation = %request.operation_id,
                    method = %request.method,
                    path = %request.path,
                    status = response.status,
                    elapsed_ms = response.elapsed.as_millis() as u64,
                    upstream = %response.upstream_url,
                    "request completed"
                );
            }
            None => {
                tracing::info!(
                    service = %request.service_name,
                    operation = %request.operation_id,
                    method = %request.method,
                    path = %request.path,
                    params = request.parameters.len(),
                    "processing request"
                );
            }
        }
        Ok(())
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        match self.phase {
            Phase::PreRequest => "logging",
            Phase::PostResponse => "logging-response",
            Phase::OnError => "logging-error",
        }
    }
}

/// Checks required-parameter presence and scalar types against the metadata
/// the engine plants when binding an operation.
pub struct RequestValidationHook {
    priority: i32,
}

impl RequestValidationHook {
    #[must_use]
    pub fn new() -> Self {
        Self { priority: PRIORITY_HIGH }
    }
}

impl Default for RequestValidationHook {
    fn default() -> Self {
        Self::new()
    }
}

fn scalar_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

#[async_trait]
impl Hook for RequestValidationHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        let required: Vec<String> = ctx
            .metadata_value(META_REQUIRED_PARAMS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        for name in &required {
            let provided = ctx.request().parameters.get(name).filter(|v| !v.is_null());
            if provided.is_none() {
                return Err(GatewayError::InvalidArg(format!(
                    "missing required parameter '{name}'"
                )));
            }
        }

        let types: HashMap<String, String> = ctx
            .metadata_value(META_PARAM_TYPES)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        for (name, expected) in &types {
            if let Some(value) = ctx.request().parameters.get(name)
                && !value.is_null()
                && !scalar_matches(expected, value)
            {
                return Err(GatewayError::InvalidArg(format!(
                    "parameter '{name}' must be of type {expected}"
                )));
            }
        }

        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::PreRequest
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "request-validation"
    }
}

/// Closure-driven mutation of headers, query, or body. The same transform
/// logic is registered as two hook values when it applies to both the
/// pre-request and post-response phases.
pub struct TransformHook {
    name: String,
    phase: Phase,
    priority: i32,
    transform: Arc<dyn Fn(&mut CallContext) -> Result<()> + Send + Sync>,
}

impl TransformHook {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        transform: Arc<dyn Fn(&mut CallContext) -> Result<()> + Send + Sync>,
    ) -> Self {
        Self { name: name.into(), phase, priority: PRIORITY_MEDIUM, transform }
    }
}

#[async_trait]
impl Hook for TransformHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        (self.transform)(ctx)
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Injects a fixed set of security response headers, overlaid by
/// caller-supplied overrides.
pub struct SecurityHeadersHook {
    headers: HashMap<String, String>,
    priority: i32,
}

impl SecurityHeadersHook {
    #[must_use]
    pub fn new(overrides: HashMap<String, String>) -> Self {
        let mut headers = HashMap::from([
            ("X-Content-Type-Options".to_string(), "nosniff".to_string()),
            ("X-Frame-Options".to_string(), "DENY".to_string()),
            ("X-XSS-Protection".to_string(), "1; mode=block".to_string()),
            (
                "Strict-Transport-Security".to_string(),
                "max-age=31536000; includeSubDomains".to_string(),
            ),
        ]);
        headers.extend(overrides);
        Self { headers, priority: PRIORITY_MEDIUM }
    }
}

#[async_trait]
impl Hook for SecurityHeadersHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        if let Some(response) = &mut ctx.response {
            for (key, value) in &self.headers {
                response.headers.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::PostResponse
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "security-headers"
    }
}

/// Records latency and outcome into the shared stats recorder.
pub struct MetricsHook {
    recorder: Arc<StatsRecorder>,
    priority: i32,
}

impl MetricsHook {
    #[must_use]
    pub fn new(recorder: Arc<StatsRecorder>) -> Self {
        Self { recorder, priority: PRIORITY_LOW }
    }
}

#[async_trait]
impl Hook for MetricsHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        if let Some(response) = &ctx.response {
            self.recorder.record(
                &ctx.request().service_name,
                response.elapsed,
                response.status >= 400 || response.error.is_some(),
            );
        }
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::PostResponse
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "metrics"
    }
}

/// Formats the call's failure into a structured JSON response and logs it.
pub struct ErrorHandlingHook {
    priority: i32,
}

impl ErrorHandlingHook {
    #[must_use]
    pub fn new() -> Self {
        Self { priority: PRIORITY_MEDIUM }
    }
}

impl Default for ErrorHandlingHook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hook for ErrorHandlingHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        let payload = ctx.metadata_value(META_ERROR_PAYLOAD).cloned();
        let request = ctx.request();
        let service = request.service_name.clone();
        let operation = request.operation_id.clone();

        if let Some(response) = &mut ctx.response {
            tracing::error!(
                service = %service,
                operation = %operation,
                status = response.status,
                error = response.error.as_deref().unwrap_or("unknown"),
                elapsed_ms = response.elapsed.as_millis() as u64,
                "request failed"
            );

            if let Some(payload) = payload {
                response.body = serde_json::to_vec(&payload).unwrap_or_default();
                response
                    .headers
                    .insert("Content-Type".to_string(), "application/json".to_string());
            }
        }
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::OnError
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "error-handling"
    }
}

/// Enforces the auth policy planted in call metadata, storing the resulting
/// auth context back into the metadata bag.
pub struct AuthenticationHook {
    manager: Arc<AuthManager>,
    priority: i32,
}

impl AuthenticationHook {
    #[must_use]
    pub fn new(manager: Arc<AuthManager>) -> Self {
        Self { manager, priority: PRIORITY_HIGH }
    }
}

#[async_trait]
impl Hook for AuthenticationHook {
    async fn execute(&self, _cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()> {
        let Some(policy_value) = ctx.metadata_value(META_AUTH_POLICY) else {
            return Ok(());
        };
        let policy: AuthPolicy = serde_json::from_value(policy_value.clone())
            .map_err(|e| GatewayError::Internal(format!("malformed auth policy metadata: {e}")))?;

        let auth_ctx = self.manager.authenticate(ctx.request(), &policy).await?;
        let auth_value = serde_json::to_value(&auth_ctx)
            .map_err(|e| GatewayError::Internal(format!("failed to serialize auth context: {e}")))?;
        ctx.set_metadata(META_AUTH_CONTEXT, auth_value);
        Ok(())
    }

    fn phase(&self) -> Phase {
        Phase::PreRequest
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn name(&self) -> &str {
        "authentication"
    }
}
