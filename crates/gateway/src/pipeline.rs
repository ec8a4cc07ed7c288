//! The middleware pipeline wrapping every upstream call.
//!
//! Three ordered phases (pre-request, invoke-upstream, post-response) plus an
//! on-error fallback phase. Pre-request and post-response are fail-fast; the
//! on-error phase runs to completion with failures recorded, never re-raised:
//! the originating error is what the caller sees.

use crate::breaker::BreakerManager;
use crate::dispatch::UpstreamResponse;
use crate::ratelimit::RateLimitManager;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use specgate_core::{CallContext, GatewayError, RequestView, ResponseView, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const PRIORITY_HIGH: i32 = 100;
pub const PRIORITY_MEDIUM: i32 = 50;
pub const PRIORITY_LOW: i32 = 10;

/// Metadata key recording the taxonomy kind of the call's failure.
pub const META_ERROR_KIND: &str = "errorKind";
/// Metadata key holding the structured error payload for the error hooks.
pub const META_ERROR_PAYLOAD: &str = "errorPayload";
/// Metadata key recording the first failure raised inside the on-error phase.
pub const META_ERROR_HOOK_ERROR: &str = "errorHookError";

/// The phase a hook runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    PreRequest,
    PostResponse,
    OnError,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreRequest => "pre-request",
            Self::PostResponse => "post-response",
            Self::OnError => "on-error",
        }
    }
}

/// One middleware. Hooks are cheap to clone behind an `Arc` and must be safe
/// to call from concurrent pipelines.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Run the hook against the call context. A returned error short-circuits
    /// the current phase (except on-error, where it is recorded).
    async fn execute(&self, cancel: &CancellationToken, ctx: &mut CallContext) -> Result<()>;

    fn phase(&self) -> Phase;

    /// Higher runs first; ties keep registration order.
    fn priority(&self) -> i32;

    fn name(&self) -> &str;
}

/// Owns the registered hooks, ordered per phase.
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<Phase, Vec<Arc<dyn Hook>>>>,
}

impl HookManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook.
    ///
    /// # Errors
    ///
    /// *duplicate* if a hook of the same name is already registered for the
    /// same phase.
    pub fn register(&self, hook: Arc<dyn Hook>) -> Result<()> {
        let phase = hook.phase();
        let mut hooks = self.hooks.write();
        let slot = hooks.entry(phase).or_default();

        if slot.iter().any(|existing| existing.name() == hook.name()) {
            return Err(GatewayError::Duplicate(format!(
                "hook '{}' already registered for phase '{}'",
                hook.name(),
                phase.as_str()
            )));
        }

        tracing::info!(
            hook = hook.name(),
            phase = phase.as_str(),
            priority = hook.priority(),
            "registered hook"
        );
        slot.push(hook);
        // Stable sort keeps insertion order between equal priorities.
        slot.sort_by_key(|h| std::cmp::Reverse(h.priority()));
        Ok(())
    }

    #[must_use]
    pub fn hooks_for(&self, phase: Phase) -> Vec<Arc<dyn Hook>> {
        self.hooks.read().get(&phase).cloned().unwrap_or_default()
    }

    /// Hook names per phase, in execution order.
    #[must_use]
    pub fn registered(&self) -> HashMap<&'static str, Vec<String>> {
        let hooks = self.hooks.read();
        [Phase::PreRequest, Phase::PostResponse, Phase::OnError]
            .into_iter()
            .map(|phase| {
                let names = hooks
                    .get(&phase)
                    .map(|slot| slot.iter().map(|h| h.name().to_string()).collect())
                    .unwrap_or_default();
                (phase.as_str(), names)
            })
            .collect()
    }
}

/// Runs the hook chain around a single call.
pub struct PipelineExecutor {
    hooks: Arc<HookManager>,
    limiters: Option<Arc<RateLimitManager>>,
    breakers: Option<Arc<BreakerManager>>,
}

impl PipelineExecutor {
    #[must_use]
    pub fn new(hooks: Arc<HookManager>) -> Self {
        Self { hooks, limiters: None, breakers: None }
    }

    /// Gate calls through the rate-limit manager before the pre-request phase.
    #[must_use]
    pub fn with_rate_limits(mut self, limiters: Arc<RateLimitManager>) -> Self {
        self.limiters = Some(limiters);
        self
    }

    /// Wrap invoke-upstream in the per-service circuit breaker.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    /// Run one call through the full pipeline. `upstream` receives the frozen
    /// request view and the call's cancellation token.
    ///
    /// # Errors
    ///
    /// The first failure from any phase, the resilience layer, or the
    /// upstream itself; on-error hooks have run before this returns.
    pub async fn execute<F, Fut>(
        &self,
        cancel: &CancellationToken,
        ctx: &mut CallContext,
        upstream: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken, RequestView) -> Fut,
        Fut: Future<Output = Result<UpstreamResponse>>,
    {
        let result = self.run_call(cancel, ctx, upstream).await;

        if let Err(err) = &result {
            self.enter_error_path(cancel, ctx, err).await;
        }

        result
    }

    async fn run_call<F, Fut>(
        &self,
        cancel: &CancellationToken,
        ctx: &mut CallContext,
        upstream: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken, RequestView) -> Fut,
        Fut: Future<Output = Result<UpstreamResponse>>,
    {
        if let Some(limiters) = &self.limiters {
            let decision = limiters.check(ctx);
            if !decision.allowed {
                return Err(GatewayError::RateLimited { retry_after: decision.retry_after });
            }
        }

        self.run_phase(Phase::PreRequest, cancel, ctx).await?;
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        // The request view is frozen from here on; hooks in later phases see
        // it read-only via the context.
        let request = ctx.freeze_request();
        let service_name = request.service_name.clone();
        let invoke_started = Instant::now();
        let invoke = upstream(cancel.clone(), request);

        let response = match &self.breakers {
            Some(breakers) => breakers.call(&service_name, cancel, invoke).await?,
            None => invoke.await?,
        };

        let view = response.into_response_view(invoke_started.elapsed());
        let status = view.status;
        let upstream_url = view.upstream_url.clone();
        ctx.response = Some(view);

        if status >= 400 {
            return Err(GatewayError::Upstream {
                status,
                message: format!("'{upstream_url}' answered {status}"),
            });
        }

        // Post-response does not run for a cancelled call; on-error does.
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        self.run_phase(Phase::PostResponse, cancel, ctx).await?;

        Ok(())
    }

    async fn run_phase(
        &self,
        phase: Phase,
        cancel: &CancellationToken,
        ctx: &mut CallContext,
    ) -> Result<()> {
        for hook in self.hooks.hooks_for(phase) {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let started = Instant::now();
            match hook.execute(cancel, ctx).await {
                Ok(()) => {
                    tracing::debug!(
                        hook = hook.name(),
                        phase = phase.as_str(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "hook executed"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        hook = hook.name(),
                        phase = phase.as_str(),
                        error = %err,
                        "hook failed"
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Populate the error context and run the on-error hooks to completion.
    /// Errors from the hooks themselves are recorded, never re-raised.
    async fn enter_error_path(
        &self,
        cancel: &CancellationToken,
        ctx: &mut CallContext,
        err: &GatewayError,
    ) {
        let elapsed = ctx.elapsed();
        match &mut ctx.response {
            Some(view) => view.error = Some(err.to_string()),
            None => {
                ctx.response = Some(ResponseView {
                    status: err.http_status(),
                    headers: HashMap::new(),
                    body: Vec::new(),
                    elapsed,
                    error: Some(err.to_string()),
                    upstream_url: String::new(),
                });
            }
        }
        ctx.set_metadata(META_ERROR_KIND, json!(err.kind().as_str()));
        ctx.set_metadata(META_ERROR_PAYLOAD, err.to_payload());

        let mut first_hook_error: Option<GatewayError> = None;
        for hook in self.hooks.hooks_for(Phase::OnError) {
            if let Err(hook_err) = hook.execute(cancel, ctx).await {
                tracing::error!(
                    hook = hook.name(),
                    phase = Phase::OnError.as_str(),
                    error = %hook_err,
                    "on-error hook failed"
                );
                first_hook_error.get_or_insert(hook_err);
            }
        }

        if let Some(hook_err) = first_hook_error {
            ctx.set_metadata(META_ERROR_HOOK_ERROR, json!(hook_err.to_string()));
        }
    }
}
