//! The specgate request-path engine.
//!
//! This crate turns registered OpenAPI documents into an addressable set of
//! operations and routes every call through a middleware pipeline protected
//! by per-service circuit breakers and rate limiters:
//!
//! - [`registry`]: concurrent spec catalog with change events and a
//!   double-TTL cleanup janitor
//! - [`versioning`]: multi-version resolution (path / header / content-type /
//!   query strategies)
//! - [`pipeline`] + [`hooks`]: pre-request / post-response / on-error hook
//!   chain with priorities, fail-fast semantics, and cancellation
//! - [`breaker`] + [`ratelimit`]: the resilience layer
//! - [`dispatch`]: upstream request construction and execution
//! - [`engine`] + [`control`]: the facade and the admin contract consumed by
//!   the surrounding transports
//!
//! Transport adapters (HTTP, stdio, SSE), CLI parsing, and config-file
//! loading live outside this crate; the core is purely in-memory and loses
//! all registrations on restart.

pub mod auth;
pub mod breaker;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod hooks;
pub mod pipeline;
pub mod ratelimit;
pub mod registry;
pub mod stats;
pub mod versioning;

pub use breaker::{BreakerConfig, BreakerManager, BreakerState, CircuitBreaker};
pub use config::GatewayConfig;
pub use control::ControlSurface;
pub use dispatch::{UpstreamDispatcher, UpstreamResponse};
pub use engine::Gateway;
pub use pipeline::{Hook, HookManager, Phase, PipelineExecutor};
pub use ratelimit::{Limiter, RateLimitConfig, RateLimitManager, SlidingWindowLimiter, TokenBucketLimiter};
pub use registry::SpecRegistry;
pub use versioning::{VersionManager, VersionStrategy};
