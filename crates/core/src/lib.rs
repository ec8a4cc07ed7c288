//! Shared types for the specgate gateway core.
//!
//! This crate is intended to be used by:
//! - `specgate-openapi-tools` (spec fetching + operation compilation)
//! - `specgate-gateway` (registry, pipeline, resilience, dispatch)
//!
//! It intentionally contains **no** I/O and **no** gateway policy: just the
//! error taxonomy, version arithmetic, and the per-call / per-spec data model
//! the other crates agree on.

pub mod context;
pub mod error;
pub mod events;
pub mod types;
pub mod version;

pub use context::{CallContext, RequestView, ResponseView};
pub use error::{ErrorKind, GatewayError, Result};
pub use events::{SpecEvent, SpecEventKind};
pub use types::{AuthPolicy, AuthType, RouteInfo, ServiceStats, SpecEntry, SpecSnapshot, SpecSource};
pub use version::Version;
