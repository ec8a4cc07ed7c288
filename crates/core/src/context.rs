//! The per-call record carried through every pipeline phase.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metadata key under which the engine plants the service's auth policy.
pub const META_AUTH_POLICY: &str = "authPolicy";
/// Metadata key under which the authentication hook records the auth context.
pub const META_AUTH_CONTEXT: &str = "authContext";
/// Metadata key listing the operation's required parameter names.
pub const META_REQUIRED_PARAMS: &str = "requiredParameters";
/// Metadata key mapping parameter names to their expected scalar type.
pub const META_PARAM_TYPES: &str = "parameterTypes";

/// The inbound request as hooks see it.
///
/// Mutable during the pre-request phase; the executor freezes it (by cloning)
/// at the start of invoke-upstream, so later mutation cannot affect the
/// upstream call.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    /// Query pairs in insertion order; duplicate keys preserved.
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Bound operation parameters keyed by parameter name (plus `body`).
    pub parameters: Map<String, Value>,
    pub service_name: String,
    pub operation_id: String,
    pub started_at: Instant,
    /// Peer address, when the transport knows it.
    pub remote_addr: Option<String>,
}

impl RequestView {
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        service_name: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            parameters: Map::new(),
            service_name: service_name.into(),
            operation_id: operation_id.into(),
            started_at: Instant::now(),
            remote_addr: None,
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// The upstream's answer (or the error surrogate built on the error path).
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    /// Human-readable error when the call failed.
    pub error: Option<String>,
    pub upstream_url: String,
}

/// The mutable per-call record.
///
/// Owned by exactly one executing pipeline; hooks mutate it sequentially in
/// phase order, so no locking is involved.
#[derive(Debug)]
pub struct CallContext {
    request: RequestView,
    pub response: Option<ResponseView>,
    /// Free-form metadata bag, mutable throughout the call.
    pub metadata: Map<String, Value>,
    frozen: bool,
}

impl CallContext {
    #[must_use]
    pub fn new(request: RequestView) -> Self {
        Self { request, response: None, metadata: Map::new(), frozen: false }
    }

    #[must_use]
    pub fn request(&self) -> &RequestView {
        &self.request
    }

    /// Mutable access to the request view.
    ///
    /// Must not be used once the pipeline has frozen the request at the start
    /// of invoke-upstream; the debug assertion catches hooks registered in
    /// the wrong phase.
    pub fn request_mut(&mut self) -> &mut RequestView {
        debug_assert!(!self.frozen, "request view mutated after invoke-upstream");
        &mut self.request
    }

    /// Freeze the request view and return the copy the upstream call uses.
    pub fn freeze_request(&mut self) -> RequestView {
        self.frozen = true;
        self.request.clone()
    }

    /// Time since the call started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.request.started_at.elapsed()
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}
