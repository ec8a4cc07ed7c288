//! Outgoing request construction and dispatch.
//!
//! Given a compiled operation and a parameter binding: substitute path
//! placeholders, assemble the query string, encode the body per the
//! operation's content type, merge headers, and issue the request under the
//! call's cancellation token and timeout.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use specgate_core::{GatewayError, ResponseView, Result};
use specgate_openapi_tools::{Operation, ParamLocation};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A completed upstream exchange.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub url: String,
}

impl UpstreamResponse {
    /// Convert into the response view stored on the call context.
    #[must_use]
    pub fn into_response_view(self, elapsed: Duration) -> ResponseView {
        ResponseView {
            status: self.status,
            headers: self.headers,
            body: self.body,
            elapsed,
            error: None,
            upstream_url: self.url,
        }
    }
}

/// Issues upstream requests for compiled operations.
#[derive(Debug, Clone)]
pub struct UpstreamDispatcher {
    client: reqwest::Client,
    default_headers: HashMap<String, String>,
    timeout: Duration,
    max_response_bytes: usize,
}

impl UpstreamDispatcher {
    #[must_use]
    pub fn new(timeout: Duration, max_response_bytes: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_headers: HashMap::new(),
            timeout,
            max_response_bytes,
        }
    }

    /// Headers applied to every upstream request, overlaid by per-spec static
    /// headers and per-parameter values.
    #[must_use]
    pub fn with_default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }

    /// Execute one upstream call.
    ///
    /// # Errors
    ///
    /// *invalid-arg* for missing path parameters or an unencodable body,
    /// *timeout* / *cancelled* when the deadline or token fires, *transport*
    /// for network failures, *resource-exhausted* when the response body
    /// exceeds the ceiling. HTTP error statuses are **not** errors here; the
    /// pipeline decides how to treat them.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        base_url: &str,
        static_headers: &HashMap<String, String>,
        operation: &Operation,
        arguments: &Map<String, Value>,
    ) -> Result<UpstreamResponse> {
        let url = build_url(base_url, operation, arguments)?;
        let encoded_body = encode_body(operation, arguments)?;

        let method = reqwest::Method::from_str(&operation.method).map_err(|_| {
            GatewayError::InvalidArg(format!("unsupported HTTP method '{}'", operation.method))
        })?;

        let mut request = self.client.request(method, url.clone());
        for (key, value) in &self.default_headers {
            request = request.header(key, value);
        }
        for (key, value) in static_headers {
            request = request.header(key, value);
        }
        for param in &operation.parameters {
            if param.location == ParamLocation::Header
                && let Some(value) = arguments.get(&param.name)
            {
                request = request.header(&param.name, value_to_string(value));
            }
        }
        if let Some((body, content_type)) = encoded_body {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type).body(body);
        }

        tracing::debug!(
            method = %operation.method,
            url = %url,
            operation = %operation.operation_id,
            "dispatching upstream request"
        );

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, request.send()) => match outcome {
                Err(_) => {
                    return Err(GatewayError::Timeout(format!(
                        "upstream call to '{url}' exceeded {:?}",
                        self.timeout
                    )));
                }
                Ok(Err(e)) if e.is_timeout() => {
                    return Err(GatewayError::Timeout(format!("upstream call to '{url}': {e}")));
                }
                Ok(Err(e)) => {
                    return Err(GatewayError::Transport(format!("upstream call to '{url}': {e}")));
                }
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            body = self.read_body_limited(response) => body?,
        };

        tracing::debug!(
            operation = %operation.operation_id,
            status,
            body_bytes = body.len(),
            "upstream request completed"
        );

        Ok(UpstreamResponse { status, headers, body, url: url.to_string() })
    }

    /// The per-operation executor handed to MCP adapters:
    /// `(cancellation, argument map) → (status, headers, body)`.
    #[must_use]
    pub fn executor(
        self: &Arc<Self>,
        base_url: String,
        static_headers: HashMap<String, String>,
        operation: Arc<Operation>,
    ) -> impl Fn(CancellationToken, Map<String, Value>) -> BoxFuture<'static, Result<UpstreamResponse>>
    + use<> {
        let dispatcher = Arc::clone(self);
        move |cancel, arguments| {
            let dispatcher = Arc::clone(&dispatcher);
            let base_url = base_url.clone();
            let static_headers = static_headers.clone();
            let operation = Arc::clone(&operation);
            Box::pin(async move {
                dispatcher
                    .dispatch(&cancel, &base_url, &static_headers, &operation, &arguments)
                    .await
            })
        }
    }

    async fn read_body_limited(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        if let Some(len) = response.content_length()
            && len > self.max_response_bytes as u64
        {
            return Err(GatewayError::ResourceExhausted(format!(
                "upstream response is {len} bytes (limit {})",
                self.max_response_bytes
            )));
        }

        let mut out: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read upstream body: {e}")))?
        {
            if out.len().saturating_add(chunk.len()) > self.max_response_bytes {
                return Err(GatewayError::ResourceExhausted(format!(
                    "upstream response exceeded {} bytes",
                    self.max_response_bytes
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

/// Substitute path placeholders and append everything else (except `body`) as
/// query parameters, multi-value preserved in insertion order.
fn build_url(base_url: &str, operation: &Operation, arguments: &Map<String, Value>) -> Result<Url> {
    let mut path = operation.path.clone();
    for name in operation.path_parameter_names() {
        let value = arguments.get(name).ok_or_else(|| {
            GatewayError::InvalidArg(format!(
                "missing required path parameter '{name}' for operation '{}'",
                operation.operation_id
            ))
        })?;
        path = path.replace(
            &format!("{{{name}}}"),
            &encode_path_segment(&value_to_string(value)),
        );
    }

    let raw = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut url = Url::parse(&raw)
        .map_err(|e| GatewayError::InvalidArg(format!("invalid upstream URL '{raw}': {e}")))?;

    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in arguments {
            if name == "body" || operation.path.contains(&format!("{{{name}}}")) {
                continue;
            }
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.append_pair(name, &value_to_string(item));
                    }
                }
                Value::Null => {}
                other => {
                    pairs.append_pair(name, &value_to_string(other));
                }
            }
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }

    Ok(url)
}

/// Encode the request body per the operation's content type: JSON, form
/// urlencoded, or plain text; any other type attempts JSON and falls back to
/// text.
fn encode_body(
    operation: &Operation,
    arguments: &Map<String, Value>,
) -> Result<Option<(Vec<u8>, String)>> {
    let Some(body_value) = arguments.get("body") else {
        return Ok(None);
    };
    let Some(descriptor) = &operation.body else {
        return Ok(None);
    };

    let encoded = match descriptor.content_type.as_str() {
        "application/json" => (encode_json(body_value)?, "application/json".to_string()),
        "application/x-www-form-urlencoded" => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            if let Value::Object(fields) = body_value {
                for (key, value) in fields {
                    serializer.append_pair(key, &value_to_string(value));
                }
            } else {
                return Err(GatewayError::InvalidArg(
                    "form-urlencoded body must be an object".to_string(),
                ));
            }
            (
                serializer.finish().into_bytes(),
                "application/x-www-form-urlencoded".to_string(),
            )
        }
        "text/plain" => (value_to_string(body_value).into_bytes(), "text/plain".to_string()),
        _ => match encode_json(body_value) {
            Ok(bytes) => (bytes, "application/json".to_string()),
            Err(_) => (value_to_string(body_value).into_bytes(), "text/plain".to_string()),
        },
    };

    Ok(Some(encoded))
}

fn encode_json(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| GatewayError::InvalidArg(format!("failed to encode JSON body: {e}")))
}

/// Scalar rendering for path, query, header, and form values.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Percent-encode a path segment, keeping RFC 3986 unreserved characters.
fn encode_path_segment(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        let unreserved =
            matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~');
        if unreserved {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}
