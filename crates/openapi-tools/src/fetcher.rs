//! Spec acquisition and validation.

use chrono::Utc;
use openapiv3::OpenAPI;
use specgate_core::{GatewayError, Result, SpecEntry, SpecSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const SPEC_ACCEPT: &str = "application/json, application/yaml, text/yaml";

/// Fetches and validates OpenAPI specifications.
///
/// The fetcher never touches the registry; callers compose `fetch` with a
/// registry `add`.
#[derive(Debug, Clone)]
pub struct SpecFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl SpecFetcher {
    /// `timeout` bounds the whole fetch; `max_bytes` caps the document size.
    #[must_use]
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, max_bytes }
    }

    /// Fetch, parse, and validate a spec, producing an immutable entry.
    ///
    /// # Errors
    ///
    /// - *transport* if the source cannot be reached or answers non-200
    /// - *resource-exhausted* if the document exceeds the byte ceiling
    /// - *invalid-spec* if parsing or structural validation fails, or the
    ///   document requires external reference resolution
    pub async fn fetch(
        &self,
        source: &str,
        service_name: &str,
        headers: &HashMap<String, String>,
        ttl: Duration,
    ) -> Result<SpecEntry> {
        let source = SpecSource::parse(source);

        let raw = match &source {
            SpecSource::Url(url) => self.fetch_url(url, headers).await?,
            SpecSource::File(path) => self.read_file(path)?,
        };

        let spec = parse_spec(&raw, &source.to_string())?;
        validate_spec(&spec, &source.to_string())?;

        tracing::info!(
            service = service_name,
            source = %source,
            title = %spec.info.title,
            version = %spec.info.version,
            paths = spec.paths.paths.len(),
            "fetched OpenAPI spec"
        );

        Ok(SpecEntry {
            id: format!("{service_name}:{source}"),
            service_name: service_name.to_string(),
            source,
            spec: Arc::new(spec),
            fetched_at: Utc::now(),
            ttl,
            headers: headers.clone(),
            auth_policy: None,
        })
    }

    async fn fetch_url(&self, raw_url: &str, headers: &HashMap<String, String>) -> Result<String> {
        let url = Url::parse(raw_url)
            .map_err(|e| GatewayError::InvalidSpec(format!("invalid spec URL '{raw_url}': {e}")))?;

        tracing::debug!(url = %url, "fetching OpenAPI spec");

        let mut request = self.client.get(url).header("Accept", SPEC_ACCEPT);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("spec fetch from '{raw_url}' timed out"))
            } else {
                GatewayError::Transport(format!("failed to fetch spec from '{raw_url}': {e}"))
            }
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(GatewayError::Transport(format!(
                "spec fetch from '{raw_url}' returned HTTP {status}"
            )));
        }

        self.read_body_limited(response, raw_url).await
    }

    async fn read_body_limited(
        &self,
        mut response: reqwest::Response,
        raw_url: &str,
    ) -> Result<String> {
        if let Some(len) = response.content_length()
            && len > self.max_bytes as u64
        {
            return Err(GatewayError::ResourceExhausted(format!(
                "spec at '{raw_url}' is {len} bytes (limit {})",
                self.max_bytes
            )));
        }

        let mut out: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read spec body: {e}")))?
        {
            if out.len().saturating_add(chunk.len()) > self.max_bytes {
                return Err(GatewayError::ResourceExhausted(format!(
                    "spec at '{raw_url}' exceeded {} bytes",
                    self.max_bytes
                )));
            }
            out.extend_from_slice(&chunk);
        }

        String::from_utf8(out)
            .map_err(|_| GatewayError::InvalidSpec(format!("spec at '{raw_url}' is not UTF-8")))
    }

    fn read_file(&self, path: &std::path::Path) -> Result<String> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Transport(format!("failed to read spec file '{}': {e}", path.display()))
        })?;
        if raw.len() > self.max_bytes {
            return Err(GatewayError::ResourceExhausted(format!(
                "spec file '{}' is {} bytes (limit {})",
                path.display(),
                raw.len(),
                self.max_bytes
            )));
        }
        Ok(raw)
    }
}

/// Parse a spec document. JSON is a valid subset of YAML, so one parser
/// covers both formats.
fn parse_spec(raw: &str, location: &str) -> Result<OpenAPI> {
    serde_yaml::from_str(raw).map_err(|e| {
        GatewayError::InvalidSpec(format!("failed to parse OpenAPI spec from '{location}': {e}"))
    })
}

/// Structural validation: OpenAPI 3.x, a title, at least one path, and no
/// external references (resolution of those is disabled).
fn validate_spec(spec: &OpenAPI, location: &str) -> Result<()> {
    if !spec.openapi.starts_with("3.") {
        return Err(GatewayError::InvalidSpec(format!(
            "'{location}' declares unsupported OpenAPI version '{}'",
            spec.openapi
        )));
    }
    if spec.info.title.is_empty() {
        return Err(GatewayError::InvalidSpec(format!("'{location}' has an empty info.title")));
    }
    if spec.paths.paths.is_empty() {
        return Err(GatewayError::InvalidSpec(format!("'{location}' defines no paths")));
    }

    let doc = serde_json::to_value(spec)
        .map_err(|e| GatewayError::Internal(format!("failed to re-serialize spec: {e}")))?;
    if let Some(reference) = find_external_ref(&doc) {
        return Err(GatewayError::InvalidSpec(format!(
            "'{location}' requires external reference resolution ('{reference}'), which is disabled"
        )));
    }

    Ok(())
}

/// Walk the document for `$ref` values pointing outside it.
fn find_external_ref(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(reference)) = map.get("$ref")
                && !reference.starts_with("#/")
            {
                return Some(reference.clone());
            }
            map.values().find_map(find_external_ref)
        }
        serde_json::Value::Array(items) => items.iter().find_map(find_external_ref),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PETSTORE: &str = r##"
openapi: 3.0.0
info:
  title: Petstore
  version: 1.0.0
paths:
  /pets:
    get:
      operationId: listPets
      responses:
        "200":
          description: ok
"##;

    #[test]
    fn parses_yaml_and_json() {
        let spec = parse_spec(PETSTORE, "inline").unwrap();
        assert_eq!(spec.info.title, "Petstore");

        let json = serde_json::to_string(&spec).unwrap();
        let reparsed = parse_spec(&json, "inline").unwrap();
        assert_eq!(reparsed.info.version, "1.0.0");
    }

    #[test]
    fn empty_paths_is_invalid() {
        let spec = parse_spec(
            "openapi: 3.0.0\ninfo:\n  title: t\n  version: 1.0.0\npaths: {}\n",
            "inline",
        )
        .unwrap();
        let err = validate_spec(&spec, "inline").unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::InvalidSpec);
    }

    #[test]
    fn external_refs_are_rejected() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /pets:
    get:
      operationId: listPets
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema:
                $ref: "https://example.com/schemas.yaml#/Pet"
"##;
        let spec = parse_spec(raw, "inline").unwrap();
        let err = validate_spec(&spec, "inline").unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::InvalidSpec);
        assert!(err.to_string().contains("external reference"));
    }

    #[test]
    fn internal_refs_pass_validation() {
        let raw = r##"
openapi: 3.0.0
info:
  title: t
  version: 1.0.0
paths:
  /pets:
    get:
      operationId: listPets
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema:
                $ref: "#/components/schemas/Pet"
components:
  schemas:
    Pet:
      type: object
"##;
        let spec = parse_spec(raw, "inline").unwrap();
        assert!(validate_spec(&spec, "inline").is_ok());
    }

    #[tokio::test]
    async fn fetches_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        std::fs::write(&path, PETSTORE).unwrap();

        let fetcher = SpecFetcher::new(Duration::from_secs(5), 1024 * 1024);
        let entry = fetcher
            .fetch(path.to_str().unwrap(), "petstore", &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(entry.service_name, "petstore");
        assert_eq!(entry.id, format!("petstore:{}", path.display()));
        assert_eq!(entry.spec.paths.paths.len(), 1);
    }

    #[tokio::test]
    async fn oversized_file_is_resource_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        std::fs::write(&path, PETSTORE).unwrap();

        let fetcher = SpecFetcher::new(Duration::from_secs(5), 16);
        let err = fetcher
            .fetch(path.to_str().unwrap(), "petstore", &HashMap::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), specgate_core::ErrorKind::ResourceExhausted);
    }
}
