//! Authentication providers and their manager.
//!
//! Providers form a small capability set (authenticate + type) resolved
//! through a registry keyed by [`AuthType`]; the authentication hook invokes
//! the manager with the policy attached to the service's spec entry.

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specgate_core::{AuthPolicy, AuthType, GatewayError, RequestView, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// The authenticated caller, carried in call metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub claims: Value,
    pub valid: bool,
}

impl AuthContext {
    /// Context for calls where authentication is optional and absent.
    #[must_use]
    pub fn anonymous() -> Self {
        Self { valid: true, ..Self::default() }
    }
}

/// One authentication scheme.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate the request's credentials.
    ///
    /// # Errors
    ///
    /// *unauthenticated* when credentials are absent or invalid.
    async fn authenticate(&self, request: &RequestView) -> Result<AuthContext>;

    fn auth_type(&self) -> AuthType;
}

fn bearer_token(request: &RequestView) -> Result<&str> {
    request
        .header("Authorization")
        .and_then(|header| header.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GatewayError::Unauthenticated("missing bearer token".to_string()))
}

// --- basic ------------------------------------------------------------------

/// Username/password pairs checked against the `Authorization: Basic` header.
#[derive(Debug)]
pub struct BasicAuthProvider {
    users: HashMap<String, String>,
}

impl BasicAuthProvider {
    /// Config shape: `{ "users": { "<name>": "<password>", … } }`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let users = config
            .get("users")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                GatewayError::InvalidArg("basic auth config requires a 'users' object".to_string())
            })?
            .iter()
            .filter_map(|(name, password)| {
                password.as_str().map(|p| (name.clone(), p.to_string()))
            })
            .collect();
        Ok(Self { users })
    }
}

#[async_trait]
impl AuthProvider for BasicAuthProvider {
    async fn authenticate(&self, request: &RequestView) -> Result<AuthContext> {
        let encoded = request
            .header("Authorization")
            .and_then(|header| header.strip_prefix("Basic "))
            .ok_or_else(|| {
                GatewayError::Unauthenticated("missing basic credentials".to_string())
            })?;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::Unauthenticated("malformed basic credentials".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| GatewayError::Unauthenticated("malformed basic credentials".to_string()))?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            GatewayError::Unauthenticated("malformed basic credentials".to_string())
        })?;

        match self.users.get(username) {
            Some(expected) if expected == password => Ok(AuthContext {
                user_id: username.to_string(),
                username: username.to_string(),
                scopes: Vec::new(),
                claims: Value::Null,
                valid: true,
            }),
            _ => Err(GatewayError::Unauthenticated("invalid username or password".to_string())),
        }
    }

    fn auth_type(&self) -> AuthType {
        AuthType::Basic
    }
}

// --- bearer (JWT) -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    /// Space-separated scope string per RFC 6749.
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// HS256 JWT validation against a shared secret.
#[derive(Debug)]
pub struct BearerAuthProvider {
    secret: String,
    issuer: Option<String>,
    audience: Option<String>,
}

impl BearerAuthProvider {
    /// Config shape: `{ "secret": "…", "issuer": "…", "audience": "…" }`
    /// (issuer and audience optional).
    pub fn from_config(config: &Value) -> Result<Self> {
        let secret = config
            .get("secret")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidArg("bearer auth config requires a 'secret'".to_string())
            })?;
        Ok(Self {
            secret: secret.to_string(),
            issuer: config.get("issuer").and_then(Value::as_str).map(String::from),
            audience: config.get("audience").and_then(Value::as_str).map(String::from),
        })
    }
}

#[async_trait]
impl AuthProvider for BearerAuthProvider {
    async fn authenticate(&self, request: &RequestView) -> Result<AuthContext> {
        let token = bearer_token(request)?;

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = jsonwebtoken::decode::<JwtClaims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| GatewayError::Unauthenticated(format!("invalid bearer token: {e}")))?;

        let claims = data.claims;
        let mut scopes: Vec<String> = claims
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        if let Some(extra_scopes) = claims.scopes {
            scopes.extend(extra_scopes);
        }

        Ok(AuthContext {
            user_id: claims.sub.clone().unwrap_or_default(),
            username: claims.preferred_username.or(claims.sub).unwrap_or_default(),
            scopes,
            claims: Value::Object(claims.extra),
            valid: true,
        })
    }

    fn auth_type(&self) -> AuthType {
        AuthType::Bearer
    }
}

// --- oauth2 (token introspection) -------------------------------------------

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

/// RFC 7662 token introspection against the configured endpoint.
#[derive(Debug)]
pub struct OAuth2Provider {
    introspection_url: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
}

impl OAuth2Provider {
    /// Config shape:
    /// `{ "introspectionUrl": "…", "clientId": "…", "clientSecret": "…" }`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            config
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .ok_or_else(|| {
                    GatewayError::InvalidArg(format!("oauth2 auth config requires '{name}'"))
                })
        };
        Ok(Self {
            introspection_url: field("introspectionUrl")?,
            client_id: field("clientId")?,
            client_secret: field("clientSecret")?,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl AuthProvider for OAuth2Provider {
    async fn authenticate(&self, request: &RequestView) -> Result<AuthContext> {
        let token = bearer_token(request)?;

        let response = self
            .client
            .post(&self.introspection_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("token introspection failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Unauthenticated(format!(
                "token introspection answered {}",
                response.status()
            )));
        }

        let introspection: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unauthenticated(format!("invalid introspection body: {e}")))?;

        if !introspection.active {
            return Err(GatewayError::Unauthenticated("token is not active".to_string()));
        }

        Ok(AuthContext {
            user_id: introspection.sub.clone().unwrap_or_default(),
            username: introspection.username.or(introspection.sub).unwrap_or_default(),
            scopes: introspection
                .scope
                .as_deref()
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            claims: Value::Object(introspection.extra),
            valid: true,
        })
    }

    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2
    }
}

// --- api key ----------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyInfo {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    scopes: Vec<String>,
}

/// Static API keys carried in a header or query parameter.
pub struct ApiKeyProvider {
    keys: HashMap<String, ApiKeyInfo>,
    header_name: String,
    query_name: String,
}

impl ApiKeyProvider {
    /// Config shape:
    /// `{ "keys": { "<key>": { "userId": "…", "scopes": [...] } },
    ///    "header": "X-API-Key", "query": "api_key" }`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let keys = config
            .get("keys")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                GatewayError::InvalidArg("apikey auth config requires a 'keys' object".to_string())
            })?
            .iter()
            .filter_map(|(key, info)| {
                serde_json::from_value::<ApiKeyInfo>(info.clone()).ok().map(|i| (key.clone(), i))
            })
            .collect();
        Ok(Self {
            keys,
            header_name: config
                .get("header")
                .and_then(Value::as_str)
                .unwrap_or("X-API-Key")
                .to_string(),
            query_name: config
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or("api_key")
                .to_string(),
        })
    }
}

#[async_trait]
impl AuthProvider for ApiKeyProvider {
    async fn authenticate(&self, request: &RequestView) -> Result<AuthContext> {
        let key = request
            .header(&self.header_name)
            .or_else(|| request.query_param(&self.query_name))
            .ok_or_else(|| GatewayError::Unauthenticated("missing API key".to_string()))?;

        let info = self
            .keys
            .get(key)
            .ok_or_else(|| GatewayError::Unauthenticated("unknown API key".to_string()))?;

        Ok(AuthContext {
            user_id: info.user_id.clone(),
            username: info.user_id.clone(),
            scopes: info.scopes.clone(),
            claims: Value::Null,
            valid: true,
        })
    }

    fn auth_type(&self) -> AuthType {
        AuthType::ApiKey
    }
}

// --- manager ----------------------------------------------------------------

/// Registry of authentication providers keyed by type.
#[derive(Default)]
pub struct AuthManager {
    providers: RwLock<HashMap<AuthType, Arc<dyn AuthProvider>>>,
}

impl AuthManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&self, provider: Arc<dyn AuthProvider>) {
        let auth_type = provider.auth_type();
        tracing::info!(auth_type = %auth_type, "registered authentication provider");
        self.providers.write().insert(auth_type, provider);
    }

    /// Build and register the provider a policy needs from its config.
    ///
    /// # Errors
    ///
    /// *invalid-arg* when the policy config is missing required fields.
    pub fn register_for_policy(&self, policy: &AuthPolicy) -> Result<()> {
        let provider: Arc<dyn AuthProvider> = match policy.auth_type {
            AuthType::Basic => Arc::new(BasicAuthProvider::from_config(&policy.config)?),
            AuthType::Bearer => Arc::new(BearerAuthProvider::from_config(&policy.config)?),
            AuthType::OAuth2 => Arc::new(OAuth2Provider::from_config(&policy.config)?),
            AuthType::ApiKey => Arc::new(ApiKeyProvider::from_config(&policy.config)?),
        };
        self.register_provider(provider);
        Ok(())
    }

    /// Authenticate a request against a policy. Optional policies pass with
    /// an anonymous context.
    ///
    /// # Errors
    ///
    /// *unauthenticated* for absent or invalid credentials, *forbidden* when
    /// a required scope is missing, *internal* when no provider is registered
    /// for the policy's type.
    pub async fn authenticate(
        &self,
        request: &RequestView,
        policy: &AuthPolicy,
    ) -> Result<AuthContext> {
        if !policy.required {
            return Ok(AuthContext::anonymous());
        }

        let provider = self.providers.read().get(&policy.auth_type).cloned().ok_or_else(|| {
            GatewayError::Internal(format!(
                "no authentication provider registered for type '{}'",
                policy.auth_type
            ))
        })?;

        let auth_ctx = provider.authenticate(request).await?;

        if !policy.scopes.is_empty() {
            let missing: Vec<&String> =
                policy.scopes.iter().filter(|scope| !auth_ctx.scopes.contains(scope)).collect();
            if !missing.is_empty() {
                return Err(GatewayError::Forbidden(format!(
                    "missing required scopes: {missing:?}"
                )));
            }
        }

        Ok(auth_ctx)
    }
}
