//! Credential lookup and request signing

use crate::error::{ContextError, Result};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Read-only access to provider secrets
pub trait CredentialStore: Send + Sync {
    /// Secret for `provider_id`, if one is stored
    fn get(&self, provider_id: &str) -> Option<SecretString>;
}

/// Process-local credential store
#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: DashMap<String, SecretString>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, provider_id: impl Into<String>, secret: impl Into<String>) {
        self.secrets
            .insert(provider_id.into(), Secret::new(secret.into()));
    }

    pub fn remove(&self, provider_id: &str) -> bool {
        self.secrets.remove(provider_id).is_some()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get(&self, provider_id: &str) -> Option<SecretString> {
        self.secrets
            .get(provider_id)
            .map(|s| Secret::new(s.expose_secret().clone()))
    }
}

/// Reads `<PROVIDER>_API_KEY` from the environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn variable_for(provider_id: &str) -> String {
        let provider = provider_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect::<String>();
        format!("{}_API_KEY", provider)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get(&self, provider_id: &str) -> Option<SecretString> {
        std::env::var(Self::variable_for(provider_id))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(Secret::new)
    }
}

/// How the credential is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    /// `x-api-key: <secret>`
    #[serde(rename = "x-api-key")]
    ApiKeyHeader,
    /// `Authorization: Bearer <secret>`
    #[serde(rename = "bearer")]
    Bearer,
}

impl Default for AuthScheme {
    fn default() -> Self {
        AuthScheme::ApiKeyHeader
    }
}

/// Attaches protocol and credential headers to outgoing requests
#[derive(Clone)]
pub struct RequestAuthenticator {
    store: Arc<dyn CredentialStore>,
    provider: String,
    version_header: String,
    api_version: String,
    scheme: AuthScheme,
}

impl RequestAuthenticator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: impl Into<String>,
        api_version: impl Into<String>,
        scheme: AuthScheme,
    ) -> Self {
        Self {
            store,
            provider: provider.into(),
            version_header: "anthropic-version".to_string(),
            api_version: api_version.into(),
            scheme,
        }
    }

    pub fn with_version_header(mut self, header: impl Into<String>) -> Self {
        self.version_header = header.into();
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn has_credential(&self) -> bool {
        self.store.get(&self.provider).is_some()
    }

    /// Fail early when no credential exists, saving a doomed round trip
    pub fn require_credential(&self) -> Result<()> {
        if self.has_credential() {
            Ok(())
        } else {
            Err(ContextError::MissingCredential(self.provider.clone()))
        }
    }

    /// Headers for one request.
    ///
    /// Without a stored credential the request goes out unsigned and the
    /// server is expected to reject it.
    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let version_name = HeaderName::from_bytes(self.version_header.as_bytes())
            .map_err(|e| ContextError::Configuration(format!("Invalid version header: {}", e)))?;
        let version_value = HeaderValue::from_str(&self.api_version)
            .map_err(|e| ContextError::Configuration(format!("Invalid API version: {}", e)))?;
        headers.insert(version_name, version_value);

        match self.store.get(&self.provider) {
            Some(secret) => {
                let (name, raw) = match self.scheme {
                    AuthScheme::ApiKeyHeader => (
                        HeaderName::from_static("x-api-key"),
                        secret.expose_secret().clone(),
                    ),
                    AuthScheme::Bearer => {
                        (AUTHORIZATION, format!("Bearer {}", secret.expose_secret()))
                    }
                };
                let mut value = HeaderValue::from_str(&raw).map_err(|_| {
                    ContextError::Configuration(format!(
                        "Credential for '{}' is not a valid header value",
                        self.provider
                    ))
                })?;
                value.set_sensitive(true);
                headers.insert(name, value);
            }
            None => debug!("No credential for provider {}, sending unsigned", self.provider),
        }

        Ok(headers)
    }

    /// Apply headers to a request builder
    pub fn sign(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(builder.headers(self.headers()?))
    }
}
