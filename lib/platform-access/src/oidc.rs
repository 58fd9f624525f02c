//! OIDC (OpenID Connect) configuration.
//!
//! This module provides configuration for the relying party: how to reach the
//! identity provider, how to name mirrored role groups, and the timing knobs
//! for token refresh and key caching.
//!
//! Endpoint URLs follow the Keycloak realm layout
//! (`{issuer}/protocol/openid-connect/...`).

use keygate_core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Audience Keycloak adds to access tokens for the account console.
const ACCOUNT_AUDIENCE: &str = "account";

/// Configuration for the OIDC identity provider.
///
/// Fields with defaults can be omitted when loading from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// The OIDC issuer URL (e.g., "https://sso.example.com/realms/main").
    issuer_url: String,
    /// The OAuth2 client ID registered with the provider.
    client_id: String,
    /// The OAuth2 client secret.
    client_secret: String,
    /// The redirect URI for the OAuth2 callback (e.g., "https://app.example.com/auth/callback").
    redirect_uri: String,
    /// OAuth2 scopes to request as a comma-separated string.
    /// Default: "openid,email,profile"
    #[serde(default = "default_scopes")]
    scopes: String,
    /// Prefix for local groups mirroring realm roles.
    /// Default: "kc:"
    #[serde(default = "default_group_prefix")]
    group_prefix: String,
    /// Client whose `resource_access` roles are read. Defaults to `client_id`.
    #[serde(default)]
    resource_client: Option<String>,
    /// Accepted token audiences as a comma-separated string.
    /// Defaults to the client ID plus "account".
    #[serde(default)]
    expected_audiences: Option<String>,
    /// Seconds before `exp` at which an access token is treated as expired.
    #[serde(default = "default_expiry_skew_seconds")]
    expiry_skew_seconds: u64,
    /// Timeout for refresh-token exchanges.
    #[serde(default = "default_refresh_timeout_seconds")]
    refresh_timeout_seconds: u64,
    /// Lifetime of a cached signing key set.
    #[serde(default = "default_jwks_cache_ttl_seconds")]
    jwks_cache_ttl_seconds: u64,
    /// Where the provider sends the browser after logout.
    /// Defaults to the root of the redirect URI's origin.
    #[serde(default)]
    post_logout_redirect_uri: Option<String>,
}

fn default_scopes() -> String {
    "openid,email,profile".to_string()
}

fn default_group_prefix() -> String {
    "kc:".to_string()
}

fn default_expiry_skew_seconds() -> u64 {
    30
}

fn default_refresh_timeout_seconds() -> u64 {
    10
}

fn default_jwks_cache_ttl_seconds() -> u64 {
    300
}

impl OidcConfig {
    /// Creates a new OIDC configuration with defaults for optional fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        OidcConfigBuilder::new(issuer_url, client_id, client_secret, redirect_uri).build()
    }

    /// Creates a configuration builder for more customization.
    #[must_use]
    pub fn builder(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> OidcConfigBuilder {
        OidcConfigBuilder::new(issuer_url, client_id, client_secret, redirect_uri)
    }

    /// Checks that every configured URL parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url("issuer_url", &self.issuer_url)?;
        parse_url("redirect_uri", &self.redirect_uri)?;
        if let Some(uri) = &self.post_logout_redirect_uri {
            parse_url("post_logout_redirect_uri", uri)?;
        }
        Ok(())
    }

    /// Returns the OIDC issuer URL.
    #[must_use]
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    /// Returns the OAuth2 client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the OAuth2 client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the OAuth2 redirect URI.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Returns the OAuth2 scopes to request, parsed from comma-separated string.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        split_list(&self.scopes)
    }

    /// Returns the prefix for mirrored role groups.
    #[must_use]
    pub fn group_prefix(&self) -> &str {
        &self.group_prefix
    }

    /// Returns the client whose resource roles are consulted.
    #[must_use]
    pub fn resource_client(&self) -> &str {
        self.resource_client.as_deref().unwrap_or(&self.client_id)
    }

    /// Returns the audiences a verified token must intersect.
    #[must_use]
    pub fn expected_audiences(&self) -> Vec<String> {
        match &self.expected_audiences {
            Some(raw) => split_list(raw).into_iter().map(str::to_string).collect(),
            None => vec![self.client_id.clone(), ACCOUNT_AUDIENCE.to_string()],
        }
    }

    #[must_use]
    pub fn expiry_skew(&self) -> Duration {
        Duration::from_secs(self.expiry_skew_seconds)
    }

    #[must_use]
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    #[must_use]
    pub fn jwks_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_cache_ttl_seconds)
    }

    /// Returns where the provider should send the browser after logout.
    ///
    /// Falls back to the root of the redirect URI's origin.
    pub fn post_logout_redirect_uri(&self) -> Result<String, ConfigError> {
        if let Some(uri) = &self.post_logout_redirect_uri {
            return Ok(uri.clone());
        }
        let mut root = parse_url("redirect_uri", &self.redirect_uri)?;
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        Ok(root.to_string())
    }

    /// Token endpoint used for code exchange and refresh.
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.protocol_endpoint("token")
    }

    /// JSON Web Key Set endpoint.
    #[must_use]
    pub fn certs_endpoint(&self) -> String {
        self.protocol_endpoint("certs")
    }

    /// RP-initiated logout endpoint.
    #[must_use]
    pub fn end_session_endpoint(&self) -> String {
        self.protocol_endpoint("logout")
    }

    fn protocol_endpoint(&self, name: &str) -> String {
        format!(
            "{}/protocol/openid-connect/{name}",
            self.issuer_url.trim_end_matches('/')
        )
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| {
        ConfigError::InvalidUrl {
            field,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Builder for `OidcConfig`.
#[derive(Debug)]
pub struct OidcConfigBuilder {
    issuer_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
    group_prefix: String,
    resource_client: Option<String>,
    expected_audiences: Option<Vec<String>>,
    expiry_skew_seconds: u64,
    refresh_timeout_seconds: u64,
    jwks_cache_ttl_seconds: u64,
    post_logout_redirect_uri: Option<String>,
}

impl OidcConfigBuilder {
    /// Creates a new builder with required fields.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            issuer_url,
            client_id,
            client_secret,
            redirect_uri,
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ],
            group_prefix: default_group_prefix(),
            resource_client: None,
            expected_audiences: None,
            expiry_skew_seconds: default_expiry_skew_seconds(),
            refresh_timeout_seconds: default_refresh_timeout_seconds(),
            jwks_cache_ttl_seconds: default_jwks_cache_ttl_seconds(),
            post_logout_redirect_uri: None,
        }
    }

    /// Sets the OAuth2 scopes to request.
    #[must_use]
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Adds a scope to the list of scopes to request.
    #[must_use]
    pub fn add_scope(mut self, scope: String) -> Self {
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
        self
    }

    #[must_use]
    pub fn group_prefix(mut self, prefix: String) -> Self {
        self.group_prefix = prefix;
        self
    }

    #[must_use]
    pub fn resource_client(mut self, client: String) -> Self {
        self.resource_client = Some(client);
        self
    }

    #[must_use]
    pub fn expected_audiences(mut self, audiences: Vec<String>) -> Self {
        self.expected_audiences = Some(audiences);
        self
    }

    #[must_use]
    pub fn expiry_skew_seconds(mut self, seconds: u64) -> Self {
        self.expiry_skew_seconds = seconds;
        self
    }

    #[must_use]
    pub fn refresh_timeout_seconds(mut self, seconds: u64) -> Self {
        self.refresh_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn jwks_cache_ttl_seconds(mut self, seconds: u64) -> Self {
        self.jwks_cache_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn post_logout_redirect_uri(mut self, uri: String) -> Self {
        self.post_logout_redirect_uri = Some(uri);
        self
    }

    /// Builds the `OidcConfig`.
    #[must_use]
    pub fn build(self) -> OidcConfig {
        OidcConfig {
            issuer_url: self.issuer_url,
            client_id: self.client_id,
            client_secret: self.client_secret,
            redirect_uri: self.redirect_uri,
            scopes: self.scopes.join(","),
            group_prefix: self.group_prefix,
            resource_client: self.resource_client,
            expected_audiences: self.expected_audiences.map(|a| a.join(",")),
            expiry_skew_seconds: self.expiry_skew_seconds,
            refresh_timeout_seconds: self.refresh_timeout_seconds,
            jwks_cache_ttl_seconds: self.jwks_cache_ttl_seconds,
            post_logout_redirect_uri: self.post_logout_redirect_uri,
        }
    }
}
