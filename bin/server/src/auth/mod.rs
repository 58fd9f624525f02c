//! Authentication module for the keygate server.
//!
//! This module provides:
//! - OIDC login against the identity provider (authorization code + PKCE)
//! - Database-backed sessions holding the provider's tokens
//! - Extractors and a role-gate middleware for Axum routes
//!
//! # Authorization Model
//!
//! Authorization reads realm and client roles straight from the session's
//! access token at request time. Local groups mirroring realm roles are
//! refreshed on each login for use by the rest of the application; they are
//! not consulted by the gate.

pub mod db;
pub mod middleware;
pub mod oidc;
pub mod routes;

use crate::config::SessionConfig;
use keygate_platform_access::{
    IdentityMapper, LogoutCoordinator, RoleGate, TokenManager, TokenVerifier,
};
use sqlx::PgPool;
use std::sync::Arc;

pub use middleware::{GatedSession, OptionalAuth, RequireAuth};
pub use oidc::OidcClient;
pub use routes::{callback, login, logout};

/// Shared application state.
pub struct AppState {
    /// Database connection pool.
    pub db_pool: PgPool,
    /// OIDC client for the login flow.
    pub oidc_client: OidcClient,
    /// Session configuration.
    pub session_config: SessionConfig,
    /// Keeps session access tokens fresh.
    pub token_manager: TokenManager,
    /// Maps login claims onto local users and groups.
    pub identity: IdentityMapper,
    /// Builds the provider's end-session redirect.
    pub logout: LogoutCoordinator,
    /// Client for downstream API calls.
    pub http: reqwest::Client,
    /// Downstream API called with the user's bearer token.
    pub downstream_api_url: String,
    /// When set, role gates verify token signatures instead of trusting the session.
    pub verifier: Option<Arc<TokenVerifier>>,
}

impl AppState {
    /// Builds a role gate for a realm role, verified when configured.
    pub fn gate(&self, role: &str) -> RoleGate {
        let gate = RoleGate::require_role(role);
        match &self.verifier {
            Some(verifier) => gate.verified(
                Arc::clone(verifier),
                Some(self.oidc_client.config().expected_audiences()),
            ),
            None => gate,
        }
    }
}
