//! Authenticated request context and claim summaries.
//!
//! - `AuthenticatedUser`: the session and local user behind a request
//! - `ClaimsSummary`: decoded ID/access claims and roles for display, and
//!   the login-completion payload handed to the identity mapper

use keygate_core::UserId;
use serde::Serialize;

use crate::claims::ClaimSet;
use crate::codec::decode_unverified;
use crate::identity::enrich_with_realm_roles;
use crate::session::{Session, TokenSet};
use crate::user::User;

/// Represents an authenticated user context extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    session: Session,
    user: User,
}

impl AuthenticatedUser {
    /// Creates a new authenticated user context.
    #[must_use]
    pub fn new(session: Session, user: User) -> Self {
        Self { session, user }
    }

    /// Returns the authenticated user's ID.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.session.user_id()
    }

    /// Returns the current session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the user record.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }
}

/// Decoded view of a session's tokens.
///
/// Tokens are decoded without verification. Use this for display and for
/// the login-completion payload only, never for authorization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClaimsSummary {
    pub id_claims: ClaimSet,
    pub access_claims: ClaimSet,
    pub realm_roles: Vec<String>,
    /// Roles of the configured client, from `resource_access`.
    pub client_roles: Vec<String>,
}

impl ClaimsSummary {
    /// Decodes `tokens`, reading client roles for `client`.
    ///
    /// Missing or undecodable tokens yield empty claim sets.
    #[must_use]
    pub fn from_tokens(tokens: &TokenSet, client: &str) -> Self {
        let id_claims = decode_or_empty(tokens.id_token.as_deref());
        let access_claims = decode_or_empty(tokens.access_token.as_deref());
        Self {
            realm_roles: access_claims.realm_roles(),
            client_roles: access_claims.resource_roles(client),
            id_claims,
            access_claims,
        }
    }

    /// Claims for the identity mapper: ID-token claims plus access-token realm roles.
    #[must_use]
    pub fn login_payload(&self) -> ClaimSet {
        enrich_with_realm_roles(&self.id_claims, &self.access_claims)
    }
}

fn decode_or_empty(token: Option<&str>) -> ClaimSet {
    token
        .and_then(|token| decode_unverified(token).ok())
        .unwrap_or_default()
}
