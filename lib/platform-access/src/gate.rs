//! Role gate: permitting an operation only for sessions holding a role.
//!
//! Each check re-derives the decision from the session's current access
//! token; nothing is remembered between checks.
//!
//! | session state                    | outcome                              |
//! |----------------------------------|--------------------------------------|
//! | no access token                  | [`GateRejection::AuthenticationRequired`] |
//! | token does not decode            | [`GateRejection::InvalidToken`]      |
//! | token decodes, role missing      | [`GateRejection::MissingRole`]       |
//! | token decodes, role present      | permitted                            |
//!
//! By default the stored token is trusted as-is: it was placed in the session
//! by a verified code exchange. A gate built with [`RoleGate::verified`]
//! additionally checks signature and expiry on every call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::claims::ClaimSet;
use crate::codec::{TokenVerifier, decode_unverified};
use crate::role::RoleSet;
use crate::session::{ACCESS_TOKEN, SessionStore};

/// The role a gate demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRequirement {
    /// A realm role from `realm_access.roles`.
    Realm(String),
    /// A client role from `resource_access.<client>.roles`.
    Client { client: String, role: String },
}

impl RoleRequirement {
    /// Returns the required role name.
    #[must_use]
    pub fn role(&self) -> &str {
        match self {
            Self::Realm(role) | Self::Client { role, .. } => role,
        }
    }

    fn is_satisfied_by(&self, claims: &ClaimSet) -> bool {
        match self {
            Self::Realm(role) => RoleSet::from_iter(claims.realm_roles()).contains(role),
            Self::Client { client, role } => {
                RoleSet::from_iter(claims.resource_roles(client)).contains(role)
            }
        }
    }

    fn rejection(&self) -> GateRejection {
        match self {
            Self::Realm(role) => GateRejection::MissingRole {
                role: role.clone(),
                client: None,
            },
            Self::Client { client, role } => GateRejection::MissingRole {
                role: role.clone(),
                client: Some(client.clone()),
            },
        }
    }
}

/// Why a gate refused to run an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    /// No access token in the session. Recoverable by logging in.
    AuthenticationRequired,
    /// An access token is present but unusable.
    InvalidToken { reason: String },
    /// The user is authenticated but lacks the required role.
    MissingRole {
        role: String,
        client: Option<String>,
    },
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationRequired => write!(f, "authentication required"),
            Self::InvalidToken { reason } => write!(f, "invalid token: {reason}"),
            Self::MissingRole { role, client: None } => {
                write!(f, "missing required role '{role}'")
            }
            Self::MissingRole {
                role,
                client: Some(client),
            } => write!(f, "missing required role '{role}' for client '{client}'"),
        }
    }
}

impl std::error::Error for GateRejection {}

/// A reusable authorization check for one role.
#[derive(Clone)]
pub struct RoleGate {
    requirement: RoleRequirement,
    verification: Option<Verification>,
}

#[derive(Clone)]
struct Verification {
    verifier: Arc<TokenVerifier>,
    expected_audiences: Option<Vec<String>>,
}

impl RoleGate {
    /// Gate on a realm role.
    #[must_use]
    pub fn require_role(role: impl Into<String>) -> Self {
        Self {
            requirement: RoleRequirement::Realm(role.into()),
            verification: None,
        }
    }

    /// Gate on a client role of `client`.
    #[must_use]
    pub fn require_client_role(client: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            requirement: RoleRequirement::Client {
                client: client.into(),
                role: role.into(),
            },
            verification: None,
        }
    }

    /// Verifies the stored token's signature and expiry on every check.
    #[must_use]
    pub fn verified(
        mut self,
        verifier: Arc<TokenVerifier>,
        expected_audiences: Option<Vec<String>>,
    ) -> Self {
        self.verification = Some(Verification {
            verifier,
            expected_audiences,
        });
        self
    }

    #[must_use]
    pub fn requirement(&self) -> &RoleRequirement {
        &self.requirement
    }

    /// Decides whether the session may proceed, returning its claims if so.
    pub async fn check(&self, store: &dyn SessionStore) -> Result<ClaimSet, GateRejection> {
        let token = match store.get(ACCESS_TOKEN).await {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                debug!(session = %store.session_id(), "no access token in session");
                return Err(GateRejection::AuthenticationRequired);
            }
            Err(e) => {
                warn!(session = %store.session_id(), error = %e, "session store unreadable at role gate");
                return Err(GateRejection::AuthenticationRequired);
            }
        };

        let claims = self.decode(&token).await?;

        if self.requirement.is_satisfied_by(&claims) {
            Ok(claims)
        } else {
            debug!(
                session = %store.session_id(),
                role = self.requirement.role(),
                "required role missing"
            );
            Err(self.requirement.rejection())
        }
    }

    /// Runs `operation` with the session's claims if the check permits it.
    pub async fn guard<F, Fut, T>(
        &self,
        store: &dyn SessionStore,
        operation: F,
    ) -> Result<T, GateRejection>
    where
        F: FnOnce(ClaimSet) -> Fut,
        Fut: Future<Output = T>,
    {
        let claims = self.check(store).await?;
        Ok(operation(claims).await)
    }

    async fn decode(&self, token: &str) -> Result<ClaimSet, GateRejection> {
        let decoded = match &self.verification {
            None => decode_unverified(token),
            Some(v) => v
                .verifier
                .verify(token, v.expected_audiences.as_deref())
                .await
                .map(|claims| claims.into_inner()),
        };
        decoded.map_err(|e| GateRejection::InvalidToken {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, StoreError};
    use crate::jwks::{DEFAULT_JWKS_TTL, JwksCache, JwksSource};
    use crate::session::{MemorySessionStore, SessionId};
    use crate::testutil::{
        ISSUER, access_token_with, forged_token, now, primary_jwks, signed_token, unsigned_token,
    };
    use async_trait::async_trait;
    use jsonwebtoken::jwk::JwkSet;
    use rootcause::prelude::Report;
    use serde_json::json;

    fn session_with(token: &str) -> MemorySessionStore {
        MemorySessionStore::with_entries("sess_1", [(ACCESS_TOKEN, token)])
    }

    #[tokio::test]
    async fn permits_when_role_present() {
        let store = session_with(&access_token_with(300, &["admin", "user"]));
        let claims = RoleGate::require_role("admin")
            .check(&store)
            .await
            .expect("permitted");
        assert_eq!(claims.subject(), Some("f3a1c2"));
    }

    #[tokio::test]
    async fn denies_naming_missing_role() {
        let store = session_with(&access_token_with(300, &["user"]));
        let rejection = RoleGate::require_role("admin")
            .check(&store)
            .await
            .expect_err("denied");

        assert_eq!(
            rejection,
            GateRejection::MissingRole {
                role: "admin".to_string(),
                client: None,
            }
        );
        assert!(rejection.to_string().contains("admin"));
    }

    #[tokio::test]
    async fn absent_token_requires_authentication() {
        let empty = MemorySessionStore::new("sess_1");
        let blank = session_with("");
        let gate = RoleGate::require_role("admin");

        assert_eq!(
            gate.check(&empty).await,
            Err(GateRejection::AuthenticationRequired)
        );
        assert_eq!(
            gate.check(&blank).await,
            Err(GateRejection::AuthenticationRequired)
        );
    }

    #[tokio::test]
    async fn undecodable_token_is_invalid() {
        let store = session_with("not-a-jwt");
        let rejection = RoleGate::require_role("admin")
            .check(&store)
            .await
            .expect_err("invalid");
        assert!(matches!(rejection, GateRejection::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn token_without_realm_access_is_missing_role() {
        let store = session_with(&unsigned_token(&json!({"sub": "f3a1c2"})));
        let rejection = RoleGate::require_role("user")
            .check(&store)
            .await
            .expect_err("no roles");
        assert!(matches!(rejection, GateRejection::MissingRole { .. }));
    }

    #[tokio::test]
    async fn unverified_gate_ignores_expiry() {
        let store = session_with(&access_token_with(-600, &["admin"]));
        assert!(RoleGate::require_role("admin").check(&store).await.is_ok());
    }

    #[tokio::test]
    async fn client_role_reads_resource_access() {
        let token = unsigned_token(&json!({
            "sub": "f3a1c2",
            "realm_access": {"roles": ["admin"]},
            "resource_access": {"reports-api": {"roles": ["viewer"]}},
        }));
        let store = session_with(&token);

        assert!(
            RoleGate::require_client_role("reports-api", "viewer")
                .check(&store)
                .await
                .is_ok()
        );
        let rejection = RoleGate::require_client_role("reports-api", "admin")
            .check(&store)
            .await
            .expect_err("realm role does not satisfy client role");
        assert_eq!(
            rejection.to_string(),
            "missing required role 'admin' for client 'reports-api'"
        );
    }

    #[tokio::test]
    async fn guard_runs_operation_only_when_permitted() {
        let gate = RoleGate::require_role("admin");

        let permitted = session_with(&access_token_with(300, &["admin"]));
        let result = gate
            .guard(&permitted, |claims| async move {
                claims.subject().map(str::to_string)
            })
            .await;
        assert_eq!(result, Ok(Some("f3a1c2".to_string())));

        let denied = session_with(&access_token_with(300, &["user"]));
        let mut ran = false;
        let result = gate
            .guard(&denied, |_| {
                ran = true;
                async {}
            })
            .await;
        assert!(result.is_err());
        assert!(!ran);
    }

    struct BrokenStore(SessionId);

    #[async_trait]
    impl SessionStore for BrokenStore {
        fn session_id(&self) -> &SessionId {
            &self.0
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, Report<StoreError>> {
            Err(StoreError::Backend {
                details: "connection reset".to_string(),
            }
            .into())
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), Report<StoreError>> {
            Ok(())
        }

        async fn clear(&self) -> Result<(), Report<StoreError>> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failure_requires_authentication() {
        let store = BrokenStore(SessionId::from("sess_1"));
        assert_eq!(
            RoleGate::require_role("admin").check(&store).await,
            Err(GateRejection::AuthenticationRequired)
        );
    }

    struct StaticSource;

    #[async_trait]
    impl JwksSource for StaticSource {
        fn issuer(&self) -> &str {
            ISSUER
        }

        async fn fetch(&self) -> Result<JwkSet, Report<ProviderError>> {
            Ok(primary_jwks())
        }
    }

    fn verified_gate(role: &str) -> RoleGate {
        let verifier = TokenVerifier::new(JwksCache::new(Arc::new(StaticSource), DEFAULT_JWKS_TTL));
        RoleGate::require_role(role).verified(Arc::new(verifier), Some(vec!["portal-app".to_string()]))
    }

    #[tokio::test]
    async fn verified_gate_accepts_signed_token() {
        let token = signed_token(&json!({
            "sub": "f3a1c2",
            "exp": now() + 300,
            "aud": "portal-app",
            "realm_access": {"roles": ["admin"]},
        }));
        assert!(verified_gate("admin").check(&session_with(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn verified_gate_rejects_forged_and_expired_tokens() {
        let forged = forged_token(&json!({
            "sub": "f3a1c2",
            "exp": now() + 300,
            "aud": "portal-app",
            "realm_access": {"roles": ["admin"]},
        }));
        let expired = signed_token(&json!({
            "sub": "f3a1c2",
            "exp": now() - 5,
            "aud": "portal-app",
            "realm_access": {"roles": ["admin"]},
        }));
        let gate = verified_gate("admin");

        for token in [forged, expired] {
            let rejection = gate
                .check(&session_with(&token))
                .await
                .expect_err("rejected");
            assert!(matches!(rejection, GateRejection::InvalidToken { .. }));
        }
    }
}
