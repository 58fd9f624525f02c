//! Token lifecycle and claims-based authorization for keygate.
//!
//! This crate is the relying-party core sitting behind an OIDC login:
//! - Claims codec: unverified decode for trusted re-reads, RS256 verification
//!   against the provider's key set for everything else (`codec`, `jwks`)
//! - Token lifecycle: access tokens refreshed ahead of expiry (`token`)
//! - Identity mapping: claims onto local users, realm roles onto groups
//!   (`identity`, `user`, `role`)
//! - Role gate: per-request role checks over the session's token (`gate`)
//! - Logout: session teardown and the provider's end-session redirect (`logout`)
//!
//! Session state is always passed in explicitly as a [`SessionStore`].
//!
//! # Example
//!
//! ```
//! use keygate_platform_access::{GateRejection, MemorySessionStore, RoleGate, SessionStore};
//!
//! # tokio_test_runtime(async {
//! let store = MemorySessionStore::new("sess_abc123");
//! let gate = RoleGate::require_role("admin");
//!
//! // No token yet: the caller should start the login flow.
//! assert_eq!(
//!     gate.check(&store).await,
//!     Err(GateRejection::AuthenticationRequired)
//! );
//! # });
//! # fn tokio_test_runtime(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod auth;
pub mod claims;
pub mod codec;
pub mod error;
pub mod gate;
pub mod identity;
pub mod jwks;
pub mod logout;
pub mod oidc;
pub mod role;
pub mod session;
pub mod token;
pub mod user;

#[cfg(test)]
mod testutil;

// Re-export main types at crate root
pub use auth::{AuthenticatedUser, ClaimsSummary};
pub use claims::{ClaimSet, ClaimValue};
pub use codec::{TokenVerifier, VerifiedClaims, decode_unverified};
pub use error::{
    ConfigError, DirectoryError, IdentityError, ProviderError, StoreError, TokenError,
};
pub use gate::{GateRejection, RoleGate, RoleRequirement};
pub use identity::{
    IdentityMapper, MemoryDirectory, ResolvedUser, UserDirectory, enrich_with_realm_roles,
};
pub use jwks::{HttpJwksSource, JwksCache, JwksSource};
pub use logout::LogoutCoordinator;
pub use oidc::{OidcConfig, OidcConfigBuilder};
pub use role::{Group, RoleSet};
pub use session::{MemorySessionStore, Session, SessionId, SessionStore, TokenSet};
pub use token::{HttpTokenEndpoint, RefreshedTokens, TokenEndpoint, TokenManager};
pub use user::User;
