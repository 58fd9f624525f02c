//! Error types for the platform-access crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `TokenError`: Claims codec failures (decode, signature, expiry, audience)
//! - `ProviderError`: Transport failures talking to the identity provider
//! - `StoreError`: Session store failures
//! - `DirectoryError`: Local user/group directory failures
//! - `IdentityError`: Identity mapping failures at login completion
//! - `ConfigError`: Invalid OIDC configuration

use std::fmt;

/// Errors from decoding or verifying a JWT.
///
/// Verified-decode failures are kept distinct from "no token" so callers can
/// tell tampering or staleness apart from a user who never logged in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Wrong segment count, bad base64url, or a payload that is not a JSON object.
    MalformedToken { reason: String },
    /// The token's `exp` has passed.
    Expired,
    /// The signature does not verify, or the token uses an algorithm other than RS256.
    InvalidSignature,
    /// None of the token's audiences is in the expected set.
    AudienceMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    /// The key id in the header is not present in a freshly fetched key set.
    UnknownSigningKey { kid: Option<String> },
    /// The identity provider's key set could not be fetched.
    KeySetUnavailable { reason: String },
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedToken { reason } => write!(f, "malformed token: {reason}"),
            Self::Expired => write!(f, "token has expired"),
            Self::InvalidSignature => write!(f, "token signature is invalid"),
            Self::AudienceMismatch { expected, actual } => write!(
                f,
                "token audience {actual:?} does not intersect expected {expected:?}"
            ),
            Self::UnknownSigningKey { kid: Some(kid) } => {
                write!(f, "no signing key with id '{kid}'")
            }
            Self::UnknownSigningKey { kid: None } => {
                write!(f, "token header carries no key id")
            }
            Self::KeySetUnavailable { reason } => {
                write!(f, "signing key set unavailable: {reason}")
            }
        }
    }
}

impl std::error::Error for TokenError {}

/// Errors from HTTP exchanges with the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The request could not be sent or the connection failed.
    Transport { details: String },
    /// The request did not complete within the configured timeout.
    Timeout,
    /// The provider answered with a non-success status.
    Status { status: u16 },
    /// The provider answered 2xx with a body we could not use.
    InvalidResponse { details: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { details } => write!(f, "identity provider unreachable: {details}"),
            Self::Timeout => write!(f, "identity provider request timed out"),
            Self::Status { status } => write!(f, "identity provider returned HTTP {status}"),
            Self::InvalidResponse { details } => {
                write!(f, "invalid identity provider response: {details}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            Self::InvalidResponse {
                details: err.to_string(),
            }
        } else {
            Self::Transport {
                details: err.to_string(),
            }
        }
    }
}

/// Errors from the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store failed.
    Backend { details: String },
    /// The store does not hold entries under this key.
    UnsupportedKey { key: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { details } => write!(f, "session store error: {details}"),
            Self::UnsupportedKey { key } => write!(f, "unsupported session key: {key}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the local user/group directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The backing store failed.
    Backend { details: String },
    /// A record expected to exist was not found.
    NotFound { entity: String },
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { details } => write!(f, "user directory error: {details}"),
            Self::NotFound { entity } => write!(f, "{entity} not found"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Errors from mapping identity-provider claims onto a local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// None of `preferred_username`, `email`, `sub` carried a value.
    MissingIdentifier,
    /// More than one local user matched the email claim.
    AmbiguousIdentity { email: String, matches: usize },
    /// The directory failed while resolving the user.
    Directory { details: String },
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIdentifier => {
                write!(f, "claims carry no preferred_username, email, or sub")
            }
            Self::AmbiguousIdentity { email, matches } => {
                write!(f, "{matches} local users share the email {email}")
            }
            Self::Directory { details } => write!(f, "directory failure: {details}"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Errors from validating the OIDC configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A configured URL does not parse.
    InvalidUrl { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_token_display_includes_reason() {
        let err = TokenError::MalformedToken {
            reason: "expected 3 segments, found 2".to_string(),
        };
        assert!(err.to_string().contains("malformed"));
        assert!(err.to_string().contains("3 segments"));
    }

    #[test]
    fn audience_mismatch_display_lists_both_sides() {
        let err = TokenError::AudienceMismatch {
            expected: vec!["portal-app".to_string()],
            actual: vec!["other".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("portal-app"));
        assert!(text.contains("other"));
    }

    #[test]
    fn unknown_signing_key_display_distinguishes_missing_kid() {
        let named = TokenError::UnknownSigningKey {
            kid: Some("rotated-1".to_string()),
        };
        let unnamed = TokenError::UnknownSigningKey { kid: None };
        assert!(named.to_string().contains("rotated-1"));
        assert!(unnamed.to_string().contains("no key id"));
    }

    #[test]
    fn provider_status_display() {
        let err = ProviderError::Status { status: 400 };
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn ambiguous_identity_display() {
        let err = IdentityError::AmbiguousIdentity {
            email: "alice@example.com".to_string(),
            matches: 2,
        };
        assert!(err.to_string().contains("2 local users"));
        assert!(err.to_string().contains("alice@example.com"));
    }

    #[test]
    fn store_error_unsupported_key_display() {
        let err = StoreError::UnsupportedKey {
            key: "theme".to_string(),
        };
        assert!(err.to_string().contains("theme"));
    }
}
