//! Claims codec: turning JWTs into claim sets.
//!
//! Two entry points with different guarantees:
//! - [`decode_unverified`] reads the payload segment only. It is for
//!   re-reading tokens that were already validated when they were placed in
//!   the session, e.g. for display or expiry checks.
//! - [`TokenVerifier::verify`] checks the RS256 signature against the
//!   provider's key set, the expiry, and optionally the audience. Only this
//!   path produces [`VerifiedClaims`].

use crate::claims::ClaimSet;
use crate::error::TokenError;
use crate::jwks::JwksCache;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use std::ops::Deref;
use tracing::{debug, instrument};

/// Decodes a token's payload without checking signature or expiry.
///
/// Never base an authorization decision on the result when the token came
/// from an untrusted source.
pub fn decode_unverified(token: &str) -> Result<ClaimSet, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::MalformedToken {
            reason: format!("expected 3 segments, found {}", segments.len()),
        });
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| TokenError::MalformedToken {
            reason: format!("payload is not base64url: {e}"),
        })?;

    serde_json::from_slice(&payload).map_err(|e| TokenError::MalformedToken {
        reason: format!("payload is not a JSON object: {e}"),
    })
}

/// Claims whose signature, expiry, and audience have been checked.
///
/// Constructed only by [`TokenVerifier::verify`].
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedClaims {
    claims: ClaimSet,
}

impl VerifiedClaims {
    /// Consumes the wrapper, returning the plain claim set.
    #[must_use]
    pub fn into_inner(self) -> ClaimSet {
        self.claims
    }
}

impl Deref for VerifiedClaims {
    type Target = ClaimSet;

    fn deref(&self) -> &ClaimSet {
        &self.claims
    }
}

/// Verifies RS256 tokens against an identity provider's published keys.
pub struct TokenVerifier {
    keys: JwksCache,
}

impl TokenVerifier {
    /// Creates a verifier backed by the given key cache.
    #[must_use]
    pub fn new(keys: JwksCache) -> Self {
        Self { keys }
    }

    /// Verifies a token and returns its claims.
    ///
    /// When `expected_audiences` is given, the token's `aud` must share at
    /// least one value with it.
    #[instrument(skip_all, fields(issuer = %self.keys.issuer()))]
    pub async fn verify(
        &self,
        token: &str,
        expected_audiences: Option<&[String]>,
    ) -> Result<VerifiedClaims, TokenError> {
        // Structural problems are reported as malformed before any key lookup.
        decode_unverified(token)?;

        let header = jsonwebtoken::decode_header(token).map_err(|e| TokenError::MalformedToken {
            reason: format!("header: {e}"),
        })?;
        if header.alg != Algorithm::RS256 {
            debug!(alg = ?header.alg, "rejecting token with unsupported algorithm");
            return Err(TokenError::InvalidSignature);
        }

        let key = self.keys.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<ClaimSet>(token, &key, &validation)
            .map_err(|e| map_jwt_error(e.kind()))?;
        let claims = data.claims;

        if let Some(expected) = expected_audiences {
            let actual = claims.audiences();
            if !actual.iter().any(|aud| expected.contains(aud)) {
                return Err(TokenError::AudienceMismatch {
                    expected: expected.to_vec(),
                    actual,
                });
            }
        }

        Ok(VerifiedClaims { claims })
    }
}

fn map_jwt_error(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => TokenError::MalformedToken {
            reason: format!("{kind:?}"),
        },
        _ => TokenError::InvalidSignature,
    }
}
