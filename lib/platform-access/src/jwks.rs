//! Identity-provider signing keys and their cache.
//!
//! Verifying a token needs the provider's published JSON Web Key Set. Key
//! sets are cached per issuer and rebuilt wholesale: when the cached entry
//! is stale, or when a token names a key id the cached set does not hold
//! (key rotation), the full set is refetched and the entry replaced.
//!
//! Lookups that need a fetch join the one already in flight, so a burst of
//! tokens signed with a freshly rotated key costs a single request.

use crate::error::{ProviderError, TokenError};
use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use moka::future::Cache;
use rootcause::prelude::Report;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Default lifetime of a cached key set.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(300);

/// One entry per issuer; a verifier normally trusts a single realm.
const MAX_CACHED_ISSUERS: u64 = 16;

/// Timeout applied to key set fetches.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where verification keys come from.
#[async_trait]
pub trait JwksSource: Send + Sync {
    /// The issuer this source publishes keys for. Used as the cache key.
    fn issuer(&self) -> &str;

    /// Fetches the current key set.
    async fn fetch(&self) -> Result<JwkSet, Report<ProviderError>>;
}

/// Fetches key sets from `{issuer}/protocol/openid-connect/certs`.
#[derive(Debug, Clone)]
pub struct HttpJwksSource {
    http: reqwest::Client,
    issuer: String,
    certs_url: String,
}

impl HttpJwksSource {
    /// Creates a source for the given issuer and certs endpoint.
    pub fn new(
        issuer: impl Into<String>,
        certs_url: impl Into<String>,
    ) -> Result<Self, Report<ProviderError>> {
        let http = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            http,
            issuer: issuer.into(),
            certs_url: certs_url.into(),
        })
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    #[instrument(skip(self), fields(issuer = %self.issuer))]
    async fn fetch(&self) -> Result<JwkSet, Report<ProviderError>> {
        let response = self
            .http
            .get(&self.certs_url)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
            }
            .into());
        }

        let keys: JwkSet = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            details: e.to_string(),
        })?;
        debug!(key_count = keys.keys.len(), "fetched signing keys");
        Ok(keys)
    }
}

/// Per-issuer cache of signing keys, shared read-only across verifications.
///
/// Concurrent lookups that find no fresh entry share one fetch.
pub struct JwksCache {
    source: Arc<dyn JwksSource>,
    entries: Cache<String, Arc<JwkSet>>,
    refetch: Mutex<()>,
}

impl JwksCache {
    /// Creates a cache in front of `source`.
    #[must_use]
    pub fn new(source: Arc<dyn JwksSource>, ttl: Duration) -> Self {
        Self {
            source,
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(MAX_CACHED_ISSUERS)
                .build(),
            refetch: Mutex::new(()),
        }
    }

    /// The issuer whose keys this cache holds.
    #[must_use]
    pub fn issuer(&self) -> &str {
        self.source.issuer()
    }

    /// Returns the decoding key for `kid`.
    ///
    /// A fresh cached set is tried first; on a miss the set is refetched once
    /// and the entry replaced.
    pub async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, TokenError> {
        let keys = self.current().await?;
        if let Some(key) = find_decoding_key(&keys, kid) {
            return Ok(key);
        }

        debug!(kid = ?kid, issuer = %self.issuer(), "signing key not cached, refetching key set");
        let keys = self.refetch_after_miss(&keys).await?;
        find_decoding_key(&keys, kid).ok_or_else(|| TokenError::UnknownSigningKey {
            kid: kid.map(str::to_string),
        })
    }

    /// The cached key set, fetched if absent or expired.
    async fn current(&self) -> Result<Arc<JwkSet>, TokenError> {
        self.entries
            .try_get_with(self.issuer().to_string(), async {
                self.source.fetch().await.map(Arc::new).map_err(|e| {
                    warn!(error = %e, issuer = %self.issuer(), "failed to fetch signing keys");
                    TokenError::KeySetUnavailable {
                        reason: e.to_string(),
                    }
                })
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Replaces `seen` unless another caller already replaced it.
    async fn refetch_after_miss(&self, seen: &Arc<JwkSet>) -> Result<Arc<JwkSet>, TokenError> {
        let _guard = self.refetch.lock().await;

        if let Some(current) = self.entries.get(self.issuer()).await {
            if !Arc::ptr_eq(&current, seen) {
                return Ok(current);
            }
        }

        self.entries.invalidate(self.issuer()).await;
        self.current().await
    }
}

/// Finds an RSA key by id. A token without `kid` matches only a single-key set.
fn find_decoding_key(keys: &JwkSet, kid: Option<&str>) -> Option<DecodingKey> {
    let jwk = match kid {
        Some(kid) => keys.find(kid)?,
        None if keys.keys.len() == 1 => keys.keys.first()?,
        None => return None,
    };

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        _ => None,
    }
}
