//! Token lifecycle: handing callers an access token that is good to use.
//!
//! [`TokenManager::valid_access_token`] returns the stored access token while
//! it is comfortably inside its lifetime, and otherwise exchanges the refresh
//! token at the provider's token endpoint. Every failure on the refresh path
//! (provider, transport, malformed response, session store) collapses to
//! `None`: the caller's only recovery is to send the user through login again.
//!
//! Refreshes for the same session are serialized. A caller that waited on
//! another caller's refresh re-reads the store and reuses the new token.

use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::codec::decode_unverified;
use crate::error::{ProviderError, StoreError};
use crate::oidc::OidcConfig;
use crate::session::{ACCESS_TOKEN, REFRESH_TOKEN, SessionId, SessionStore, TokenSet};

/// Default margin before `exp` at which a token is refreshed.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Default timeout for a refresh exchange.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// `None` when the provider did not rotate the refresh token.
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<i64>,
}

/// The provider's token endpoint, as far as refresh is concerned.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchanges a refresh token for new tokens.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, Report<ProviderError>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TryFrom<TokenResponse> for RefreshedTokens {
    type Error = ProviderError;

    fn try_from(response: TokenResponse) -> Result<Self, Self::Error> {
        let access_token =
            non_empty(response.access_token).ok_or_else(|| ProviderError::InvalidResponse {
                details: "token response carries no access_token".to_string(),
            })?;
        Ok(Self {
            access_token,
            refresh_token: non_empty(response.refresh_token),
            id_token: non_empty(response.id_token),
            expires_in: response.expires_in,
        })
    }
}

/// Posts `grant_type=refresh_token` to the provider's token endpoint.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    /// Creates an endpoint client with the given request timeout.
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, Report<ProviderError>> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Creates an endpoint client from OIDC configuration.
    pub fn from_config(config: &OidcConfig) -> Result<Self, Report<ProviderError>> {
        Self::new(
            config.token_endpoint(),
            config.client_id(),
            config.client_secret(),
            config.refresh_timeout(),
        )
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    #[instrument(skip_all, fields(token_url = %self.token_url))]
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, Report<ProviderError>> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
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

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    details: e.to_string(),
                })?;
        Ok(RefreshedTokens::try_from(body)?)
    }
}

type RefreshLock = Arc<tokio::sync::Mutex<()>>;

/// A caller's share of a session's refresh lock.
///
/// Dropping it, including when the request is cancelled mid-refresh, removes
/// the session's entry once no other caller holds one.
struct RefreshSlot<'a> {
    manager: &'a TokenManager,
    session_id: SessionId,
    lock: RefreshLock,
}

impl<'a> RefreshSlot<'a> {
    fn acquire(manager: &'a TokenManager, session_id: &SessionId) -> Self {
        Self {
            manager,
            session_id: session_id.clone(),
            lock: manager.refresh_lock(session_id),
        }
    }

    fn lock(&self) -> &tokio::sync::Mutex<()> {
        &self.lock
    }
}

impl Drop for RefreshSlot<'_> {
    fn drop(&mut self) {
        self.manager.release_refresh_lock(&self.session_id, &self.lock);
    }
}

/// Hands out access tokens that will not expire mid-request.
pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    expiry_skew: Duration,
    refresh_locks: Mutex<HashMap<SessionId, RefreshLock>>,
}

impl TokenManager {
    /// Creates a manager refreshing through `endpoint`.
    #[must_use]
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            expiry_skew: DEFAULT_EXPIRY_SKEW,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the margin before `exp` at which a token is refreshed.
    #[must_use]
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    /// Returns an access token valid beyond the expiry skew, refreshing if needed.
    ///
    /// `None` means the user must re-authenticate.
    #[instrument(skip_all, fields(session = %store.session_id()))]
    pub async fn valid_access_token(&self, store: &dyn SessionStore) -> Option<String> {
        match self.resolve(store).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "session store failed while resolving access token");
                None
            }
        }
    }

    async fn resolve(&self, store: &dyn SessionStore) -> Result<Option<String>, Report<StoreError>> {
        if let Some(token) = self.usable_access_token(store).await? {
            return Ok(Some(token));
        }

        let slot = RefreshSlot::acquire(self, store.session_id());
        self.refresh_exclusive(store, slot.lock()).await
    }

    async fn refresh_exclusive(
        &self,
        store: &dyn SessionStore,
        lock: &tokio::sync::Mutex<()>,
    ) -> Result<Option<String>, Report<StoreError>> {
        let _guard = lock.lock().await;

        // A concurrent caller may have refreshed while this one waited.
        if let Some(token) = self.usable_access_token(store).await? {
            debug!("access token refreshed by a concurrent request");
            return Ok(Some(token));
        }

        let Some(refresh_token) = non_empty(store.get(REFRESH_TOKEN).await?) else {
            debug!("no refresh token in session");
            return Ok(None);
        };

        let tokens = match self.endpoint.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                return Ok(None);
            }
        };

        // An unrotated refresh token stays as it is.
        TokenSet {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
        }
        .save(store)
        .await?;
        debug!(
            rotated_refresh_token = tokens.refresh_token.is_some(),
            expires_in = ?tokens.expires_in,
            "access token refreshed"
        );
        Ok(Some(tokens.access_token))
    }

    /// Returns the stored access token if it outlives the expiry skew.
    async fn usable_access_token(
        &self,
        store: &dyn SessionStore,
    ) -> Result<Option<String>, Report<StoreError>> {
        let Some(token) = store.get(ACCESS_TOKEN).await? else {
            return Ok(None);
        };

        let claims = match decode_unverified(&token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "stored access token is unreadable");
                return Ok(None);
            }
        };

        let skew = i64::try_from(self.expiry_skew.as_secs()).unwrap_or(i64::MAX);
        let deadline = chrono::Utc::now().timestamp().saturating_add(skew);
        match claims.expires_at() {
            Some(exp) if exp > deadline => Ok(Some(token)),
            _ => Ok(None),
        }
    }

    fn refresh_lock(&self, session_id: &SessionId) -> RefreshLock {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.clone()).or_default())
    }

    /// Drops the session's lock entry if `held` is the last caller's share.
    ///
    /// Shares are only cloned under the map lock, so the count is stable here.
    fn release_refresh_lock(&self, session_id: &SessionId, held: &RefreshLock) {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2)
        {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ID_TOKEN, MemorySessionStore};
    use crate::testutil::{access_token_with, serve_local};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token endpoint double that records calls and replays a fixed outcome.
    struct StubEndpoint {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
        outcome: Result<RefreshedTokens, ProviderError>,
        delay: Duration,
    }

    impl StubEndpoint {
        fn returning(tokens: RefreshedTokens) -> Arc<Self> {
            Self::build(Ok(tokens), Duration::ZERO)
        }

        fn failing(err: ProviderError) -> Arc<Self> {
            Self::build(Err(err), Duration::ZERO)
        }

        fn build(outcome: Result<RefreshedTokens, ProviderError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                outcome,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for StubEndpoint {
        async fn refresh(
            &self,
            refresh_token: &str,
        ) -> Result<RefreshedTokens, Report<ProviderError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .expect("lock")
                .push(refresh_token.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone().map_err(|e| e.into())
        }
    }

    fn refreshed(access_token: &str) -> RefreshedTokens {
        RefreshedTokens {
            access_token: access_token.to_string(),
            refresh_token: None,
            id_token: None,
            expires_in: Some(300),
        }
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_network_call() {
        let token = access_token_with(120, &["user"]);
        let store = MemorySessionStore::with_entries(
            "sess_1",
            [(ACCESS_TOKEN, token.as_str()), (REFRESH_TOKEN, "R1")],
        );
        let endpoint = StubEndpoint::returning(refreshed("unused"));
        let manager = TokenManager::new(endpoint.clone());

        assert_eq!(manager.valid_access_token(&store).await, Some(token));
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed_once() {
        let token = access_token_with(10, &["user"]);
        let store = MemorySessionStore::with_entries(
            "sess_1",
            [(ACCESS_TOKEN, token.as_str()), (REFRESH_TOKEN, "R1")],
        );
        let endpoint = StubEndpoint::returning(refreshed("T2"));
        let manager = TokenManager::new(endpoint.clone());

        assert_eq!(
            manager.valid_access_token(&store).await.as_deref(),
            Some("T2")
        );
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(*endpoint.seen.lock().expect("lock"), vec!["R1".to_string()]);
    }

    #[tokio::test]
    async fn expired_token_refresh_keeps_refresh_token_when_not_rotated() {
        let expired = access_token_with(-5, &["user"]);
        let store = MemorySessionStore::with_entries(
            "sess_1",
            [(ACCESS_TOKEN, expired.as_str()), (REFRESH_TOKEN, "R1")],
        );
        let manager = TokenManager::new(StubEndpoint::returning(refreshed("T2")));

        let token = manager.valid_access_token(&store).await;

        assert_eq!(token.as_deref(), Some("T2"));
        assert_eq!(
            store.get(ACCESS_TOKEN).await.expect("get").as_deref(),
            Some("T2")
        );
        assert_eq!(
            store.get(REFRESH_TOKEN).await.expect("get").as_deref(),
            Some("R1")
        );
    }

    #[tokio::test]
    async fn rotated_refresh_and_id_tokens_are_persisted() {
        let store = MemorySessionStore::with_entries("sess_1", [(REFRESH_TOKEN, "R1")]);
        let manager = TokenManager::new(StubEndpoint::returning(RefreshedTokens {
            access_token: "T2".to_string(),
            refresh_token: Some("R2".to_string()),
            id_token: Some("I2".to_string()),
            expires_in: Some(300),
        }));

        assert_eq!(
            manager.valid_access_token(&store).await.as_deref(),
            Some("T2")
        );
        assert_eq!(
            store.get(REFRESH_TOKEN).await.expect("get").as_deref(),
            Some("R2")
        );
        assert_eq!(store.get(ID_TOKEN).await.expect("get").as_deref(), Some("I2"));
    }

    #[tokio::test]
    async fn malformed_stored_token_triggers_refresh() {
        let store = MemorySessionStore::with_entries(
            "sess_1",
            [(ACCESS_TOKEN, "garbage"), (REFRESH_TOKEN, "R1")],
        );
        let endpoint = StubEndpoint::returning(refreshed("T2"));
        let manager = TokenManager::new(endpoint.clone());

        assert_eq!(
            manager.valid_access_token(&store).await.as_deref(),
            Some("T2")
        );
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_yields_none() {
        let expired = access_token_with(-5, &[]);
        let store = MemorySessionStore::with_entries("sess_1", [(ACCESS_TOKEN, expired.as_str())]);
        let endpoint = StubEndpoint::returning(refreshed("T2"));
        let manager = TokenManager::new(endpoint.clone());

        assert_eq!(manager.valid_access_token(&store).await, None);
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failures_yield_none() {
        for err in [
            ProviderError::Status { status: 400 },
            ProviderError::Timeout,
            ProviderError::Transport {
                details: "connection refused".to_string(),
            },
            ProviderError::InvalidResponse {
                details: "no access_token".to_string(),
            },
        ] {
            let expired = access_token_with(-5, &[]);
            let store = MemorySessionStore::with_entries(
                "sess_1",
                [(ACCESS_TOKEN, expired.as_str()), (REFRESH_TOKEN, "R1")],
            );
            let manager = TokenManager::new(StubEndpoint::failing(err.clone()));

            assert_eq!(manager.valid_access_token(&store).await, None, "{err}");
            assert_eq!(
                store.get(ACCESS_TOKEN).await.expect("get"),
                Some(expired),
                "stored token untouched on {err}"
            );
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let fresh = access_token_with(300, &["user"]);
        let store = MemorySessionStore::with_entries("sess_1", [(REFRESH_TOKEN, "R1")]);
        let endpoint = StubEndpoint::build(Ok(refreshed(&fresh)), Duration::from_millis(50));
        let manager = TokenManager::new(endpoint.clone());

        let (a, b, c) = tokio::join!(
            manager.valid_access_token(&store),
            manager.valid_access_token(&store),
            manager.valid_access_token(&store),
        );

        assert_eq!(endpoint.calls(), 1);
        assert_eq!(a.as_deref(), Some(fresh.as_str()));
        assert_eq!(b, a);
        assert_eq!(c, a);
        assert_eq!(manager.tracked_sessions(), 0);
    }

    #[tokio::test]
    async fn cancelled_refresh_releases_session_lock() {
        let expired = access_token_with(-5, &[]);
        let store = MemorySessionStore::with_entries(
            "sess_1",
            [(ACCESS_TOKEN, expired.as_str()), (REFRESH_TOKEN, "R1")],
        );
        let endpoint = StubEndpoint::build(Ok(refreshed("T2")), Duration::from_secs(5));
        let manager = TokenManager::new(endpoint.clone());

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            manager.valid_access_token(&store),
        )
        .await;

        assert!(outcome.is_err(), "refresh should still be in flight");
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(manager.tracked_sessions(), 0);
    }

    #[test]
    fn empty_fields_in_token_response_read_as_absent() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "T2",
            "refresh_token": "",
            "expires_in": 300,
        }))
        .expect("parses");
        let tokens = RefreshedTokens::try_from(response).expect("valid");
        assert_eq!(tokens.refresh_token, None);

        let response: TokenResponse =
            serde_json::from_value(json!({"access_token": ""})).expect("parses");
        assert!(RefreshedTokens::try_from(response).is_err());
    }

    #[tokio::test]
    async fn http_endpoint_posts_refresh_grant() {
        let router = Router::new().route(
            "/token",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("grant_type").map(String::as_str), Some("refresh_token"));
                assert_eq!(form.get("client_id").map(String::as_str), Some("portal-app"));
                assert_eq!(form.get("client_secret").map(String::as_str), Some("s3cret"));
                match form.get("refresh_token").map(String::as_str) {
                    Some("R1") => (
                        StatusCode::OK,
                        Json(json!({"access_token": "T2", "expires_in": 300})),
                    ),
                    _ => (
                        StatusCode::BAD_REQUEST,
                        Json(json!({"error": "invalid_grant"})),
                    ),
                }
            }),
        );
        let base = serve_local(router).await;
        let endpoint = HttpTokenEndpoint::new(
            format!("{base}/token"),
            "portal-app",
            "s3cret",
            DEFAULT_REFRESH_TIMEOUT,
        )
        .expect("client");

        let tokens = endpoint.refresh("R1").await.expect("refreshes");
        assert_eq!(tokens, refreshed("T2"));

        let err = endpoint.refresh("stale").await.expect_err("rejected");
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn http_endpoint_times_out() {
        let router = Router::new().route(
            "/token",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"access_token": "late"}))
            }),
        );
        let base = serve_local(router).await;
        let endpoint = HttpTokenEndpoint::new(
            format!("{base}/token"),
            "portal-app",
            "s3cret",
            Duration::from_millis(100),
        )
        .expect("client");

        let err = endpoint.refresh("R1").await.expect_err("times out");
        assert!(err.to_string().contains("timed out"));
    }
}
