//! Authentication routes for login, callback, and logout.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Duration as ChronoDuration;
use keygate_platform_access::{ClaimsSummary, IdentityError, Session, SessionId};
use rootcause::prelude::Report;
use serde::Deserialize;
use std::sync::Arc;
use time::Duration as TimeDuration;

use super::{
    AppState,
    db::{PgSessionStore, SessionRepository, generate_session_id},
    middleware::SESSION_COOKIE,
    oidc::AuthState,
};

/// Auth state cookie name (for CSRF protection during OIDC flow).
const AUTH_STATE_COOKIE: &str = "auth_state";

/// Query parameters for the OIDC callback.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

/// Initiates the OIDC login flow by redirecting to the identity provider.
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AuthError> {
    let (auth_url, auth_state) = state.oidc_client.authorization_url();

    // Store the auth state in a secure cookie for validation on callback
    let auth_state_json = serde_json::to_string(&AuthStateData {
        csrf_token: auth_state.csrf_token,
        pkce_verifier: auth_state.pkce_verifier,
        nonce: auth_state.nonce,
    })
    .map_err(|e| AuthError::Internal(format!("failed to serialize auth state: {e}")))?;

    let cookie = Cookie::build((AUTH_STATE_COOKIE, auth_state_json))
        .path("/")
        .http_only(true)
        .secure(state.session_config.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(TimeDuration::minutes(10));

    Ok((jar.add(cookie), Redirect::to(&auth_url)))
}

/// Handles the OIDC callback after the user authenticates with the identity provider.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    jar: CookieJar,
) -> Result<impl IntoResponse, AuthError> {
    let auth_state_cookie = jar
        .get(AUTH_STATE_COOKIE)
        .ok_or(AuthError::MissingAuthState)?;

    let auth_state_data: AuthStateData =
        serde_json::from_str(auth_state_cookie.value()).map_err(|_| AuthError::InvalidAuthState)?;

    if query.state != auth_state_data.csrf_token {
        return Err(AuthError::CsrfMismatch);
    }

    let auth_state = AuthState {
        csrf_token: auth_state_data.csrf_token,
        pkce_verifier: auth_state_data.pkce_verifier,
        nonce: auth_state_data.nonce,
    };

    let tokens = state
        .oidc_client
        .exchange_code(&query.code, &auth_state)
        .await
        .map_err(|e| AuthError::TokenExchange(e.to_string()))?;

    // Profile fields come from the ID token, groups from the access token's realm roles
    let summary = ClaimsSummary::from_tokens(&tokens, state.oidc_client.config().resource_client());
    let resolved = state
        .identity
        .resolve_user(&summary.login_payload())
        .await
        .map_err(AuthError::Identity)?;

    tracing::info!(
        user_id = %resolved.user.id(),
        username = resolved.user.username(),
        created = resolved.created,
        "login completed"
    );

    let session_id = generate_session_id();
    let session_duration = state.session_config.duration_minutes;
    let session = Session::new(
        session_id.clone(),
        resolved.user.id(),
        ChronoDuration::minutes(session_duration),
    );

    SessionRepository::new(state.db_pool.clone())
        .create(&session, &tokens)
        .await
        .map_err(|e| AuthError::Database(e.to_string()))?;

    let session_cookie = Cookie::build((SESSION_COOKIE, session_id.as_str().to_string()))
        .path("/")
        .http_only(true)
        .secure(state.session_config.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(TimeDuration::minutes(session_duration));

    let remove_auth_state = Cookie::build((AUTH_STATE_COOKIE, ""))
        .path("/")
        .max_age(TimeDuration::ZERO);

    let jar = jar.add(session_cookie).add(remove_auth_state);

    Ok((jar, Redirect::to("/")))
}

/// Logs out locally and sends the browser to the provider's end-session endpoint.
pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    let end_session_url = match jar.get(SESSION_COOKIE) {
        Some(session_cookie) => {
            let store = PgSessionStore::new(
                state.db_pool.clone(),
                SessionId::new(session_cookie.value().to_string()),
            );
            state.logout.logout(&store).await
        }
        None => state.logout.end_session_url().clone(),
    };

    let remove_session = Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .max_age(TimeDuration::ZERO);

    (
        jar.add(remove_session),
        Redirect::to(end_session_url.as_str()),
    )
}

/// Serializable auth state for cookie storage.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct AuthStateData {
    csrf_token: String,
    pkce_verifier: String,
    nonce: String,
}

/// Authentication errors.
#[derive(Debug)]
pub enum AuthError {
    MissingAuthState,
    InvalidAuthState,
    CsrfMismatch,
    TokenExchange(String),
    Identity(Report<IdentityError>),
    Database(String),
    Internal(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingAuthState => (StatusCode::BAD_REQUEST, "Missing auth state"),
            Self::InvalidAuthState => (StatusCode::BAD_REQUEST, "Invalid auth state"),
            Self::CsrfMismatch => (StatusCode::BAD_REQUEST, "CSRF token mismatch"),
            Self::TokenExchange(msg) => {
                tracing::error!("Token exchange failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed")
            }
            Self::Identity(report) => match report.current_context() {
                IdentityError::AmbiguousIdentity { .. } | IdentityError::MissingIdentifier => {
                    tracing::warn!(error = %report, "login could not be mapped to a local user");
                    (
                        StatusCode::FORBIDDEN,
                        "Your account could not be matched to a single local user",
                    )
                }
                IdentityError::Directory { .. } => {
                    tracing::error!(error = %report, "user directory failed during login");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                }
            },
            Self::Database(msg) | Self::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, message).into_response()
    }
}
