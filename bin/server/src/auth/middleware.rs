//! Authentication extractors and the role-gate middleware for Axum.

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use keygate_platform_access::{AuthenticatedUser, ClaimSet, GateRejection, RoleGate, SessionId};
use sqlx::PgPool;
use std::sync::Arc;

use super::{
    AppState,
    db::{PgSessionStore, SessionRepository, UserRepository},
};
use crate::error::{ApiError, LOGIN_PATH};

/// Session cookie name.
pub const SESSION_COOKIE: &str = "session";

/// Extractor for requiring an authenticated user.
///
/// If the user is not authenticated, they will be redirected to the login page.
pub struct RequireAuth(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for RequireAuth
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<AppState>::from_ref(state);
        let jar = CookieJar::from_request_parts(parts, state)
            .await
            .map_err(|_| AuthRejection::InternalError)?;

        let session_cookie = jar
            .get(SESSION_COOKIE)
            .ok_or(AuthRejection::NotAuthenticated)?;

        let session_id = SessionId::new(session_cookie.value().to_string());

        let session_repo = SessionRepository::new(app_state.db_pool.clone());
        let session = session_repo
            .find_by_id(&session_id)
            .await
            .map_err(|_| AuthRejection::InternalError)?
            .ok_or(AuthRejection::NotAuthenticated)?;

        if session.is_expired() {
            let _ = session_repo.delete(&session_id).await;
            return Err(AuthRejection::SessionExpired);
        }

        let user_repo = UserRepository::new(app_state.db_pool.clone());
        let user = user_repo
            .find_by_id(session.user_id())
            .await
            .map_err(|_| AuthRejection::InternalError)?
            .ok_or(AuthRejection::NotAuthenticated)?;

        Ok(RequireAuth(AuthenticatedUser::new(session, user)))
    }
}

/// Extractor for optionally getting the authenticated user.
///
/// Returns None if the user is not authenticated.
pub struct OptionalAuth(pub Option<AuthenticatedUser>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match RequireAuth::from_request_parts(parts, state).await {
            Ok(RequireAuth(user)) => Ok(OptionalAuth(Some(user))),
            Err(_) => Ok(OptionalAuth(None)),
        }
    }
}

/// Rejection type for authentication extractors.
#[derive(Debug)]
pub enum AuthRejection {
    NotAuthenticated,
    SessionExpired,
    InternalError,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::NotAuthenticated | Self::SessionExpired => {
                Redirect::to(LOGIN_PATH).into_response()
            }
            Self::InternalError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

/// State for [`enforce_role`]: the gate and where sessions live.
#[derive(Clone)]
pub struct GateLayerState {
    pub pool: PgPool,
    pub gate: RoleGate,
}

/// Session that passed a role gate, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct GatedSession {
    pub session_id: SessionId,
    pub claims: ClaimSet,
}

/// Middleware admitting only sessions whose access token carries the gate's role.
pub async fn enforce_role(
    State(layer): State<GateLayerState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return ApiError::from(GateRejection::AuthenticationRequired).into_response();
    };

    let session_id = SessionId::new(cookie.value().to_string());
    let store = PgSessionStore::new(layer.pool.clone(), session_id.clone());

    match layer.gate.check(&store).await {
        Ok(claims) => {
            request
                .extensions_mut()
                .insert(GatedSession { session_id, claims });
            next.run(request).await
        }
        Err(rejection) => {
            tracing::debug!(
                session = %session_id,
                role = layer.gate.requirement().role(),
                rejection = %rejection,
                "role gate refused request"
            );
            ApiError::from(rejection).into_response()
        }
    }
}
