//! Application routes behind the login.

use axum::{Extension, Json, extract::State};
use keygate_platform_access::{ClaimsSummary, TokenSet};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::auth::{AppState, GatedSession, OptionalAuth, RequireAuth, db::PgSessionStore};
use crate::error::ApiError;

/// Public landing route. Shows who is logged in, if anyone.
pub async fn home(OptionalAuth(auth): OptionalAuth) -> Json<Value> {
    match auth {
        Some(auth) => Json(json!({
            "authenticated": true,
            "username": auth.user().username(),
            "groups": auth.user().groups(),
        })),
        None => Json(json!({ "authenticated": false })),
    }
}

/// Decoded claims of the session's tokens, for display.
pub async fn profile(
    State(state): State<Arc<AppState>>,
    RequireAuth(auth): RequireAuth,
) -> Result<Json<ClaimsSummary>, ApiError> {
    let store = PgSessionStore::new(state.db_pool.clone(), auth.session().id().clone());
    let tokens = TokenSet::load(&store)
        .await
        .map_err(|e| ApiError::Database {
            details: e.to_string(),
        })?;

    Ok(Json(ClaimsSummary::from_tokens(
        &tokens,
        state.oidc_client.config().resource_client(),
    )))
}

#[derive(Debug, Serialize)]
pub struct DownstreamResponse {
    pub status: u16,
    pub body: Value,
}

/// Calls the downstream API with the user's access token, refreshing it first if needed.
pub async fn call_api(
    State(state): State<Arc<AppState>>,
    Extension(gated): Extension<GatedSession>,
) -> Result<Json<DownstreamResponse>, ApiError> {
    let store = PgSessionStore::new(state.db_pool.clone(), gated.session_id);
    let access_token = state
        .token_manager
        .valid_access_token(&store)
        .await
        .ok_or(ApiError::ReauthenticationRequired)?;

    let response = state
        .http
        .get(&state.downstream_api_url)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| ApiError::Downstream {
            details: e.to_string(),
        })?;

    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| ApiError::Downstream {
        details: e.to_string(),
    })?;

    Ok(Json(DownstreamResponse {
        status,
        body: downstream_body(text),
    }))
}

/// JSON bodies pass through as JSON; anything else is returned as text.
fn downstream_body(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Area for holders of the `manager` realm role.
pub async fn manager(Extension(gated): Extension<GatedSession>) -> Json<Value> {
    Json(json!({
        "username": gated.claims.resolved_username(),
        "realm_roles": gated.claims.realm_roles(),
    }))
}
