//! Error responses for server routes.
//!
//! Internal details are logged, never returned to the browser. Gate
//! rejections keep their distinction on the wire: a missing token restarts
//! login, an unusable token is 401, a missing role is 403 naming the role.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use keygate_platform_access::GateRejection;
use serde_json::json;
use std::fmt;

/// Where unauthenticated browsers are sent.
pub const LOGIN_PATH: &str = "/auth/login";

/// Errors surfaced by application routes.
#[derive(Debug)]
pub enum ApiError {
    /// A role gate refused the request.
    Gate(GateRejection),
    /// No usable access token; the user must log in again.
    ReauthenticationRequired,
    /// The downstream API call failed.
    Downstream { details: String },
    /// Database error.
    Database { details: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gate(rejection) => write!(f, "{rejection}"),
            Self::ReauthenticationRequired => write!(f, "re-authentication required"),
            Self::Downstream { details } => write!(f, "downstream API error: {details}"),
            Self::Database { details } => write!(f, "database error: {details}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<GateRejection> for ApiError {
    fn from(rejection: GateRejection) -> Self {
        Self::Gate(rejection)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            Self::Gate(GateRejection::AuthenticationRequired) | Self::ReauthenticationRequired => {
                Redirect::to(LOGIN_PATH).into_response()
            }
            Self::Gate(GateRejection::InvalidToken { reason }) => {
                tracing::info!(reason = %reason, "rejected unusable session token");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"error": "invalid_token"})),
                )
                    .into_response()
            }
            Self::Gate(GateRejection::MissingRole { role, client }) => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "missing_role",
                    "role": role,
                    "client": client,
                    "message": message,
                })),
            )
                .into_response(),
            Self::Downstream { details } => {
                tracing::error!(details = %details, "downstream API call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "downstream_unavailable"})),
                )
                    .into_response()
            }
            Self::Database { details } => {
                tracing::error!(details = %details, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
