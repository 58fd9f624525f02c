//! keygate web server.
//!
//! Wires the OIDC relying-party core to PostgreSQL-backed sessions and an
//! Axum router: login, callback and logout routes, plus a few routes behind
//! realm-role gates.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;

use axum::{Router, middleware::from_fn_with_state, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use auth::{
    AppState,
    middleware::{GateLayerState, enforce_role},
};

/// Realm role required by `/call-api`.
pub const ADMIN_ROLE: &str = "admin";
/// Realm role required by `/manager`.
pub const MANAGER_ROLE: &str = "manager";

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let admin_gate = GateLayerState {
        pool: state.db_pool.clone(),
        gate: state.gate(ADMIN_ROLE),
    };
    let manager_gate = GateLayerState {
        pool: state.db_pool.clone(),
        gate: state.gate(MANAGER_ROLE),
    };

    let admin = Router::new()
        .route("/call-api", get(handlers::call_api))
        .route_layer(from_fn_with_state(admin_gate, enforce_role));

    let manager = Router::new()
        .route("/manager", get(handlers::manager))
        .route_layer(from_fn_with_state(manager_gate, enforce_role));

    Router::new()
        .route("/", get(handlers::home))
        .route("/profile", get(handlers::profile))
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/logout", get(auth::logout))
        .merge(admin)
        .merge(manager)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
