pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod middleware;
pub mod nonce;
pub mod otp;
pub mod session;
pub mod siwe;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};

use crate::auth::AppState;

/// All auth routes. Session-only routes sit behind the gateway middleware.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/nonce", get(auth::get_nonce))
        .route("/auth/login", post(auth::login))
        .route("/auth/login/otp", post(auth::login_otp))
        .route("/health", get(health::health));

    let protected_routes = Router::new()
        .route("/auth/generate-otp", post(auth::generate_otp))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/user-info", get(auth::get_user_info))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_session));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
