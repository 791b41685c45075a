use std::sync::Arc;

use anyhow::anyhow;
use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::info;

use artcade_db::Database;
use artcade_db::models::UserRow;
use artcade_types::api::{LoginRequest, LoginResponse, NonceResponse, OtpLoginRequest, OtpResponse};
use artcade_types::models::UserInfo;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::gateway::{AuthUser, Gateway};
use crate::nonce::NonceIssuer;
use crate::otp::OtpLinker;
use crate::session::{IssuedSession, SessionManager};
use crate::siwe::SiweVerifier;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub config: AuthConfig,
    pub nonces: NonceIssuer,
    pub verifier: SiweVerifier,
    pub sessions: SessionManager,
    pub otps: OtpLinker,
    pub gateway: Gateway,
    pub started_at: DateTime<Utc>,
}

impl AppStateInner {
    pub fn new(db: Database, config: AuthConfig) -> AppState {
        let db = Arc::new(db);
        let sessions = SessionManager::new(db.clone(), config.session.clone());

        Arc::new(Self {
            nonces: NonceIssuer::new(db.clone(), config.nonce_expiration),
            verifier: SiweVerifier::new(db.clone(), sessions.clone(), config.siwe_domain.clone()),
            otps: OtpLinker::new(db.clone(), sessions.clone(), config.otp_expiration),
            gateway: Gateway::new(config.cookies.clone(), sessions.clone()),
            sessions,
            db,
            config,
            started_at: Utc::now(),
        })
    }
}

/// Run blocking store work off the async runtime.
pub(crate) async fn blocking<F, T>(state: AppState, f: F) -> Result<T, AuthError>
where
    F: FnOnce(&AppStateInner) -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| AuthError::Infrastructure(anyhow!("spawn_blocking join error: {}", e)))?
}

pub fn user_info(user: &UserRow) -> UserInfo {
    UserInfo {
        eth_address: user.eth_address.clone(),
        username: user.username.clone(),
        created_at: user.created_at,
        updated_at: user.updated_at,
    }
}

fn login_response(user: &UserRow, session: IssuedSession) -> LoginResponse {
    LoginResponse {
        token: session.token,
        expiry: session.expiry,
        user: user_info(user),
    }
}

/// GET /auth/nonce
pub async fn get_nonce(State(state): State<AppState>) -> Result<impl IntoResponse, AuthError> {
    let value = blocking(state, |s| s.nonces.issue_nonce()).await?;
    Ok(Json(NonceResponse { value }))
}

/// POST /auth/login: SIWE sign-in.
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = payload?;
    blocking(state, move |s| {
        let login = s.verifier.verify_login(&req.message, &req.signature)?;
        let result = s.gateway.login_result(&login.session)?;
        Ok((result, Json(login_response(&login.user, login.session))))
    })
    .await
}

/// POST /auth/generate-otp
pub async fn generate_otp(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<impl IntoResponse, AuthError> {
    let otp = blocking(state, move |s| s.otps.issue_otp(&auth.user)).await?;
    Ok(Json(OtpResponse { code: otp.code }))
}

/// POST /auth/login/otp: Second-device sign-in.
pub async fn login_otp(
    State(state): State<AppState>,
    payload: Result<Json<OtpLoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AuthError> {
    let Json(req) = payload?;
    blocking(state, move |s| {
        let redeemed = s.otps.redeem_otp(req.code.trim())?;
        let result = s.gateway.login_result(&redeemed.session)?;
        Ok((result, Json(login_response(&redeemed.user, redeemed.session))))
    })
    .await
}

/// POST /auth/logout: Revoke the session used for this request.
pub async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<impl IntoResponse, AuthError> {
    blocking(state, move |s| {
        s.sessions.revoke_session(&auth.token)?;
        info!("{} logged out", auth.user.username);
        Ok((s.gateway.logout_result(), StatusCode::NO_CONTENT))
    })
    .await
}

/// POST /auth/logout-all: Revoke every session of the user.
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<impl IntoResponse, AuthError> {
    blocking(state, move |s| {
        s.sessions.revoke_all_sessions(&auth.user)?;
        Ok((s.gateway.logout_result(), StatusCode::NO_CONTENT))
    })
    .await
}

/// GET /auth/user-info: Current user plus a fresh CSRF token.
pub async fn get_user_info(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    let result = state.gateway.csrf_refresh(&headers)?;
    Ok((result, Json(user_info(&auth.user))))
}
