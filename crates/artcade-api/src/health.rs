use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::error;

use artcade_types::api::HealthResponse;

use crate::auth::{AppState, blocking};

/// GET /health: Reports whether the credential store answers.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let started_at = state.started_at;
    let db_ok = match blocking(state, |s| Ok(s.db.ping()?)).await {
        Ok(()) => true,
        Err(e) => {
            error!("Health check failed - database unreachable: {}", e);
            false
        }
    };

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let label = |ok: bool| (if ok { "ok" } else { "error" }).to_string();

    (
        status,
        Json(HealthResponse {
            status: label(db_ok),
            db: label(db_ok),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at,
        }),
    )
}
