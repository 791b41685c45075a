use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::auth::{AppState, blocking};
use crate::error::AuthError;

/// Resolve the request's credential through the gateway and attach the
/// resulting `AuthUser`. CSRF and auth failures stop here, before the
/// handler runs. A cookie session extended by auto-refresh gets its cookie
/// re-issued on the way out.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let path = req.uri().path().to_string();

    let auth = blocking(state.clone(), move |s| s.gateway.authenticate(&method, &headers))
        .await
        .inspect_err(|e| {
            if let AuthError::CsrfFailed(reason) = e {
                warn!("CSRF check failed on {}: {}", path, reason);
            }
        })?;

    let refreshed = state.gateway.refreshed_cookie(&auth);
    req.extensions_mut().insert(auth);
    let response = next.run(req).await;

    // logout responses clear the cookie themselves
    Ok(match refreshed {
        Some(cookie) if !state.gateway.sets_auth_cookie(response.headers()) => {
            (cookie, response).into_response()
        }
        _ => response,
    })
}
