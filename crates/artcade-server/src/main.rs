mod cleanup;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use artcade_api::auth::AppStateInner;
use artcade_api::config::{AuthConfig, CookieConfig, list_var, parsed_var, secs_var, string_var};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artcade=debug,artcade_api=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let config = AuthConfig::from_env()?;
    let db_path = string_var("ARTCADE_DB_PATH").unwrap_or_else(|| "artcade.db".into());
    let host = string_var("ARTCADE_HOST").unwrap_or_else(|| "0.0.0.0".into());
    let port: u16 = parsed_var("ARTCADE_PORT")?.unwrap_or(8000);
    let cleanup_interval =
        secs_var("ARTCADE_CLEANUP_INTERVAL_SECS", chrono::Duration::hours(1), 1)?.to_std()?;

    let db = artcade_db::Database::open(&PathBuf::from(&db_path))?;

    let cors = cors_layer(&config.cookies, &list_var("ARTCADE_CORS_ALLOWED_ORIGINS"))?;
    let state = AppStateInner::new(db, config);

    tokio::spawn(cleanup::run_cleanup_loop(state.db.clone(), cleanup_interval));

    let app = artcade_api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Artcade auth server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Credentialed CORS for the listed origins. Browsers need the CSRF
/// response header exposed to read it back.
fn cors_layer(cookies: &CookieConfig, origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.is_empty() {
        warn!("ARTCADE_CORS_ALLOWED_ORIGINS is empty, cross-origin requests will be refused");
        return Ok(CorsLayer::new());
    }

    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            cookies.csrf_header.clone(),
        ])
        .expose_headers([cookies.csrf_response_header.clone()]))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
