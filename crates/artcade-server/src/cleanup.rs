use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use artcade_db::Database;

/// Background task that drops expired nonces, OTP codes and sessions.
///
/// Lookups already treat expired rows as dead, so this only bounds table growth.
pub async fn run_cleanup_loop(db: Arc<Database>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        let db = db.clone();
        match tokio::task::spawn_blocking(move || db.purge_expired(Utc::now())).await {
            Ok(Ok(counts)) => {
                if counts.total() > 0 {
                    info!(
                        "Cleanup: purged {} nonces, {} OTP codes, {} sessions",
                        counts.nonces, counts.otps, counts.sessions
                    );
                } else {
                    debug!("Cleanup: nothing expired");
                }
            }
            Ok(Err(e)) => warn!("Cleanup error: {}", e),
            Err(e) => warn!("Cleanup task panicked: {}", e),
        }
    }
}
