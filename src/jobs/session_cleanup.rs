//! Periodic sweep of expired sessions, abandoned logins and replay-cache entries.
//!
//! Expiry is enforced on every lookup regardless; the sweep only bounds memory.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{auth::SharedSessionStore, saml::ReplayCache};

/// Results from a single cleanup run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupRunResult {
    pub sessions_removed: usize,
    pub pending_requests_removed: usize,
    pub replay_entries_removed: usize,
}

impl CleanupRunResult {
    pub fn has_deletions(&self) -> bool {
        self.sessions_removed > 0
            || self.pending_requests_removed > 0
            || self.replay_entries_removed > 0
    }
}

/// Runs the cleanup loop until the task is dropped.
///
/// An `interval` of zero disables the worker.
pub async fn start_session_cleanup_worker(
    store: SharedSessionStore,
    replay: Arc<ReplayCache>,
    pending_ttl: chrono::Duration,
    interval: Duration,
) {
    if interval.is_zero() {
        tracing::info!("Session cleanup worker disabled by configuration");
        return;
    }

    tracing::info!(
        interval_secs = interval.as_secs(),
        "Starting session cleanup worker"
    );

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; nothing has expired yet at startup.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        match run_cleanup(&store, &replay, pending_ttl).await {
            Ok(result) if result.has_deletions() => {
                tracing::info!(
                    sessions = result.sessions_removed,
                    pending_requests = result.pending_requests_removed,
                    replay_entries = result.replay_entries_removed,
                    "Session cleanup run complete"
                );
            }
            Ok(_) => tracing::debug!("Session cleanup run complete, nothing to clean up"),
            Err(e) => tracing::error!(error = %e, "Error running session cleanup"),
        }
    }
}

/// Run a single cleanup pass.
pub async fn run_cleanup(
    store: &SharedSessionStore,
    replay: &ReplayCache,
    pending_ttl: chrono::Duration,
) -> Result<CleanupRunResult, crate::auth::SessionError> {
    let now = Utc::now();
    let stats = store.cleanup(now, pending_ttl).await?;

    Ok(CleanupRunResult {
        sessions_removed: stats.sessions,
        pending_requests_removed: stats.pending_requests,
        replay_entries_removed: replay.purge_expired(now),
    })
}
