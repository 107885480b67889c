use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::engine::FlowEngine;
use crate::store::Store;

/// Expires every waiting session whose reply timeout has elapsed by `now`.
/// Returns how many sessions were expired.
pub async fn sweep_timeouts(store: &dyn Store, engine: &FlowEngine, now: DateTime<Utc>) -> usize {
    let candidates = match store.waiting_sessions_with_timeout().await {
        Ok(sessions) => sessions,
        Err(err) => {
            error!(error = %err, "failed to load waiting sessions");
            return 0;
        }
    };

    let mut expired = 0;
    for session in candidates.into_iter().filter(|s| s.timed_out(now)) {
        let key = session.key();
        match engine.expire_if_due(&key, now).await {
            Ok(Some(outcome)) => {
                info!(contact = %key, session = %session.id, ?outcome, "session timeout handled");
                expired += 1;
            }
            Ok(None) => {}
            Err(err) => error!(contact = %key, session = %session.id, error = %err, "session timeout failed"),
        }
    }
    expired
}
