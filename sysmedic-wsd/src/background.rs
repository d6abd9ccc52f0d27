//! Background poll loop (grounded in `rpglot-web::background::tick_loop`):
//! reads the Doctor-written `state.bin` at the broadcast cadence and fans
//! out `system_update`/`alert` messages, since the Doctor and WebSocket
//! processes share no in-process state (spec §4.7, §5).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use sysmedic_core::broadcast::SystemUpdatePayload;
use sysmedic_core::model::Alert;

use crate::state::{now_epoch, AppState};

/// Alerts older than this are never treated as "new" even on first poll,
/// bounding how far back a freshly-started WebSocket process looks.
const ALERT_LOOKBACK_SECS: i64 = 3600;

pub async fn poll_loop(state: AppState, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_alert_id: u64 = 0;
    let mut poll_count: u64 = 0;

    loop {
        tick.tick().await;
        let t0 = Instant::now();

        let state_clone = state.clone();
        let result = tokio::task::spawn_blocking(move || {
            let live = state_clone.store.live_snapshot()?;
            let secret = state_clone.store.auth_secret()?;
            let now = now_epoch();
            let alerts = state_clone.store.get_alerts_since(ALERT_LOOKBACK_SECS, now, None)?;
            Ok::<_, std::io::Error>((live, secret, alerts))
        })
        .await;

        let elapsed = t0.elapsed();
        poll_count += 1;

        let (live, secret, alerts) = match result {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read store snapshot");
                continue;
            }
            Err(e) => {
                error!(error = %e, "poll task panicked");
                continue;
            }
        };

        if let Some(secret) = secret {
            let current = *state.secret_version.borrow();
            if secret.version != current {
                warn!(old = current, new = secret.version, "auth secret rotated, closing all sessions");
                let _ = state.secret_version.send(secret.version);
            }
        }

        let payload = Arc::new(SystemUpdatePayload {
            host: live.host,
            users: live.users,
            status: live.status,
        });
        let receivers = state.system_update_tx.send(payload).unwrap_or(0);

        let mut new_alerts: Vec<&Alert> = alerts.iter().filter(|a| a.id > last_alert_id).collect();
        new_alerts.sort_by_key(|a| a.id);
        if let Some(max_id) = new_alerts.last().map(|a| a.id) {
            last_alert_id = max_id;
        }

        if !new_alerts.is_empty() {
            let mut registry = state.alert_registry.lock().unwrap();
            let mut full = Vec::new();
            for alert in &new_alerts {
                let alert = Arc::new((*alert).clone());
                for (&session_id, tx) in registry.iter() {
                    if tx.try_send(alert.clone()).is_err() {
                        full.push(session_id);
                    }
                }
            }
            for session_id in full {
                warn!(session_id, "alert queue full, closing session");
                registry.remove(&session_id);
            }
        }

        if poll_count == 1 {
            debug!(duration_ms = elapsed.as_millis() as u64, receivers, "first broadcast poll");
        } else {
            debug!(duration_ms = elapsed.as_millis() as u64, receivers, new_alerts = new_alerts.len(), "poll completed");
        }

        if elapsed > interval / 2 {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "poll exceeded 50% of broadcast interval"
            );
        }
    }
}
