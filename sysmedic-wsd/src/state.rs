//! Shared application state (grounded in `rpglot-web::state`'s `SharedState`
//! + static-atomics shape, adapted from an in-process collector to a
//! read-only handle onto a store another process writes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, watch};

use sysmedic_core::broadcast::SystemUpdatePayload;
use sysmedic_core::model::Alert;
use sysmedic_core::store::StoreReader;

pub fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Per-connection alert queue, registered here so the background poll loop
/// can fan alerts out without the sessions themselves polling the store.
pub type AlertRegistry = Mutex<HashMap<u64, mpsc::Sender<Arc<Alert>>>>;

pub struct AppStateInner {
    pub store: StoreReader,
    pub system_update_tx: broadcast::Sender<Arc<SystemUpdatePayload>>,
    pub alert_registry: AlertRegistry,
    /// Bumped by the background loop whenever the store's `AuthSecret`
    /// changes; sessions watch this to self-close on rotation (spec §4.7).
    pub secret_version: watch::Sender<u64>,
    pub next_session_id: AtomicU64,
    pub active_connections: AtomicUsize,
    pub start_time: i64,
    pub port: u16,
    pub broadcast_interval_secs: u64,
}

pub type AppState = Arc<AppStateInner>;

pub static LAST_CLIENT_ACTIVITY: AtomicI64 = AtomicI64::new(0);

impl AppStateInner {
    pub fn new(store: StoreReader, port: u16, broadcast_interval_secs: u64, initial_secret_version: u64) -> Arc<Self> {
        let (system_update_tx, _rx) = broadcast::channel(64);
        let (secret_version, _rx) = watch::channel(initial_secret_version);
        Arc::new(Self {
            store,
            system_update_tx,
            alert_registry: Mutex::new(HashMap::new()),
            secret_version,
            next_session_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            start_time: now_epoch(),
            port,
            broadcast_interval_secs,
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        (now_epoch() - self.start_time).max(0) as u64
    }
}
