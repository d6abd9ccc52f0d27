//! The persistent store (spec §4.3): a single-writer (Doctor process) /
//! multi-reader (WebSocket, CLI) on-disk store under a data directory.
//! Grounded in `rpglot-core::storage::manager::StorageManager`'s
//! WAL-plus-hourly-chunk design, simplified to one `state.bin` snapshot
//! file instead of a relational catalog.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alerts::AlertStore;
use crate::model::{Alert, AlertType, AuthSecret, HostSample, LiveSnapshot, Metric, PersistentOffenderRecord, Severity, UserSample};
use crate::tracker::OffenderStore;

use super::chunk::{self, Tick};
use super::wal::{self, StoreEvent, WalWriter};

const STATE_FILE: &str = "state.bin";
const STATE_TMP_FILE: &str = "state.bin.tmp";
const WAL_FILE: &str = "wal.log";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    seq: u64,
    alerts: Vec<Alert>,
    offenders: Vec<PersistentOffenderRecord>,
    auth_secret: Option<AuthSecret>,
    live_snapshot: LiveSnapshot,
    next_alert_id: u64,
    next_offender_id: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub alerts: usize,
    pub unresolved_alerts: usize,
    pub offenders: usize,
    pub open_offenders: usize,
    pub chunk_files: usize,
}

/// The sole store writer. One instance must exist per data directory at a
/// time, enforced externally by the PID lock (spec §6), not by this type.
pub struct Store {
    data_dir: PathBuf,
    wal: WalWriter,
    seq: u64,
    alerts: Vec<Alert>,
    offenders: Vec<PersistentOffenderRecord>,
    auth_secret: Option<AuthSecret>,
    live_snapshot: LiveSnapshot,
    next_alert_id: u64,
    next_offender_id: u64,
}

impl Store {
    /// Opens (creating if absent) the store at `data_dir`, replaying any WAL
    /// entries newer than the last snapshot before returning.
    pub fn open(data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        cleanup_orphaned_tmp_files(&data_dir)?;

        let snapshot = read_snapshot(&data_dir)?.unwrap_or_default();
        let wal_path = data_dir.join(WAL_FILE);
        let replayed = wal::replay(&wal_path, snapshot.seq)?;

        let mut store = Self {
            data_dir,
            wal: WalWriter::open(&wal_path)?,
            seq: snapshot.seq,
            alerts: snapshot.alerts,
            offenders: snapshot.offenders,
            auth_secret: snapshot.auth_secret,
            live_snapshot: snapshot.live_snapshot,
            next_alert_id: snapshot.next_alert_id.max(1),
            next_offender_id: snapshot.next_offender_id.max(1),
        };

        if !replayed.is_empty() {
            info!(count = replayed.len(), "replaying WAL entries since last snapshot");
            for (seq, event) in replayed {
                store.apply_event(&event);
                store.seq = store.seq.max(seq);
            }
            store.write_snapshot()?;
        }

        Ok(store)
    }

    fn apply_event(&mut self, event: &StoreEvent) {
        match event.clone() {
            StoreEvent::OffenderOpened {
                id,
                username,
                metric,
                start_time,
                opening_usage,
            } => {
                self.offenders.push(PersistentOffenderRecord {
                    id,
                    username,
                    metric,
                    start_time,
                    end_time: None,
                    duration_minutes: 0,
                    peak_usage: opening_usage,
                    average_usage: opening_usage,
                    sample_count: 1,
                    resolved: false,
                });
                self.next_offender_id = self.next_offender_id.max(id + 1);
            }
            StoreEvent::OffenderUpdated { id, peak, sum, count } => {
                if let Some(o) = self.offenders.iter_mut().find(|o| o.id == id) {
                    o.peak_usage = peak;
                    o.average_usage = if count > 0 { sum / count as f64 } else { 0.0 };
                    o.sample_count = count;
                }
            }
            StoreEvent::OffenderClosed { id, end_time } => {
                if let Some(o) = self.offenders.iter_mut().find(|o| o.id == id) {
                    o.end_time = Some(end_time);
                    o.duration_minutes = (end_time - o.start_time) / 60;
                }
            }
            StoreEvent::AlertInserted(alert) => {
                self.next_alert_id = self.next_alert_id.max(alert.id + 1);
                self.alerts.push(*alert);
            }
            StoreEvent::AlertResolved { id, at } => {
                if let Some(a) = self.alerts.iter_mut().find(|a| a.id == id) {
                    a.resolved = true;
                    a.resolved_at = Some(at);
                }
            }
            StoreEvent::SecretRotated(secret) => {
                self.auth_secret = Some(secret);
            }
        }
    }

    fn append(&mut self, event: StoreEvent) -> io::Result<()> {
        self.seq += 1;
        self.wal.append(self.seq, &event)?;
        self.apply_event(&event);
        Ok(())
    }

    fn write_snapshot(&mut self) -> io::Result<()> {
        let snapshot = Snapshot {
            seq: self.seq,
            alerts: self.alerts.clone(),
            offenders: self.offenders.clone(),
            auth_secret: self.auth_secret.clone(),
            live_snapshot: self.live_snapshot.clone(),
            next_alert_id: self.next_alert_id,
            next_offender_id: self.next_offender_id,
        };
        write_snapshot_atomically(&self.data_dir, &snapshot)?;
        let wal_path = self.data_dir.join(WAL_FILE);
        self.wal.truncate(&wal_path)?;
        Ok(())
    }

    /// Commits one tick atomically: the sample pair, any tracker state
    /// transitions already applied via the `OffenderStore` trait, any
    /// alerts emitted this tick, and the live snapshot — then rewrites
    /// `state.bin` once (spec §5: "commits a whole tick ... in one store
    /// transaction").
    pub fn commit_tick(
        &mut self,
        host: &HostSample,
        users: &[UserSample],
        status: crate::model::SystemStatus,
        open_offenders: Vec<PersistentOffenderRecord>,
    ) -> io::Result<()> {
        chunk::append_tick(
            &self.data_dir,
            &Tick {
                timestamp: host.timestamp,
                host: host.clone(),
                users: users.to_vec(),
            },
        )?;
        self.live_snapshot = LiveSnapshot {
            host: host.clone(),
            users: users.to_vec(),
            status,
            open_offenders,
        };
        self.write_snapshot()
    }

    pub fn live_snapshot(&self) -> &LiveSnapshot {
        &self.live_snapshot
    }

    pub fn auth_secret(&self) -> Option<&AuthSecret> {
        self.auth_secret.as_ref()
    }

    /// Replaces the `AuthSecret`, invalidating every existing WebSocket
    /// session (spec §4.7). Snapshotted immediately so readers observe the
    /// rotation within one poll.
    pub fn rotate_secret(&mut self, secret: AuthSecret) -> io::Result<()> {
        self.append(StoreEvent::SecretRotated(secret))?;
        self.write_snapshot()
    }

    pub fn resolve_alert(&mut self, id: u64, at: i64) -> io::Result<()> {
        let already_resolved = self.alerts.iter().any(|a| a.id == id && a.resolved);
        if already_resolved {
            return Ok(()); // idempotent resolve (spec §8)
        }
        if !self.alerts.iter().any(|a| a.id == id) {
            return Ok(());
        }
        self.append(StoreEvent::AlertResolved { id, at })?;
        self.write_snapshot()
    }

    pub fn resolve_all_unresolved(&mut self, at: i64) -> io::Result<usize> {
        let ids: Vec<u64> = self.alerts.iter().filter(|a| !a.resolved).map(|a| a.id).collect();
        for id in &ids {
            self.append(StoreEvent::AlertResolved { id: *id, at })?;
        }
        if !ids.is_empty() {
            self.write_snapshot()?;
        }
        Ok(ids.len())
    }

    pub fn get_alert(&self, id: u64) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    pub fn get_alerts_since(&self, since_secs: i64, now: i64, resolved_filter: Option<bool>) -> Vec<&Alert> {
        self.alerts
            .iter()
            .filter(|a| now - a.timestamp <= since_secs)
            .filter(|a| resolved_filter.map(|r| a.resolved == r).unwrap_or(true))
            .collect()
    }

    pub fn recent_host_samples(&self, since_secs: i64, now: i64) -> io::Result<Vec<HostSample>> {
        let paths = chunk::chunks_in_range(&self.data_dir, now - since_secs, now)?;
        let mut out = Vec::new();
        for path in paths {
            for tick in chunk::read_chunk(&path)? {
                if now - tick.timestamp <= since_secs {
                    out.push(tick.host);
                }
            }
        }
        Ok(out)
    }

    pub fn recent_user_samples(
        &self,
        since_secs: i64,
        now: i64,
        username: Option<&str>,
    ) -> io::Result<Vec<(i64, UserSample)>> {
        let paths = chunk::chunks_in_range(&self.data_dir, now - since_secs, now)?;
        let mut out = Vec::new();
        for path in paths {
            for tick in chunk::read_chunk(&path)? {
                if now - tick.timestamp > since_secs {
                    continue;
                }
                for user in tick.users {
                    if username.map(|u| u == user.username).unwrap_or(true) {
                        out.push((tick.timestamp, user));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn top_users(&self, since_secs: i64, now: i64, n: usize) -> io::Result<Vec<(String, f64)>> {
        use std::collections::HashMap;
        let samples = self.recent_user_samples(since_secs, now, None)?;
        let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
        for (_, sample) in samples {
            let entry = sums.entry(sample.username).or_insert((0.0, 0));
            entry.0 += sample.cpu_percent;
            entry.1 += 1;
        }
        let mut averages: Vec<(String, f64)> = sums
            .into_iter()
            .map(|(username, (sum, count))| (username, sum / count.max(1) as f64))
            .collect();
        averages.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        averages.truncate(n);
        Ok(averages)
    }

    /// Deletes whole chunk files entirely older than `retention_days`,
    /// capped at `max_files` removals per call (spec §4.3).
    pub fn cleanup_older_than(&mut self, retention_days: u32, now: i64, max_files: usize) -> io::Result<usize> {
        let cutoff = now - retention_days as i64 * 86_400;
        let mut removed = 0;
        let Ok(entries) = fs::read_dir(&self.data_dir) else {
            return Ok(0);
        };
        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("samples-") && n.ends_with(".chunk"))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();

        for path in candidates {
            if removed >= max_files {
                break;
            }
            if chunk_is_older_than(&path, cutoff) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(?path, error = %e, "failed to remove expired chunk file");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn stats(&self) -> StoreStats {
        let chunk_files = fs::read_dir(&self.data_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .map(|n| n.starts_with("samples-") && n.ends_with(".chunk"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        StoreStats {
            alerts: self.alerts.len(),
            unresolved_alerts: self.alerts.iter().filter(|a| !a.resolved).count(),
            offenders: self.offenders.len(),
            open_offenders: self.offenders.iter().filter(|o| o.is_open()).count(),
            chunk_files,
        }
    }

    pub fn open_offenders(&self) -> Vec<PersistentOffenderRecord> {
        self.offenders.iter().filter(|o| o.is_open()).cloned().collect()
    }
}

impl OffenderStore for Store {
    fn open_offender(&mut self, username: &str, metric: Metric, start_time: i64, opening_usage: f64) -> u64 {
        let id = self.next_offender_id;
        self.next_offender_id += 1;
        let _ = self.append(StoreEvent::OffenderOpened {
            id,
            username: username.to_string(),
            metric,
            start_time,
            opening_usage,
        });
        id
    }

    fn update_offender(&mut self, id: u64, peak: f64, sum: f64, count: u64) {
        let _ = self.append(StoreEvent::OffenderUpdated { id, peak, sum, count });
    }

    fn close_offender(&mut self, id: u64, end_time: i64) {
        let _ = self.append(StoreEvent::OffenderClosed { id, end_time });
    }
}

impl AlertStore for Store {
    fn find_unresolved_duplicate(
        &self,
        alert_type: AlertType,
        severity: Severity,
        primary_cause: Option<&str>,
        now: i64,
        cooldown_secs: i64,
    ) -> bool {
        self.alerts.iter().any(|a| {
            !a.resolved
                && a.alert_type == alert_type
                && a.severity == severity
                && a.primary_cause.as_deref() == primary_cause
                && now - a.timestamp < cooldown_secs
        })
    }

    fn insert_alert(&mut self, alert: Alert) -> u64 {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        let mut alert = alert;
        alert.id = id;
        let _ = self.append(StoreEvent::AlertInserted(Box::new(alert)));
        id
    }
}

fn chunk_is_older_than(path: &Path, cutoff: i64) -> bool {
    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    // samples-YYYY-MM-DD-HH
    let Some(stamp) = name.strip_prefix("samples-") else {
        return false;
    };
    let Ok(dt) = chrono::NaiveDateTime::parse_from_str(&format!("{stamp}:00:00"), "%Y-%m-%d-%H:%M:%S") else {
        return false;
    };
    dt.and_utc().timestamp() + 3600 < cutoff
}

fn read_snapshot(data_dir: &Path) -> io::Result<Option<Snapshot>> {
    let path = data_dir.join(STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    match bincode::deserialize(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(error = %e, "state.bin is corrupt, starting from an empty snapshot");
            Ok(None)
        }
    }
}

fn write_snapshot_atomically(data_dir: &Path, snapshot: &Snapshot) -> io::Result<()> {
    let tmp_path = data_dir.join(STATE_TMP_FILE);
    let final_path = data_dir.join(STATE_FILE);
    let payload = bincode::serialize(snapshot).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(&payload)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

fn cleanup_orphaned_tmp_files(data_dir: &Path) -> io::Result<()> {
    let tmp_path = data_dir.join(STATE_TMP_FILE);
    if tmp_path.exists() {
        warn!(?tmp_path, "removing orphaned snapshot temp file from a prior crash");
        fs::remove_file(&tmp_path)?;
    }
    Ok(())
}

/// Read-only handle used by the WebSocket and CLI processes (spec §4.3,
/// §4.7): re-reads `state.bin` fresh on every call, relying on the writer's
/// atomic rename for a consistent view without locking.
pub struct StoreReader {
    data_dir: PathBuf,
}

impl StoreReader {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn snapshot(&self) -> io::Result<Snapshot> {
        Ok(read_snapshot(&self.data_dir)?.unwrap_or_default())
    }

    pub fn live_snapshot(&self) -> io::Result<LiveSnapshot> {
        Ok(self.snapshot()?.live_snapshot)
    }

    pub fn auth_secret(&self) -> io::Result<Option<AuthSecret>> {
        Ok(self.snapshot()?.auth_secret)
    }

    pub fn get_alerts_since(&self, since_secs: i64, now: i64, resolved_filter: Option<bool>) -> io::Result<Vec<Alert>> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .alerts
            .into_iter()
            .filter(|a| now - a.timestamp <= since_secs)
            .filter(|a| resolved_filter.map(|r| a.resolved == r).unwrap_or(true))
            .collect())
    }

    pub fn stats(&self) -> io::Result<StoreStats> {
        let snapshot = self.snapshot()?;
        let chunk_files = fs::read_dir(&self.data_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.file_name()
                            .to_str()
                            .map(|n| n.starts_with("samples-") && n.ends_with(".chunk"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);
        Ok(StoreStats {
            alerts: snapshot.alerts.len(),
            unresolved_alerts: snapshot.alerts.iter().filter(|a| !a.resolved).count(),
            offenders: snapshot.offenders.len(),
            open_offenders: snapshot.offenders.iter().filter(|o| o.is_open()).count(),
            chunk_files,
        })
    }

    pub fn recent_host_samples(&self, since_secs: i64, now: i64) -> io::Result<Vec<HostSample>> {
        let paths = chunk::chunks_in_range(&self.data_dir, now - since_secs, now)?;
        let mut out = Vec::new();
        for path in paths {
            for tick in chunk::read_chunk(&path)? {
                if now - tick.timestamp <= since_secs {
                    out.push(tick.host);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Severity, UserDetails};

    fn alert(id: u64, alert_type: AlertType, primary_cause: Option<&str>, timestamp: i64) -> Alert {
        Alert {
            id,
            timestamp,
            alert_type,
            severity: Severity::High,
            message: "test".to_string(),
            host_cpu: 0.0,
            host_memory: 0.0,
            duration_minutes: 0,
            primary_cause: primary_cause.map(str::to_string),
            user_details: UserDetails::default(),
            resolved: false,
            resolved_at: None,
        }
    }

    #[test]
    fn offender_lifecycle_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = Store::open(dir.path()).unwrap();
            let id = store.open_offender("build", Metric::Cpu, 0, 85.0);
            store.update_offender(id, 90.0, 170.0, 2);
            id
        };

        let store = Store::open(dir.path()).unwrap();
        let offenders = store.open_offenders();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].id, id);
        assert_eq!(offenders[0].peak_usage, 90.0);
    }

    #[test]
    fn idempotent_resolve_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let id = store.insert_alert(alert(0, AlertType::SystemThreshold, None, 0));
        store.resolve_alert(id, 10).unwrap();
        assert!(store.get_alert(id).unwrap().resolved);
        store.resolve_alert(id, 20).unwrap();
        assert_eq!(store.get_alert(id).unwrap().resolved_at, Some(10));
    }

    #[test]
    fn secret_rotation_is_durable_and_visible_to_readers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let secret = AuthSecret::from_bytes([1; 16], 1);
        store.rotate_secret(secret.clone()).unwrap();

        let reader = StoreReader::new(dir.path());
        assert_eq!(reader.auth_secret().unwrap(), Some(secret));
    }

    #[test]
    fn commit_tick_persists_samples_for_later_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let host = HostSample {
            timestamp: 1_700_000_000,
            cpu_percent: 50.0,
            ..Default::default()
        };
        store
            .commit_tick(&host, &[], crate::model::SystemStatus::Light, Vec::new())
            .unwrap();

        let recent = store.recent_host_samples(3600, 1_700_000_001).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].cpu_percent, 50.0);
    }

    #[test]
    fn cleanup_removes_only_chunks_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let old = HostSample {
            timestamp: 1_000_000,
            ..Default::default()
        };
        let recent = HostSample {
            timestamp: 1_700_000_000,
            ..Default::default()
        };
        store.commit_tick(&old, &[], crate::model::SystemStatus::Light, Vec::new()).unwrap();
        store.commit_tick(&recent, &[], crate::model::SystemStatus::Light, Vec::new()).unwrap();

        let removed = store.cleanup_older_than(30, 1_700_000_100, 10).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().chunk_files, 1);
    }
}
