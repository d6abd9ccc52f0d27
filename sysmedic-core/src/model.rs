//! Shared data model (spec §3): samples, tracking state, offender records,
//! alerts, status, and the authentication secret.

use serde::{Deserialize, Serialize};

/// One host-wide sample, produced once per tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    /// Wall-clock timestamp (Unix seconds) this sample was taken at.
    pub timestamp: i64,
    /// Host-wide CPU usage, 0-100.
    pub cpu_percent: f64,
    /// `(MemTotal - MemFree - Buffers - Cached) / MemTotal * 100`.
    pub memory_percent: f64,
    /// Aggregate non-loopback network throughput, MB/s.
    pub network_mbps: f64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    /// True for the first sample after sampler startup, before a real delta
    /// could be computed (spec §4.1).
    pub warming: bool,
}

impl HostSample {
    /// Clamps all percentage fields into `[0, 100]`. Called once sampling
    /// arithmetic is complete; never clamp before combining deltas.
    pub fn clamp_percentages(&mut self) {
        self.cpu_percent = self.cpu_percent.clamp(0.0, 100.0);
        self.memory_percent = self.memory_percent.clamp(0.0, 100.0);
    }
}

/// One per-user sample, produced once per tick per observed user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSample {
    pub username: String,
    /// Real UID this sample was attributed to, used by the user filter's
    /// `min_uid` rule (spec §4.2).
    pub uid: u32,
    /// Host-normalised (0-100 total, not per-core) CPU usage — spec §9(a).
    pub cpu_percent: f64,
    /// Resident set of the user's processes as a fraction of total memory.
    pub memory_percent: f64,
    pub process_count: u32,
    /// Representative PIDs, capped at a configurable count (default 32).
    pub pids: Vec<u32>,
}

impl UserSample {
    pub fn clamp_percentages(&mut self) {
        self.cpu_percent = self.cpu_percent.clamp(0.0, 100.0);
        self.memory_percent = self.memory_percent.clamp(0.0, 100.0);
    }
}

/// The metric a persistence window tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Cpu,
    Memory,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cpu => "cpu",
            Metric::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a closed or still-open offender window (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistentOffenderRecord {
    pub id: u64,
    pub username: String,
    pub metric: Metric,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_minutes: i64,
    pub peak_usage: f64,
    pub average_usage: f64,
    pub sample_count: u64,
    pub resolved: bool,
}

impl PersistentOffenderRecord {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    SystemThreshold,
    PersistentUser,
    Recovery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A per-user status summary attached to an alert (spec §4.6).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStatusEntry {
    pub username: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub cpu_status: OffenderStatus,
    pub memory_status: OffenderStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffenderStatus {
    #[default]
    None,
    Open,
    OpenPersistent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    pub top_users: Vec<UserStatusEntry>,
    pub recommendation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub timestamp: i64,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub host_cpu: f64,
    pub host_memory: f64,
    pub duration_minutes: i64,
    pub primary_cause: Option<String>,
    pub user_details: UserDetails,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    #[default]
    Light,
    Medium,
    Heavy,
}

/// Opaque 128-bit token presented by WebSocket clients, stored hex-encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthSecret {
    pub hex: String,
    /// Monotonically increasing with each rotation; readers cache the
    /// version and re-read on mismatch (spec §9).
    pub version: u64,
}

impl AuthSecret {
    pub fn from_bytes(bytes: [u8; 16], version: u64) -> Self {
        Self {
            hex: encode_hex(&bytes),
            version,
        }
    }
}

/// Encodes bytes as lowercase hex without pulling in a dedicated crate.
pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// The store row rewritten each tick summarising the latest state for
/// WebSocket broadcast (spec §4.7, glossary: "Live snapshot").
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub host: HostSample,
    pub users: Vec<UserSample>,
    pub status: SystemStatus,
    pub open_offenders: Vec<PersistentOffenderRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_percentages_bounds_both_fields() {
        let mut h = HostSample {
            cpu_percent: 142.0,
            memory_percent: -4.0,
            ..Default::default()
        };
        h.clamp_percentages();
        assert_eq!(h.cpu_percent, 100.0);
        assert_eq!(h.memory_percent, 0.0);
    }

    #[test]
    fn encode_hex_matches_known_vector() {
        assert_eq!(encode_hex(&[0x00, 0xff, 0x10]), "00ff10");
    }
}
