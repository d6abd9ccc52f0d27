//! Configuration surface (spec §6). `Config` is a plain struct with
//! spec-mandated defaults; reading it from a YAML file is an external
//! collaborator's job and out of scope here — callers (or `clap`-driven
//! binaries) construct it directly.

use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct UserThresholdOverride {
    pub cpu_threshold: Option<u32>,
    pub memory_threshold: Option<u32>,
    pub persistent_time_minutes: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct UserFilteringConfig {
    pub min_uid: u32,
    pub excluded_users: Vec<String>,
    pub always_include: Vec<String>,
    pub min_cpu_percent: f64,
    pub min_memory_percent: f64,
    pub min_process_count: u32,
}

impl Default for UserFilteringConfig {
    fn default() -> Self {
        Self {
            min_uid: 1000,
            excluded_users: vec![
                "root".to_string(),
                "daemon".to_string(),
                "nobody".to_string(),
                "www-data".to_string(),
            ],
            always_include: Vec::new(),
            min_cpu_percent: 5.0,
            min_memory_percent: 5.0,
            min_process_count: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub port: u16,
    /// 128-bit secret, hex-encoded. `None` means "generate and persist one
    /// on first Doctor startup."
    pub secret_hex: Option<String>,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8060,
            secret_hex: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub check_interval_secs: u64,
    pub cpu_threshold: u32,
    pub memory_threshold: u32,
    pub persistent_time_minutes: u32,
    pub user_cpu_threshold: u32,
    pub user_memory_threshold: u32,
    pub user_persistent_time_minutes: u32,
    pub user_thresholds: HashMap<String, UserThresholdOverride>,
    pub retention_days: u32,
    pub user_filtering: UserFilteringConfig,
    pub websocket: WebsocketConfig,
    pub data_dir: String,
    /// Cap on representative PIDs recorded per `UserSample` (spec §3).
    pub max_pids_per_user: usize,
    /// Dedup cooldown for identical alerts (spec §4.6, default 5 minutes).
    pub alert_cooldown_secs: i64,
    /// Cadence of `system_update` broadcasts, decoupled from sampling
    /// interval (spec §4.7, default 3s).
    pub broadcast_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            cpu_threshold: 80,
            memory_threshold: 80,
            persistent_time_minutes: 60,
            user_cpu_threshold: 80,
            user_memory_threshold: 80,
            user_persistent_time_minutes: 60,
            user_thresholds: HashMap::new(),
            retention_days: 30,
            user_filtering: UserFilteringConfig::default(),
            websocket: WebsocketConfig::default(),
            data_dir: "/var/lib/sysmedic".to_string(),
            max_pids_per_user: 32,
            alert_cooldown_secs: 300,
            broadcast_interval_secs: 3,
        }
    }
}

impl Config {
    /// Resolves the effective CPU threshold for a user: per-user override if
    /// present and > 0, else the global default (spec §4.4).
    pub fn effective_cpu_threshold(&self, username: &str) -> u32 {
        self.user_thresholds
            .get(username)
            .and_then(|o| o.cpu_threshold)
            .filter(|&t| t > 0)
            .unwrap_or(self.user_cpu_threshold)
    }

    pub fn effective_memory_threshold(&self, username: &str) -> u32 {
        self.user_thresholds
            .get(username)
            .and_then(|o| o.memory_threshold)
            .filter(|&t| t > 0)
            .unwrap_or(self.user_memory_threshold)
    }

    pub fn effective_persistent_time_minutes(&self, username: &str) -> u32 {
        self.user_thresholds
            .get(username)
            .and_then(|o| o.persistent_time_minutes)
            .filter(|&t| t > 0)
            .unwrap_or(self.user_persistent_time_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_user_override_wins_when_positive() {
        let mut cfg = Config::default();
        cfg.user_thresholds.insert(
            "build".to_string(),
            UserThresholdOverride {
                cpu_threshold: Some(50),
                memory_threshold: None,
                persistent_time_minutes: None,
            },
        );
        assert_eq!(cfg.effective_cpu_threshold("build"), 50);
        assert_eq!(cfg.effective_memory_threshold("build"), 80);
        assert_eq!(cfg.effective_cpu_threshold("other"), 80);
    }

    #[test]
    fn zero_override_falls_back_to_default() {
        let mut cfg = Config::default();
        cfg.user_thresholds.insert(
            "build".to_string(),
            UserThresholdOverride {
                cpu_threshold: Some(0),
                memory_threshold: None,
                persistent_time_minutes: None,
            },
        );
        assert_eq!(cfg.effective_cpu_threshold("build"), 80);
    }
}
