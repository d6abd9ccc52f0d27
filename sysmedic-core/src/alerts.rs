//! Alert engine (spec §4.6): turns status transitions and tracker events
//! into deduplicated, recommendation-annotated alerts. Grounded in the
//! teacher's `analysis::advisor` rule-table shape (`Advisor` trait,
//! `recommendations.rs`) for the fixed recommendation table.

use crate::model::{Alert, AlertType, HostSample, Metric, Severity, SystemStatus, UserDetails, UserSample, UserStatusEntry};
use crate::tracker::{PersistenceTracker, TrackerEvent};

/// Store operations the alert engine needs to check for an existing
/// unresolved, still-in-cooldown duplicate (spec §4.6 dedup).
pub trait AlertStore {
    /// Unresolved alerts of exactly this (type, severity, primary_cause)
    /// whose timestamp is within the cooldown window ending at `now`.
    fn find_unresolved_duplicate(
        &self,
        alert_type: AlertType,
        severity: Severity,
        primary_cause: Option<&str>,
        now: i64,
        cooldown_secs: i64,
    ) -> bool;

    fn insert_alert(&mut self, alert: Alert) -> u64;
}

pub struct AlertEngine {
    cooldown_secs: i64,
    next_id: u64,
}

impl AlertEngine {
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown_secs,
            next_id: 1,
        }
    }

    /// Called once per tick after the classifier has run, with the status
    /// before and after this tick's samples. Emits `SystemThreshold` on a
    /// `Light|Medium -> Heavy` transition (spec §4.6), and `Recovery` on a
    /// `Heavy -> Light|Medium` transition.
    #[allow(clippy::too_many_arguments)]
    pub fn on_status_transition(
        &mut self,
        store: &mut dyn AlertStore,
        now: i64,
        previous: SystemStatus,
        current: SystemStatus,
        host: &HostSample,
        users: &[UserSample],
        tracker: &PersistenceTracker,
        host_over: bool,
        any_persistent: bool,
        primary_cause: Option<&str>,
    ) -> Vec<Alert> {
        let mut emitted = Vec::new();

        if previous != SystemStatus::Heavy && current == SystemStatus::Heavy {
            let severity = if host_over && any_persistent {
                Severity::Critical
            } else {
                Severity::High
            };
            let message = format!(
                "system entered heavy load (cpu={:.1}% mem={:.1}%)",
                host.cpu_percent, host.memory_percent
            );
            if let Some(alert) = self.try_emit(
                store,
                now,
                AlertType::SystemThreshold,
                severity,
                message,
                host,
                0,
                primary_cause,
                users,
                tracker,
            ) {
                emitted.push(alert);
            }
        } else if previous == SystemStatus::Heavy && current != SystemStatus::Heavy {
            let message = "system load returned to normal".to_string();
            if let Some(alert) = self.try_emit(
                store,
                now,
                AlertType::Recovery,
                Severity::Low,
                message,
                host,
                0,
                None,
                users,
                tracker,
            ) {
                emitted.push(alert);
            }
        }

        emitted
    }

    /// Turns tracker events into `PersistentUser`/`Recovery` alerts.
    #[allow(clippy::too_many_arguments)]
    pub fn on_tracker_events(
        &mut self,
        store: &mut dyn AlertStore,
        now: i64,
        host: &HostSample,
        users: &[UserSample],
        tracker: &PersistenceTracker,
        events: &[TrackerEvent],
    ) -> Vec<Alert> {
        let mut emitted = Vec::new();
        for event in events {
            match event {
                TrackerEvent::Promoted { username, metric, record } => {
                    let message = format!(
                        "{username}'s {metric} usage has been persistently high for {} minutes",
                        record.duration_minutes
                    );
                    if let Some(alert) = self.try_emit(
                        store,
                        now,
                        AlertType::PersistentUser,
                        Severity::High,
                        message,
                        host,
                        record.duration_minutes,
                        Some(username.as_str()),
                        users,
                        tracker,
                    ) {
                        emitted.push(alert);
                    }
                }
                TrackerEvent::Closed {
                    username,
                    metric,
                    record,
                    was_persistent,
                } => {
                    if !was_persistent {
                        continue;
                    }
                    let message = format!("{username}'s {metric} usage has returned to normal");
                    if let Some(alert) = self.try_emit(
                        store,
                        now,
                        AlertType::Recovery,
                        Severity::Low,
                        message,
                        host,
                        record.duration_minutes,
                        Some(username.as_str()),
                        users,
                        tracker,
                    ) {
                        emitted.push(alert);
                    }
                }
            }
        }
        emitted
    }

    #[allow(clippy::too_many_arguments)]
    fn try_emit(
        &mut self,
        store: &mut dyn AlertStore,
        now: i64,
        alert_type: AlertType,
        severity: Severity,
        message: String,
        host: &HostSample,
        duration_minutes: i64,
        primary_cause: Option<&str>,
        users: &[UserSample],
        tracker: &PersistenceTracker,
    ) -> Option<Alert> {
        // Recovery alerts are never suppressed (spec §4.6).
        if alert_type != AlertType::Recovery
            && store.find_unresolved_duplicate(alert_type, severity, primary_cause, now, self.cooldown_secs)
        {
            return None;
        }

        let alert = Alert {
            id: self.next_id,
            timestamp: now,
            alert_type,
            severity,
            message,
            host_cpu: host.cpu_percent,
            host_memory: host.memory_percent,
            duration_minutes,
            primary_cause: primary_cause.map(str::to_string),
            user_details: build_user_details(users, primary_cause, tracker),
            resolved: false,
            resolved_at: None,
        };
        self.next_id += 1;
        let id = store.insert_alert(alert.clone());
        let mut alert = alert;
        alert.id = id;
        Some(alert)
    }
}

/// Top five users by CPU at emission time, with a status tag per metric
/// (open/open_persistent/none, read from the tracker's live windows) and a
/// recommendation drawn from a fixed rule table (spec §4.6).
fn build_user_details(users: &[UserSample], primary_cause: Option<&str>, tracker: &PersistenceTracker) -> UserDetails {
    let mut ranked: Vec<&UserSample> = users.iter().collect();
    ranked.sort_by(|a, b| b.cpu_percent.partial_cmp(&a.cpu_percent).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(5);

    let top_users = ranked
        .iter()
        .map(|u| UserStatusEntry {
            username: u.username.clone(),
            cpu_percent: u.cpu_percent,
            memory_percent: u.memory_percent,
            cpu_status: tracker.status(&u.username, Metric::Cpu),
            memory_status: tracker.status(&u.username, Metric::Memory),
        })
        .collect();

    UserDetails {
        top_users,
        recommendation: recommend(primary_cause),
    }
}

/// Fixed recommendation rule table (spec §4.6), grounded in the teacher's
/// `Advisor` rule-table pattern.
fn recommend(primary_cause: Option<&str>) -> String {
    match primary_cause {
        Some(username) => {
            format!("Investigate {username}'s processes; check for runaway jobs")
        }
        None => "Review overall host load; no single user stands out as the cause".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeStore {
        unresolved: Vec<Alert>,
    }

    impl AlertStore for FakeStore {
        fn find_unresolved_duplicate(
            &self,
            alert_type: AlertType,
            severity: Severity,
            primary_cause: Option<&str>,
            now: i64,
            cooldown_secs: i64,
        ) -> bool {
            self.unresolved.iter().any(|a| {
                !a.resolved
                    && a.alert_type == alert_type
                    && a.severity == severity
                    && a.primary_cause.as_deref() == primary_cause
                    && now - a.timestamp < cooldown_secs
            })
        }

        fn insert_alert(&mut self, alert: Alert) -> u64 {
            let id = alert.id;
            self.unresolved.push(alert);
            id
        }
    }

    fn host(cpu: f64) -> HostSample {
        HostSample {
            cpu_percent: cpu,
            ..Default::default()
        }
    }

    #[test]
    fn host_spike_emits_one_high_severity_alert() {
        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let tracker = PersistenceTracker::new();
        let emitted = engine.on_status_transition(
            &mut store,
            0,
            SystemStatus::Medium,
            SystemStatus::Heavy,
            &host(92.0),
            &[],
            &tracker,
            true,
            false,
            None,
        );
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].severity, Severity::High);
        assert_eq!(emitted[0].alert_type, AlertType::SystemThreshold);
    }

    #[test]
    fn dual_trigger_is_critical_with_primary_cause() {
        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let tracker = PersistenceTracker::new();
        let emitted = engine.on_status_transition(
            &mut store,
            0,
            SystemStatus::Medium,
            SystemStatus::Heavy,
            &host(90.0),
            &[],
            &tracker,
            true,
            true,
            Some("build"),
        );
        assert_eq!(emitted[0].severity, Severity::Critical);
        assert_eq!(emitted[0].primary_cause.as_deref(), Some("build"));
    }

    #[derive(Default)]
    struct FakeOffenderStore {
        next_id: u64,
    }

    impl crate::tracker::OffenderStore for FakeOffenderStore {
        fn open_offender(&mut self, _username: &str, _metric: Metric, _start_time: i64, _opening_usage: f64) -> u64 {
            self.next_id += 1;
            self.next_id
        }
        fn update_offender(&mut self, _id: u64, _peak: f64, _sum: f64, _count: u64) {}
        fn close_offender(&mut self, _id: u64, _end_time: i64) {}
    }

    #[test]
    fn user_details_carry_live_tracker_status() {
        use crate::config::Config;
        use crate::model::OffenderStatus;

        let mut tracker = PersistenceTracker::new();
        let mut offender_store = FakeOffenderStore::default();
        let config = Config::default();
        let persistent_secs = config.persistent_time_minutes as i64 * 60;

        let user = UserSample {
            username: "build".to_string(),
            uid: 1001,
            cpu_percent: 90.0,
            memory_percent: 10.0,
            process_count: 1,
            pids: vec![1],
        };
        tracker.tick(&mut offender_store, &config, 0, &[user.clone()]);
        let events = tracker.tick(&mut offender_store, &config, persistent_secs, &[user.clone()]);

        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let emitted = engine.on_tracker_events(&mut store, persistent_secs, &host(10.0), &[user], &tracker, &events);

        assert_eq!(emitted.len(), 1);
        let top = &emitted[0].user_details.top_users[0];
        assert_eq!(top.username, "build");
        assert_eq!(top.cpu_status, OffenderStatus::OpenPersistent);
        assert_eq!(top.memory_status, OffenderStatus::None);
    }

    #[test]
    fn duplicate_within_cooldown_is_suppressed() {
        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let tracker = PersistenceTracker::new();
        engine.on_status_transition(
            &mut store, 0, SystemStatus::Light, SystemStatus::Heavy, &host(92.0), &[], &tracker, true, false, None,
        );
        let second = engine.on_status_transition(
            &mut store, 100, SystemStatus::Light, SystemStatus::Heavy, &host(92.0), &[], &tracker, true, false, None,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn recovery_is_never_suppressed() {
        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let tracker = PersistenceTracker::new();
        let first = engine.on_status_transition(
            &mut store, 0, SystemStatus::Heavy, SystemStatus::Light, &host(10.0), &[], &tracker, false, false, None,
        );
        let second = engine.on_status_transition(
            &mut store, 1, SystemStatus::Heavy, SystemStatus::Light, &host(10.0), &[], &tracker, false, false, None,
        );
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn idempotent_resolve_is_caller_responsibility_but_store_state_is_consistent() {
        let mut engine = AlertEngine::new(300);
        let mut store = FakeStore::default();
        let tracker = PersistenceTracker::new();
        engine.on_status_transition(
            &mut store, 0, SystemStatus::Light, SystemStatus::Heavy, &host(92.0), &[], &tracker, true, false, None,
        );
        store.unresolved[0].resolved = true;
        store.unresolved[0].resolved = true; // idempotent no-op
        assert!(store.unresolved[0].resolved);
    }
}
