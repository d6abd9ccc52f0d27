//! Persistence tracker: the per-(user, metric) offender state machine
//! (spec §4.4).

use std::collections::HashMap;

use tracing::warn;

use crate::config::Config;
use crate::model::{Metric, OffenderStatus, PersistentOffenderRecord, UserSample};

/// Store operations the tracker needs. Kept narrow and trait-based so the
/// tracker can be unit tested against an in-memory fake rather than a real
/// store (spec §4.3 subset).
pub trait OffenderStore {
    fn open_offender(&mut self, username: &str, metric: Metric, start_time: i64, opening_usage: f64) -> u64;
    fn update_offender(&mut self, id: u64, peak: f64, sum: f64, count: u64);
    fn close_offender(&mut self, id: u64, end_time: i64);
}

#[derive(Clone, Debug)]
struct Window {
    id: u64,
    start_time: i64,
    peak: f64,
    sum: f64,
    count: u64,
    promoted: bool,
}

impl Window {
    fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    fn duration_minutes(&self, now: i64) -> i64 {
        (now - self.start_time) / 60
    }

    fn to_record(&self, username: &str, metric: Metric, now: i64, end_time: Option<i64>) -> PersistentOffenderRecord {
        PersistentOffenderRecord {
            id: self.id,
            username: username.to_string(),
            metric,
            start_time: self.start_time,
            end_time,
            duration_minutes: self.duration_minutes(end_time.unwrap_or(now)),
            peak_usage: self.peak,
            average_usage: self.average(),
            sample_count: self.count,
            resolved: false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum TrackerEvent {
    Promoted {
        username: String,
        metric: Metric,
        record: PersistentOffenderRecord,
    },
    Closed {
        username: String,
        metric: Metric,
        record: PersistentOffenderRecord,
        was_persistent: bool,
    },
}

/// Tracks offender windows in memory, keyed by `(username, metric)`.
#[derive(Default)]
pub struct PersistenceTracker {
    windows: HashMap<(String, Metric), Window>,
}

impl PersistenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of windows currently in `OPEN_PERSISTENT`, for the classifier.
    pub fn open_persistent_count(&self) -> usize {
        self.windows.values().filter(|w| w.promoted).count()
    }

    /// Current offender status of a single `(user, metric)` window, for
    /// annotating a user's entry in an alert's `user_details` (spec §4.6).
    pub fn status(&self, username: &str, metric: Metric) -> OffenderStatus {
        match self.windows.get(&(username.to_string(), metric)) {
            Some(window) if window.promoted => OffenderStatus::OpenPersistent,
            Some(_) => OffenderStatus::Open,
            None => OffenderStatus::None,
        }
    }

    /// Evaluates one tick's post-filter user samples against `config`'s
    /// thresholds, opening, updating, promoting, or closing windows as
    /// needed, and returns the events that occurred.
    pub fn tick(
        &mut self,
        store: &mut dyn OffenderStore,
        config: &Config,
        now: i64,
        users: &[UserSample],
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for user in users {
            seen.insert(user.username.clone());
            for metric in [Metric::Cpu, Metric::Memory] {
                let value = match metric {
                    Metric::Cpu => user.cpu_percent,
                    Metric::Memory => user.memory_percent,
                };
                let threshold = match metric {
                    Metric::Cpu => config.effective_cpu_threshold(&user.username),
                    Metric::Memory => config.effective_memory_threshold(&user.username),
                } as f64;
                let persistent_time_secs = config.effective_persistent_time_minutes(&user.username) as i64 * 60;

                self.apply_sample(
                    store,
                    &mut events,
                    &user.username,
                    metric,
                    value,
                    threshold,
                    persistent_time_secs,
                    now,
                );
            }
        }

        // Users absent from this tick (filtered out, or vanished) are
        // treated as below-threshold so their windows close rather than
        // persisting forever.
        let stale_keys: Vec<(String, Metric)> = self
            .windows
            .keys()
            .filter(|(username, _)| !seen.contains(username))
            .cloned()
            .collect();
        for (username, metric) in stale_keys {
            self.close_window(store, &mut events, &username, metric, now);
        }

        events
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_sample(
        &mut self,
        store: &mut dyn OffenderStore,
        events: &mut Vec<TrackerEvent>,
        username: &str,
        metric: Metric,
        value: f64,
        threshold: f64,
        persistent_time_secs: i64,
        now: i64,
    ) {
        let key = (username.to_string(), metric);
        if value >= threshold {
            if let Some(window) = self.windows.get_mut(&key) {
                window.peak = window.peak.max(value);
                window.sum += value;
                window.count += 1;
                store.update_offender(window.id, window.peak, window.sum, window.count);

                if !window.promoted && now - window.start_time >= persistent_time_secs {
                    window.promoted = true;
                    let record = window.to_record(username, metric, now, None);
                    events.push(TrackerEvent::Promoted {
                        username: username.to_string(),
                        metric,
                        record,
                    });
                }
            } else {
                let id = store.open_offender(username, metric, now, value);
                self.windows.insert(
                    key,
                    Window {
                        id,
                        start_time: now,
                        peak: value,
                        sum: value,
                        count: 1,
                        promoted: false,
                    },
                );
            }
        } else {
            self.close_window(store, events, username, metric, now);
        }
    }

    fn close_window(
        &mut self,
        store: &mut dyn OffenderStore,
        events: &mut Vec<TrackerEvent>,
        username: &str,
        metric: Metric,
        now: i64,
    ) {
        let key = (username.to_string(), metric);
        if let Some(window) = self.windows.remove(&key) {
            store.close_offender(window.id, now);
            let was_persistent = window.promoted;
            let record = window.to_record(username, metric, now, Some(now));
            events.push(TrackerEvent::Closed {
                username: username.to_string(),
                metric,
                record,
                was_persistent,
            });
        }
    }

    /// Restores in-memory state from durable records with `end_time ==
    /// null` on Doctor startup. Windows older than `persistent_time + 2 *
    /// check_interval` with no corroborating recent activity are
    /// auto-closed with a synthetic recovery event (spec §4.4).
    pub fn recover(
        &mut self,
        store: &mut dyn OffenderStore,
        config: &Config,
        now: i64,
        open_rows: Vec<PersistentOffenderRecord>,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        for row in open_rows {
            if !row.is_open() {
                continue;
            }
            let persistent_time_secs = config.effective_persistent_time_minutes(&row.username) as i64 * 60;
            let stale_after = persistent_time_secs + 2 * config.check_interval_secs as i64;
            let age = now - row.start_time;

            if age >= stale_after {
                warn!(
                    username = %row.username,
                    metric = %row.metric,
                    age_secs = age,
                    "auto-closing stale offender window found at startup"
                );
                store.close_offender(row.id, now);
                let mut record = row.clone();
                record.end_time = Some(now);
                record.duration_minutes = (now - row.start_time) / 60;
                events.push(TrackerEvent::Closed {
                    username: row.username.clone(),
                    metric: row.metric,
                    record,
                    was_persistent: true,
                });
                continue;
            }

            let promoted = age >= persistent_time_secs;
            self.windows.insert(
                (row.username.clone(), row.metric),
                Window {
                    id: row.id,
                    start_time: row.start_time,
                    peak: row.peak_usage,
                    sum: row.average_usage * row.sample_count as f64,
                    count: row.sample_count.max(1),
                    promoted,
                },
            );
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeStore {
        next_id: u64,
        opened: Vec<(String, Metric, i64, f64)>,
        updated: Vec<(u64, f64, f64, u64)>,
        closed: Vec<(u64, i64)>,
    }

    impl OffenderStore for FakeStore {
        fn open_offender(&mut self, username: &str, metric: Metric, start_time: i64, opening_usage: f64) -> u64 {
            self.next_id += 1;
            self.opened.push((username.to_string(), metric, start_time, opening_usage));
            self.next_id
        }

        fn update_offender(&mut self, id: u64, peak: f64, sum: f64, count: u64) {
            self.updated.push((id, peak, sum, count));
        }

        fn close_offender(&mut self, id: u64, end_time: i64) {
            self.closed.push((id, end_time));
        }
    }

    fn user(username: &str, cpu: f64) -> UserSample {
        UserSample {
            username: username.to_string(),
            uid: 1001,
            cpu_percent: cpu,
            memory_percent: 0.0,
            process_count: 1,
            pids: vec![1],
        }
    }

    /// Scenario 3 (spec §8): 85% CPU for 60 ticks at 60s interval, 60 min
    /// persistent_time -> exactly one PersistentUser promotion on tick 60.
    #[test]
    fn promotion_happens_exactly_on_the_threshold_tick() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        let mut promotions = 0;
        for tick in 0..=60 {
            let now = tick as i64 * 60;
            let events = tracker.tick(&mut store, &config, now, &[user("build", 85.0)]);
            promotions += events
                .iter()
                .filter(|e| matches!(e, TrackerEvent::Promoted { .. }))
                .count();
        }
        assert_eq!(promotions, 1);

        // Dropping below threshold closes the (now persistent) window with one Recovery-eligible close.
        let events = tracker.tick(&mut store, &config, 61 * 60, &[user("build", 10.0)]);
        let closed = events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::Closed { was_persistent: true, .. }))
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn no_promotion_below_threshold() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        for tick in 0..120 {
            let now = tick as i64 * 60;
            let events = tracker.tick(&mut store, &config, now, &[user("build", 50.0)]);
            assert!(events.is_empty());
        }
        assert_eq!(tracker.open_persistent_count(), 0);
    }

    #[test]
    fn brief_dip_closes_window_without_grace_period() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        tracker.tick(&mut store, &config, 0, &[user("build", 90.0)]);
        let events = tracker.tick(&mut store, &config, 60, &[user("build", 40.0)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TrackerEvent::Closed { was_persistent: false, .. }));
    }

    #[test]
    fn user_missing_from_tick_closes_its_window() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        tracker.tick(&mut store, &config, 0, &[user("build", 90.0)]);
        let events = tracker.tick(&mut store, &config, 60, &[]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TrackerEvent::Closed { .. }));
    }

    #[test]
    fn recovery_continues_window_when_still_fresh() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        let row = PersistentOffenderRecord {
            id: 7,
            username: "build".to_string(),
            metric: Metric::Cpu,
            start_time: 0,
            end_time: None,
            duration_minutes: 10,
            peak_usage: 90.0,
            average_usage: 85.0,
            sample_count: 10,
            resolved: false,
        };
        let events = tracker.recover(&mut store, &config, 600, vec![row]);
        assert!(events.is_empty());
        assert_eq!(tracker.open_persistent_count(), 0);

        // Continues tracking: a further high sample should update, not reopen.
        let events = tracker.tick(&mut store, &config, 660, &[user("build", 90.0)]);
        assert!(events.is_empty());
        assert_eq!(store.opened.len(), 0, "should not re-open an id already restored");
    }

    #[test]
    fn status_reflects_open_then_open_persistent_then_none() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        assert_eq!(tracker.status("build", Metric::Cpu), OffenderStatus::None);

        tracker.tick(&mut store, &config, 0, &[user("build", 90.0)]);
        assert_eq!(tracker.status("build", Metric::Cpu), OffenderStatus::Open);

        let stale_after = config.persistent_time_minutes as i64 * 60;
        tracker.tick(&mut store, &config, stale_after, &[user("build", 90.0)]);
        assert_eq!(tracker.status("build", Metric::Cpu), OffenderStatus::OpenPersistent);

        tracker.tick(&mut store, &config, stale_after + 60, &[user("build", 10.0)]);
        assert_eq!(tracker.status("build", Metric::Cpu), OffenderStatus::None);
    }

    #[test]
    fn recovery_auto_closes_stale_window() {
        let mut tracker = PersistenceTracker::new();
        let mut store = FakeStore::default();
        let config = Config::default();

        let stale_after = config.persistent_time_minutes as i64 * 60 + 2 * config.check_interval_secs as i64;
        let row = PersistentOffenderRecord {
            id: 9,
            username: "build".to_string(),
            metric: Metric::Cpu,
            start_time: 0,
            end_time: None,
            duration_minutes: 120,
            peak_usage: 90.0,
            average_usage: 85.0,
            sample_count: 120,
            resolved: false,
        };
        let events = tracker.recover(&mut store, &config, stale_after + 1, vec![row]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TrackerEvent::Closed { was_persistent: true, .. }));
        assert_eq!(store.closed.len(), 1);
    }
}
