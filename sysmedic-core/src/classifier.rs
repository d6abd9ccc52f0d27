//! Pure system status classification (spec §4.5), grounded in the rule-table
//! shape of the teacher's `analysis::rules` (e.g. `CpuHighRule`): no I/O, no
//! state, just thresholds evaluated against a snapshot.

use crate::model::{HostSample, SystemStatus, UserSample};

#[derive(Clone, Copy, Debug)]
pub struct ClassifierThresholds {
    pub host_cpu: u32,
    pub host_memory: u32,
    pub user_cpu: u32,
    pub user_memory: u32,
}

/// Fraction of a threshold that puts the host in the "medium band" even
/// without crossing the threshold outright (spec §4.5).
const MEDIUM_BAND_FRACTION: f64 = 0.75;

/// Classifies system status from the latest samples and the count of
/// currently `OPEN_PERSISTENT` offender windows. Evaluated top-to-bottom;
/// first matching rule wins. Emits no alerts — that is the Alert Engine's job.
pub fn classify(
    thresholds: ClassifierThresholds,
    host: &HostSample,
    users: &[UserSample],
    open_persistent_count: usize,
) -> SystemStatus {
    let host_over =
        host.cpu_percent >= thresholds.host_cpu as f64 || host.memory_percent >= thresholds.host_memory as f64;
    let any_persistent = open_persistent_count > 0;
    if host_over || any_persistent {
        return SystemStatus::Heavy;
    }

    let medium_band = host.cpu_percent >= thresholds.host_cpu as f64 * MEDIUM_BAND_FRACTION
        || host.memory_percent >= thresholds.host_memory as f64 * MEDIUM_BAND_FRACTION;
    let any_user_over = users.iter().any(|u| {
        u.cpu_percent >= thresholds.user_cpu as f64 || u.memory_percent >= thresholds.user_memory as f64
    });
    if medium_band || any_user_over {
        return SystemStatus::Medium;
    }

    SystemStatus::Light
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ClassifierThresholds {
        ClassifierThresholds {
            host_cpu: 80,
            host_memory: 80,
            user_cpu: 80,
            user_memory: 80,
        }
    }

    fn host(cpu: f64, mem: f64) -> HostSample {
        HostSample {
            cpu_percent: cpu,
            memory_percent: mem,
            ..Default::default()
        }
    }

    #[test]
    fn quiet_system_is_light() {
        let status = classify(thresholds(), &host(0.0, 0.0), &[], 0);
        assert_eq!(status, SystemStatus::Light);
    }

    #[test]
    fn host_over_threshold_is_heavy() {
        let status = classify(thresholds(), &host(92.0, 0.0), &[], 0);
        assert_eq!(status, SystemStatus::Heavy);
    }

    #[test]
    fn any_persistent_forces_heavy_even_if_host_quiet() {
        let status = classify(thresholds(), &host(5.0, 5.0), &[], 1);
        assert_eq!(status, SystemStatus::Heavy);
    }

    #[test]
    fn medium_band_without_crossing_threshold_is_medium() {
        let status = classify(thresholds(), &host(61.0, 0.0), &[], 0);
        assert_eq!(status, SystemStatus::Medium);
    }

    #[test]
    fn user_over_threshold_is_medium_when_host_quiet() {
        let mut u = crate::model::UserSample::default();
        u.cpu_percent = 85.0;
        let status = classify(thresholds(), &host(5.0, 5.0), &[u], 0);
        assert_eq!(status, SystemStatus::Medium);
    }

    #[test]
    fn heavy_rule_wins_over_medium_rule() {
        let mut u = crate::model::UserSample::default();
        u.cpu_percent = 85.0;
        let status = classify(thresholds(), &host(90.0, 0.0), &[u], 0);
        assert_eq!(status, SystemStatus::Heavy);
    }
}
