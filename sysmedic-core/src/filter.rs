//! User filter applied between the sampler and everything downstream
//! (spec §4.2).

use crate::config::UserFilteringConfig;
use crate::model::UserSample;

/// Applies `cfg` to `samples`, keeping a user's sample only if it is in
/// `always_include` or passes every one of: uid rule, not excluded,
/// noise-floor (cpu OR memory), minimum process count.
pub fn apply(cfg: &UserFilteringConfig, samples: Vec<UserSample>) -> Vec<UserSample> {
    samples
        .into_iter()
        .filter(|s| passes(cfg, s))
        .collect()
}

fn passes(cfg: &UserFilteringConfig, sample: &UserSample) -> bool {
    if cfg.always_include.iter().any(|u| u == &sample.username) {
        return true;
    }

    if sample.uid < cfg.min_uid {
        return false;
    }
    if cfg.excluded_users.iter().any(|u| u == &sample.username) {
        return false;
    }
    let above_noise_floor =
        sample.cpu_percent >= cfg.min_cpu_percent || sample.memory_percent >= cfg.min_memory_percent;
    if !above_noise_floor {
        return false;
    }
    if sample.process_count < cfg.min_process_count {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(username: &str, uid: u32, cpu: f64, mem: f64, procs: u32) -> UserSample {
        UserSample {
            username: username.to_string(),
            uid,
            cpu_percent: cpu,
            memory_percent: mem,
            process_count: procs,
            pids: vec![1],
        }
    }

    #[test]
    fn system_uid_is_dropped() {
        let cfg = UserFilteringConfig::default();
        let out = apply(&cfg, vec![sample("daemonuser", 5, 50.0, 50.0, 3)]);
        assert!(out.is_empty());
    }

    #[test]
    fn excluded_user_is_dropped_even_above_min_uid() {
        let mut cfg = UserFilteringConfig::default();
        cfg.excluded_users.push("build".to_string());
        let out = apply(&cfg, vec![sample("build", 1500, 90.0, 90.0, 5)]);
        assert!(out.is_empty());
    }

    #[test]
    fn always_include_bypasses_every_other_rule() {
        let mut cfg = UserFilteringConfig::default();
        cfg.always_include.push("watchdog".to_string());
        let out = apply(&cfg, vec![sample("watchdog", 1, 0.0, 0.0, 0)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn below_noise_floor_on_both_metrics_is_dropped() {
        let cfg = UserFilteringConfig::default();
        let out = apply(&cfg, vec![sample("build", 1001, 1.0, 1.0, 3)]);
        assert!(out.is_empty());
    }

    #[test]
    fn cpu_or_memory_above_floor_is_sufficient() {
        let cfg = UserFilteringConfig::default();
        let out = apply(&cfg, vec![sample("build", 1001, 0.0, 10.0, 3)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn below_min_process_count_is_dropped() {
        let mut cfg = UserFilteringConfig::default();
        cfg.min_process_count = 2;
        let out = apply(&cfg, vec![sample("build", 1001, 90.0, 90.0, 1)]);
        assert!(out.is_empty());
    }

    #[test]
    fn passing_user_is_kept() {
        let cfg = UserFilteringConfig::default();
        let out = apply(&cfg, vec![sample("build", 1001, 10.0, 10.0, 2)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].username, "build");
    }
}
