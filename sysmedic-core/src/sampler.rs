//! Periodic sampling of host and per-user metrics from `/proc` (spec §4.1).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::model::{HostSample, UserSample};
use crate::procfs::fs::FileSystem;
use crate::procfs::parser::{
    self, parse_loadavg, parse_meminfo, parse_net_dev_total_bytes, parse_proc_pid_stat,
    parse_proc_pid_status, parse_proc_stat_cpu, CpuTimes,
};
use crate::procfs::resolver::UserResolver;

/// Minimum gap between ticks before we treat the reading as clock skew and
/// replay the previous sample rather than risk a negative/infinite rate
/// (spec §4.1 edge cases).
const MIN_TICK_MS: i64 = 100;

/// Default warm-read delay for the very first sample (spec §4.1).
pub const DEFAULT_WARM_READ_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum SamplerError {
    ProcfsUnavailable(String),
}

impl std::fmt::Display for SamplerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplerError::ProcfsUnavailable(msg) => write!(f, "/proc unavailable: {msg}"),
        }
    }
}

impl std::error::Error for SamplerError {}

struct PrevState {
    mono_ms: i64,
    cpu: CpuTimes,
    net_bytes: u64,
    pid_jiffies: HashMap<u32, u64>,
}

/// Produces one `(HostSample, Vec<UserSample>)` per tick from successive
/// `/proc` reads (spec §4.1).
pub struct Sampler<F: FileSystem> {
    fs: F,
    proc_path: String,
    prev: Option<PrevState>,
    last_emitted: Option<(HostSample, Vec<UserSample>)>,
    resolver: UserResolver,
    max_pids_per_user: usize,
    warm_read_ms: u64,
    sleep: Box<dyn Fn(Duration) + Send>,
}

impl<F: FileSystem> Sampler<F> {
    pub fn new(fs: F, proc_path: impl Into<String>, resolver: UserResolver) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            prev: None,
            last_emitted: None,
            resolver,
            max_pids_per_user: 32,
            warm_read_ms: DEFAULT_WARM_READ_MS,
            sleep: Box::new(std::thread::sleep),
        }
    }

    pub fn with_max_pids_per_user(mut self, n: usize) -> Self {
        self.max_pids_per_user = n;
        self
    }

    /// Overrides the warm-read sleep, e.g. to a no-op in tests.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    fn read_host_state(&self) -> Result<(CpuTimes, u64), SamplerError> {
        let stat = self
            .fs
            .read_to_string(Path::new(&format!("{}/stat", self.proc_path)))
            .map_err(|e| SamplerError::ProcfsUnavailable(e.to_string()))?;
        let cpu = parse_proc_stat_cpu(&stat).map_err(|e| SamplerError::ProcfsUnavailable(e.to_string()))?;

        let net = self
            .fs
            .read_to_string(Path::new(&format!("{}/net/dev", self.proc_path)))
            .ok()
            .and_then(|c| parse_net_dev_total_bytes(&c).ok())
            .unwrap_or(0);

        Ok((cpu, net))
    }

    fn read_pid_jiffies(&self) -> HashMap<u32, u64> {
        let mut out = HashMap::new();
        let Ok(entries) = self.fs.read_dir(Path::new(&self.proc_path)) else {
            return out;
        };
        for entry in entries {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(pid) = name.parse::<u32>() else {
                continue;
            };
            let stat_path = format!("{}/{}/stat", self.proc_path, pid);
            let Ok(content) = self.fs.read_to_string(Path::new(&stat_path)) else {
                continue;
            };
            let Ok(stat) = parse_proc_pid_stat(&content) else {
                continue;
            };
            out.insert(pid, stat.utime + stat.stime);
        }
        out
    }

    /// Collects one sample. `wall_now` is the wall-clock Unix timestamp to
    /// stamp the sample with; `mono_now_ms` is a monotonic millisecond
    /// reading used for interval/clock-skew arithmetic.
    pub fn sample(
        &mut self,
        wall_now: i64,
        mono_now_ms: i64,
    ) -> Result<(HostSample, Vec<UserSample>), SamplerError> {
        let result = self.sample_inner(wall_now, mono_now_ms);
        if result.is_err() {
            // Tick-fatal: clear delta state so the next tick is a fresh warm read (spec §7).
            self.prev = None;
        }
        result
    }

    fn sample_inner(
        &mut self,
        wall_now: i64,
        mono_now_ms: i64,
    ) -> Result<(HostSample, Vec<UserSample>), SamplerError> {
        let Some(prev) = &self.prev else {
            return self.warm_start(wall_now, mono_now_ms);
        };

        let elapsed_ms = mono_now_ms - prev.mono_ms;
        if elapsed_ms < MIN_TICK_MS {
            warn!(elapsed_ms, "tick interval below minimum, replaying previous sample");
            return Ok(self
                .last_emitted
                .clone()
                .unwrap_or_else(|| (HostSample::default(), Vec::new())));
        }

        let (cpu, net_bytes) = self.read_host_state()?;
        let pid_jiffies = self.read_pid_jiffies();

        let host = build_host_sample(wall_now, &prev.cpu, &cpu, prev.net_bytes, net_bytes, elapsed_ms, self, false)?;
        let users = self.build_user_samples(&prev.pid_jiffies, &pid_jiffies, &cpu, &prev.cpu);

        self.prev = Some(PrevState {
            mono_ms: mono_now_ms,
            cpu,
            net_bytes,
            pid_jiffies,
        });
        self.last_emitted = Some((host.clone(), users.clone()));
        Ok((host, users))
    }

    fn warm_start(
        &mut self,
        wall_now: i64,
        mono_now_ms: i64,
    ) -> Result<(HostSample, Vec<UserSample>), SamplerError> {
        // First read, establishing t0.
        let (_cpu0, _net0) = self.read_host_state()?;
        (self.sleep)(Duration::from_millis(self.warm_read_ms));
        // Second read, becomes the baseline for the next external tick.
        let (cpu1, net1) = self.read_host_state()?;
        let pid_jiffies = self.read_pid_jiffies();

        self.prev = Some(PrevState {
            mono_ms: mono_now_ms,
            cpu: cpu1,
            net_bytes: net1,
            pid_jiffies,
        });

        let mem = self.host_memory_percent()?;
        let load = self.host_load_avg()?;
        let host = HostSample {
            timestamp: wall_now,
            cpu_percent: 0.0,
            memory_percent: mem,
            network_mbps: 0.0,
            load_avg_1: load.0,
            load_avg_5: load.1,
            load_avg_15: load.2,
            warming: true,
        };
        self.last_emitted = Some((host.clone(), Vec::new()));
        Ok((host, Vec::new()))
    }

    fn host_memory_percent(&self) -> Result<f64, SamplerError> {
        let content = self
            .fs
            .read_to_string(Path::new(&format!("{}/meminfo", self.proc_path)))
            .map_err(|e| SamplerError::ProcfsUnavailable(e.to_string()))?;
        let mem = parse_meminfo(&content).map_err(|e| SamplerError::ProcfsUnavailable(e.to_string()))?;
        if mem.mem_total_kb == 0 {
            return Ok(0.0);
        }
        let used = mem
            .mem_total_kb
            .saturating_sub(mem.mem_free_kb)
            .saturating_sub(mem.buffers_kb)
            .saturating_sub(mem.cached_kb);
        Ok((used as f64 / mem.mem_total_kb as f64) * 100.0)
    }

    fn host_load_avg(&self) -> Result<(f64, f64, f64), SamplerError> {
        let content = self
            .fs
            .read_to_string(Path::new(&format!("{}/loadavg", self.proc_path)))
            .unwrap_or_default();
        match parse_loadavg(&content) {
            Ok(l) => Ok((l.one, l.five, l.fifteen)),
            Err(_) => Ok((0.0, 0.0, 0.0)),
        }
    }

    /// Builds per-user samples by summing per-PID jiffy deltas (or, for
    /// newly-seen PIDs, their raw counter — spec §4.1) and VmRSS, grouped by
    /// resolved username.
    fn build_user_samples(
        &self,
        prev_pids: &HashMap<u32, u64>,
        cur_pids: &HashMap<u32, u64>,
        cur_cpu: &CpuTimes,
        prev_cpu: &CpuTimes,
    ) -> Vec<UserSample> {
        let delta_total = cur_cpu.total().saturating_sub(prev_cpu.total());

        struct Acc {
            uid: u32,
            cpu_jiffies: u64,
            mem_kb: u64,
            pids: Vec<u32>,
        }
        let mut by_user: HashMap<String, Acc> = HashMap::new();

        for (&pid, &cur_jiffies) in cur_pids {
            let delta = match prev_pids.get(&pid) {
                Some(&prev_jiffies) => cur_jiffies.saturating_sub(prev_jiffies),
                None => cur_jiffies,
            };

            let status_path = format!("{}/{}/status", self.proc_path, pid);
            let Ok(status_content) = self.fs.read_to_string(Path::new(&status_path)) else {
                continue;
            };
            let Ok(status) = parse_proc_pid_status(&status_content) else {
                continue;
            };
            let Some(uid) = status.uid else { continue };
            let Some(username) = self.resolver.resolve(uid) else {
                continue;
            };

            let acc = by_user.entry(username.to_string()).or_insert_with(|| Acc {
                uid,
                cpu_jiffies: 0,
                mem_kb: 0,
                pids: Vec::new(),
            });
            acc.cpu_jiffies += delta;
            acc.mem_kb += status.vm_rss_kb;
            acc.pids.push(pid);
        }

        let mem_total_kb = self
            .fs
            .read_to_string(Path::new(&format!("{}/meminfo", self.proc_path)))
            .ok()
            .and_then(|c| parse_meminfo(&c).ok())
            .map(|m| m.mem_total_kb)
            .unwrap_or(0);

        let mut samples: Vec<UserSample> = by_user
            .into_iter()
            .map(|(username, acc)| {
                let cpu_percent = if delta_total > 0 {
                    (acc.cpu_jiffies as f64 / delta_total as f64) * 100.0
                } else {
                    0.0
                };
                let memory_percent = if mem_total_kb > 0 {
                    (acc.mem_kb as f64 / mem_total_kb as f64) * 100.0
                } else {
                    0.0
                };
                let mut pids = acc.pids;
                pids.sort_unstable();
                pids.truncate(self.max_pids_per_user);
                let mut s = UserSample {
                    username,
                    uid: acc.uid,
                    cpu_percent,
                    memory_percent,
                    process_count: pids.len() as u32,
                    pids,
                };
                s.clamp_percentages();
                s
            })
            .collect();
        samples.sort_by(|a, b| a.username.cmp(&b.username));
        samples
    }
}

#[allow(clippy::too_many_arguments)]
fn build_host_sample<F: FileSystem>(
    wall_now: i64,
    prev_cpu: &CpuTimes,
    cur_cpu: &CpuTimes,
    prev_net_bytes: u64,
    cur_net_bytes: u64,
    elapsed_ms: i64,
    sampler: &Sampler<F>,
    warming: bool,
) -> Result<HostSample, SamplerError> {
    let delta_total = cur_cpu.total().saturating_sub(prev_cpu.total());
    let delta_idle = cur_cpu.idle_total().saturating_sub(prev_cpu.idle_total());

    let cpu_percent = if delta_total > 0 {
        100.0 * (1.0 - (delta_idle as f64 / delta_total as f64))
    } else {
        0.0
    };

    let delta_bytes = cur_net_bytes.saturating_sub(prev_net_bytes);
    let elapsed_secs = (elapsed_ms as f64 / 1000.0).max(0.001);
    let network_mbps = (delta_bytes as f64 / elapsed_secs) / 1_000_000.0;

    let memory_percent = sampler.host_memory_percent()?;
    let load = sampler.host_load_avg()?;

    let mut host = HostSample {
        timestamp: wall_now,
        cpu_percent,
        memory_percent,
        network_mbps,
        load_avg_1: load.0,
        load_avg_5: load.1,
        load_avg_15: load.2,
        warming,
    };
    host.clamp_percentages();
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::fs::MockFs;

    fn minimal_fs(cpu_line: &str, mem: &str, load: &str, net: &str) -> MockFs {
        let mut fs = MockFs::new();
        fs.add_file("/proc/stat", format!("{cpu_line}\n"));
        fs.add_file("/proc/meminfo", mem);
        fs.add_file("/proc/loadavg", load);
        fs.add_file("/proc/net/dev", net);
        fs.add_dir("/proc");
        fs
    }

    fn default_mem() -> &'static str {
        "MemTotal: 1000000 kB\nMemFree: 900000 kB\nBuffers: 0 kB\nCached: 0 kB\n"
    }

    fn default_load() -> &'static str {
        "0.0 0.0 0.0 1/1 1\n"
    }

    fn default_net() -> &'static str {
        "Inter-|Receive|Transmit\n face|bytes|bytes\n lo: 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0\n"
    }

    #[test]
    fn first_sample_is_warming_with_zero_cpu() {
        let fs = minimal_fs(
            "cpu  0 0 0 1000000 0 0 0 0",
            default_mem(),
            default_load(),
            default_net(),
        );
        let mut sampler = Sampler::new(fs, "/proc", UserResolver::new()).with_sleep(|_| {});
        let (host, users) = sampler.sample(1000, 0).unwrap();
        assert!(host.warming);
        assert_eq!(host.cpu_percent, 0.0);
        assert!(users.is_empty());
    }

    /// Scenario 1 (spec §8): idle rises by 1,000,000 out of 1,000,000 total -> cpu 0.0.
    #[test]
    fn quiet_system_yields_zero_cpu() {
        let fs = minimal_fs(
            "cpu  0 0 0 1000000 0 0 0 0",
            default_mem(),
            default_load(),
            default_net(),
        );
        let mut sampler = Sampler::new(fs, "/proc", UserResolver::new()).with_sleep(|_| {});
        sampler.sample(1000, 0).unwrap(); // warm-up

        // Second external tick: total and idle both rise by 1,000,000.
        sampler.fs.add_file("/proc/stat", "cpu  0 0 0 2000000 0 0 0 0\n");
        let (host, _users) = sampler.sample(1060, 60_000).unwrap();
        assert_eq!(host.cpu_percent, 0.0);
        assert!(!host.warming);
    }

    #[test]
    fn delta_safety_nonnegative_and_bounded() {
        let fs = minimal_fs(
            "cpu  0 0 0 100 0 0 0 0",
            default_mem(),
            default_load(),
            default_net(),
        );
        let mut sampler = Sampler::new(fs, "/proc", UserResolver::new()).with_sleep(|_| {});
        sampler.sample(1000, 0).unwrap();

        // All CPU, no idle growth -> should report 100, not negative/NaN/inf.
        sampler.fs.add_file("/proc/stat", "cpu  1000 0 0 100 0 0 0 0\n");
        let (host, _) = sampler.sample(1060, 60_000).unwrap();
        assert!(host.cpu_percent >= 0.0 && host.cpu_percent <= 100.0);
    }

    #[test]
    fn clock_skew_guard_replays_previous_sample() {
        let fs = minimal_fs(
            "cpu  0 0 0 100 0 0 0 0",
            default_mem(),
            default_load(),
            default_net(),
        );
        let mut sampler = Sampler::new(fs, "/proc", UserResolver::new()).with_sleep(|_| {});
        sampler.sample(1000, 0).unwrap();
        let (first, _) = sampler.sample(1060, 60_000).unwrap();

        // Tick arrives 10ms later: below MIN_TICK_MS, must replay.
        let (second, _) = sampler.sample(1060, 60_010).unwrap();
        assert_eq!(first.cpu_percent, second.cpu_percent);
    }

    #[test]
    fn procfs_unavailable_clears_delta_state() {
        let mut fs = minimal_fs(
            "cpu  0 0 0 100 0 0 0 0",
            default_mem(),
            default_load(),
            default_net(),
        );
        let mut sampler = Sampler::new(fs.clone(), "/proc", UserResolver::new()).with_sleep(|_| {});
        sampler.sample(1000, 0).unwrap();

        fs.remove_dir("/proc");
        let mut broken = Sampler::new(fs, "/proc", UserResolver::new()).with_sleep(|_| {});
        assert!(broken.sample(2000, 999_999).is_err());
        // Next sample after the error must warm-start again.
        assert!(broken.prev.is_none());
    }

    #[test]
    fn per_user_cpu_and_memory_percentages() {
        let mut fs = minimal_fs(
            "cpu  0 0 0 1000000 0 0 0 0",
            "MemTotal: 1000000 kB\nMemFree: 500000 kB\nBuffers: 0 kB\nCached: 0 kB\n",
            default_load(),
            default_net(),
        );
        fs.add_dir("/proc/42");
        fs.add_file("/proc/42/stat", "42 (build) S 1 42 42 0 -1 0 0 0 0 0 10 5 0 0 20 0 1 0 0 0\n");
        fs.add_file("/proc/42/status", "Name:\tbuild\nUid:\t1000\t1000\t1000\t1000\nVmRSS:\t100000 kB\n");

        let mut resolver = UserResolver::new();
        resolver.parse_into("builder:x:1000:1000::/home/builder:/bin/sh\n");

        let mut sampler = Sampler::new(fs, "/proc", resolver).with_sleep(|_| {});
        sampler.sample(1000, 0).unwrap();

        sampler.fs.add_file("/proc/stat", "cpu  100000 0 0 900000 0 0 0 0\n");
        sampler
            .fs
            .add_file("/proc/42/stat", "42 (build) S 1 42 42 0 -1 0 0 0 0 0 100000 0 0 0 20 0 1 0 0 0\n");
        let (_, users) = sampler.sample(1060, 60_000).unwrap();

        assert_eq!(users.len(), 1);
        let u = &users[0];
        assert_eq!(u.username, "builder");
        assert!(u.cpu_percent > 0.0 && u.cpu_percent <= 100.0);
        assert_eq!(u.memory_percent, 10.0);
        assert_eq!(u.process_count, 1);
    }
}
