//! sysmedic-doctord - host and per-user load monitoring daemon.
//!
//! Samples `/proc`, tracks per-user persistence windows, classifies system
//! load, and raises deduplicated alerts into the persistent store. The
//! store's `state.bin` is the only channel to the WebSocket and CLI
//! processes; this binary is the store's sole writer.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system after a chunk flush
/// or retention sweep.
#[cfg(not(target_env = "msvc"))]
fn release_memory_to_os() {
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.4096.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

#[cfg(target_env = "msvc")]
fn release_memory_to_os() {}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use rand::RngCore;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use sysmedic_core::alerts::AlertEngine;
use sysmedic_core::classifier::{self, ClassifierThresholds};
use sysmedic_core::config::{Config, UserFilteringConfig};
use sysmedic_core::model::{Alert, AuthSecret, Severity, SystemStatus};
use sysmedic_core::pidlock::PidLock;
use sysmedic_core::procfs::resolver::UserResolver;
#[cfg(target_os = "linux")]
use sysmedic_core::procfs::RealFs;
#[cfg(not(target_os = "linux"))]
use sysmedic_core::procfs::fs::MockFs;
use sysmedic_core::sampler::Sampler;
use sysmedic_core::store::Store;
use sysmedic_core::tracker::PersistenceTracker;
use sysmedic_core::{filter, procfs};

/// Doctor process: samples `/proc`, tracks per-user load, emits alerts.
#[derive(Parser)]
#[command(name = "sysmedic-doctord", about = "SysMedic host monitoring daemon", version)]
struct Args {
    /// Sampling interval in seconds.
    #[arg(short = 'i', long, default_value = "60")]
    check_interval: u64,

    /// Data directory for the persistent store and PID file.
    #[arg(short = 'd', long, default_value = "/var/lib/sysmedic")]
    data_dir: String,

    /// Path to /proc (for testing/mocking).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Host CPU threshold (percent) that forces Heavy.
    #[arg(long, default_value = "80")]
    cpu_threshold: u32,

    /// Host memory threshold (percent) that forces Heavy.
    #[arg(long, default_value = "80")]
    memory_threshold: u32,

    /// Minutes a host-level condition must persist before... (reserved; the
    /// host rule has no duration requirement, only per-user windows do).
    #[arg(long, default_value = "60")]
    persistent_time: u32,

    /// Default per-user CPU threshold (percent).
    #[arg(long, default_value = "80")]
    user_cpu_threshold: u32,

    /// Default per-user memory threshold (percent).
    #[arg(long, default_value = "80")]
    user_memory_threshold: u32,

    /// Default per-user persistence window, in minutes.
    #[arg(long, default_value = "60")]
    user_persistent_time: u32,

    /// Minimum age (days) before samples become eligible for cleanup.
    #[arg(long, default_value = "30")]
    retention_days: u32,

    /// Minimum UID tracked; anything below is assumed to be a system account.
    #[arg(long, default_value = "1000")]
    min_uid: u32,

    /// Comma-separated usernames excluded regardless of UID.
    #[arg(long, value_delimiter = ',', default_value = "root,daemon,nobody,www-data")]
    excluded_users: Vec<String>,

    /// Comma-separated usernames always tracked regardless of every other rule.
    #[arg(long, value_delimiter = ',', default_value = "")]
    always_include: Vec<String>,

    /// Cap on representative PIDs recorded per user.
    #[arg(long, default_value = "32")]
    max_pids_per_user: usize,

    /// Dedup cooldown for identical alerts, in seconds.
    #[arg(long, default_value = "300")]
    alert_cooldown_secs: i64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            check_interval_secs: self.check_interval,
            cpu_threshold: self.cpu_threshold,
            memory_threshold: self.memory_threshold,
            persistent_time_minutes: self.persistent_time,
            user_cpu_threshold: self.user_cpu_threshold,
            user_memory_threshold: self.user_memory_threshold,
            user_persistent_time_minutes: self.user_persistent_time,
            user_thresholds: HashMap::new(),
            retention_days: self.retention_days,
            user_filtering: UserFilteringConfig {
                min_uid: self.min_uid,
                excluded_users: self.excluded_users.iter().filter(|s| !s.is_empty()).cloned().collect(),
                always_include: self.always_include.iter().filter(|s| !s.is_empty()).cloned().collect(),
                ..UserFilteringConfig::default()
            },
            data_dir: self.data_dir.clone(),
            max_pids_per_user: self.max_pids_per_user,
            alert_cooldown_secs: self.alert_cooldown_secs,
            ..Config::default()
        }
    }
}

/// Default level is INFO. `-v`/`-vv` raise it; `-q` overrides to errors only.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sysmedic_doctord={level}").parse().unwrap())
        .add_directive(format!("sysmedic_core={level}").parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn now_wall() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Generates and persists a fresh `AuthSecret` if the store has none yet
/// (first-ever startup against this data directory, spec §4.7/§9).
fn ensure_auth_secret(store: &mut Store) {
    if store.auth_secret().is_some() {
        return;
    }
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let secret = AuthSecret::from_bytes(bytes, 1);
    if let Err(e) = store.rotate_secret(secret) {
        warn!(error = %e, "failed to persist initial auth secret");
    } else {
        info!("generated initial websocket auth secret");
    }
}

/// Drains alerts onto a side channel so the sampling thread never blocks on
/// whatever downstream handling an alert eventually needs (today: logging;
/// spec §4.6 doesn't mandate an external delivery channel, only durability,
/// which `try_emit` already gave the alert before it reaches this queue).
fn alert_dispatch_loop(rx: mpsc::Receiver<Alert>) {
    while let Ok(alert) = rx.recv() {
        match alert.severity {
            Severity::Critical | Severity::High => {
                warn!(
                    alert_type = ?alert.alert_type,
                    severity = ?alert.severity,
                    cause = ?alert.primary_cause,
                    "{}",
                    alert.message
                );
            }
            Severity::Medium | Severity::Low => {
                info!(alert_type = ?alert.alert_type, severity = ?alert.severity, "{}", alert.message);
            }
        }
    }
}

fn retention_loop(store: Arc<Mutex<Store>>, retention_days: u32, running: Arc<AtomicBool>) {
    const CHECK_EVERY: Duration = Duration::from_secs(3600);
    const SLEEP_GRANULARITY: Duration = Duration::from_millis(100);

    while running.load(Ordering::SeqCst) {
        let mut remaining = CHECK_EVERY;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let slice = remaining.min(SLEEP_GRANULARITY);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let now = now_wall();
        let removed = {
            let mut store = store.lock().unwrap();
            store.cleanup_older_than(retention_days, now, 64)
        };
        match removed {
            Ok(n) if n > 0 => {
                info!(removed = n, "retention sweep removed expired chunk files");
                release_memory_to_os();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("sysmedic-doctord {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        data_dir = %args.data_dir,
        check_interval_secs = args.check_interval,
        "configuration loaded"
    );

    let config = args.to_config();

    let pid_path = std::path::Path::new(&args.data_dir).join("sysmedic.doctor.pid");
    let _pid_lock = match PidLock::acquire(&pid_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "failed to acquire pid lock");
            std::process::exit(1);
        }
    };

    let mut store = match Store::open(&args.data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };
    ensure_auth_secret(&mut store);

    let mut tracker = PersistenceTracker::new();
    let open_rows = store.open_offenders();
    if !open_rows.is_empty() {
        info!(count = open_rows.len(), "recovering offender windows from prior run");
        let recovery_events = tracker.recover(&mut store, &config, now_wall(), open_rows);
        debug!(events = recovery_events.len(), "recovery complete");
    }

    let store = Arc::new(Mutex::new(store));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install signal handler");
    }

    let retention_store = store.clone();
    let retention_running = running.clone();
    let retention_days = config.retention_days;
    let retention_handle =
        std::thread::spawn(move || retention_loop(retention_store, retention_days, retention_running));

    let (alert_tx, alert_rx) = mpsc::sync_channel::<Alert>(256);
    let dispatch_handle = std::thread::spawn(move || alert_dispatch_loop(alert_rx));

    #[cfg(target_os = "linux")]
    let fs = RealFs::new();
    #[cfg(not(target_os = "linux"))]
    let fs = MockFs::new();

    let resolver = UserResolver::load(&fs, std::path::Path::new("/etc/passwd"));
    let mut sampler = Sampler::new(fs, args.proc_path.clone(), resolver).with_max_pids_per_user(config.max_pids_per_user);
    let mut alert_engine = AlertEngine::new(config.alert_cooldown_secs);
    let thresholds = ClassifierThresholds {
        host_cpu: config.cpu_threshold,
        host_memory: config.memory_threshold,
        user_cpu: config.user_cpu_threshold,
        user_memory: config.user_memory_threshold,
    };

    let mut previous_status = SystemStatus::Light;
    let mut snapshot_count: u64 = 0;
    let start = Instant::now();
    let interval = Duration::from_secs(config.check_interval_secs.max(1));

    info!("starting sampling loop");

    while running.load(Ordering::SeqCst) {
        let wall_now = now_wall();
        let mono_now_ms = start.elapsed().as_millis() as i64;

        match sampler.sample(wall_now, mono_now_ms) {
            Ok((mut host, users)) => {
                host.clamp_percentages();
                let filtered = filter::apply(&config.user_filtering, users);

                let mut guard = store.lock().unwrap();
                let tracker_events = tracker.tick(&mut *guard, &config, wall_now, &filtered);
                let open_persistent = tracker.open_persistent_count();

                let status = if host.warming {
                    SystemStatus::Light
                } else {
                    classifier::classify(thresholds, &host, &filtered, open_persistent)
                };

                let host_over = host.cpu_percent >= thresholds.host_cpu as f64
                    || host.memory_percent >= thresholds.host_memory as f64;
                let any_persistent = open_persistent > 0;
                let primary_cause = if any_persistent {
                    filtered
                        .iter()
                        .max_by(|a, b| a.cpu_percent.partial_cmp(&b.cpu_percent).unwrap_or(std::cmp::Ordering::Equal))
                        .map(|u| u.username.as_str())
                } else {
                    None
                };

                let mut emitted =
                    alert_engine.on_tracker_events(&mut *guard, wall_now, &host, &filtered, &tracker, &tracker_events);
                emitted.extend(alert_engine.on_status_transition(
                    &mut *guard,
                    wall_now,
                    previous_status,
                    status,
                    &host,
                    &filtered,
                    &tracker,
                    host_over,
                    any_persistent,
                    primary_cause,
                ));

                let open_offenders = guard.open_offenders();
                if let Err(e) = guard.commit_tick(&host, &filtered, status, open_offenders) {
                    error!(error = %e, "failed to commit tick");
                }
                drop(guard);

                for alert in emitted {
                    if alert_tx.try_send(alert).is_err() {
                        warn!("alert dispatch queue full, dropping a log-only notification");
                    }
                }

                previous_status = status;
                snapshot_count += 1;
                if snapshot_count == 1 {
                    info!(cpu = host.cpu_percent, mem = host.memory_percent, warming = host.warming, "first sample collected");
                } else {
                    debug!(cpu = host.cpu_percent, mem = host.memory_percent, status = ?status, "tick completed");
                }
                if snapshot_count.is_multiple_of(60) {
                    info!(snapshot_count, ?status, "periodic status");
                    release_memory_to_os();
                }
            }
            Err(e) => {
                error!(error = %e, "sample collection failed");
            }
        }

        let sleep_step = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let step = remaining.min(sleep_step);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    info!("shutting down");
    drop(alert_tx);
    let _ = dispatch_handle.join();
    let _ = retention_handle.join();
    info!("shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_to_config_threads_cli_flags_through() {
        let args = Args {
            check_interval: 30,
            data_dir: "/tmp/x".to_string(),
            proc_path: "/proc".to_string(),
            cpu_threshold: 70,
            memory_threshold: 70,
            persistent_time: 45,
            user_cpu_threshold: 60,
            user_memory_threshold: 60,
            user_persistent_time: 45,
            retention_days: 14,
            min_uid: 500,
            excluded_users: vec!["root".to_string()],
            always_include: vec![],
            max_pids_per_user: 16,
            alert_cooldown_secs: 120,
            verbose: 0,
            quiet: false,
        };
        let config = args.to_config();
        assert_eq!(config.check_interval_secs, 30);
        assert_eq!(config.cpu_threshold, 70);
        assert_eq!(config.user_filtering.min_uid, 500);
        assert_eq!(config.retention_days, 14);
    }
}
