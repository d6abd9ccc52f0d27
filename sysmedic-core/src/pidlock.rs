//! File-based PID lock (spec §6): guards against two Doctor processes (or
//! two WebSocket processes) running against the same data directory at
//! once. Liveness is checked the same way the rest of this crate reads
//! process state — via `/proc/<pid>` — rather than pulling in a signals
//! crate for a single `kill(pid, 0)` check.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

#[derive(Debug)]
pub enum PidLockError {
    AlreadyRunning(u32),
    Io(io::Error),
}

impl std::fmt::Display for PidLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidLockError::AlreadyRunning(pid) => write!(f, "another process is already running (pid {pid})"),
            PidLockError::Io(e) => write!(f, "pid file error: {e}"),
        }
    }
}

impl std::error::Error for PidLockError {}

impl From<io::Error> for PidLockError {
    fn from(e: io::Error) -> Self {
        PidLockError::Io(e)
    }
}

/// Holds a PID file for the lifetime of the process; removed on drop.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquires the lock at `path`, reclaiming a stale file left by a
    /// process that is no longer alive (spec §6, §9(c): "assigns the PID
    /// file to whichever process acquires the advisory lock first").
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidLockError> {
        let path = path.into();
        if let Some(existing_pid) = read_pid(&path) {
            if process_alive(existing_pid) {
                return Err(PidLockError::AlreadyRunning(existing_pid));
            }
            warn!(pid = existing_pid, ?path, "reclaiming stale pid file");
        }

        let mut file = File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
