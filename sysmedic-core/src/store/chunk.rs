//! Hourly sample chunk files: `samples-YYYY-MM-DD-HH.chunk`, each an
//! append-only sequence of zstd-compressed, bincode-encoded ticks. Direct
//! analogue of the teacher's `storage::chunk::ChunkReader` hourly
//! segmentation, minus the seek index this store doesn't need since it only
//! ever scans forward within a bounded recent window.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{HostSample, UserSample};

const MAGIC: &[u8; 4] = b"SMC1";
const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: i64,
    pub host: HostSample,
    pub users: Vec<UserSample>,
}

/// Hour bucket a timestamp belongs to, truncated to the top of the hour.
fn hour_bucket(timestamp: i64) -> DateTime<Utc> {
    let dt = Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now);
    dt.date_naive()
        .and_hms_opt(dt.hour(), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(dt)
}

pub fn chunk_path(data_dir: &Path, timestamp: i64) -> PathBuf {
    let bucket = hour_bucket(timestamp);
    data_dir.join(format!("samples-{}.chunk", bucket.format("%Y-%m-%d-%H")))
}

/// Appends one tick to the chunk file for its hour, writing the magic
/// header first if the file is new.
pub fn append_tick(data_dir: &Path, tick: &Tick) -> io::Result<()> {
    let path = chunk_path(data_dir, tick.timestamp);
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if is_new {
        file.write_all(MAGIC)?;
    }

    let payload = bincode::serialize(tick).map_err(to_io_err)?;
    let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)?;
    file.write_all(&(compressed.len() as u32).to_le_bytes())?;
    file.write_all(&compressed)?;
    file.flush()?;
    Ok(())
}

fn to_io_err(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Reads every tick from a chunk file, in write order. Tolerates a
/// truncated trailing frame from a crash mid-write.
pub fn read_chunk(path: &Path) -> io::Result<Vec<Tick>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut compressed = vec![0u8; len];
        if reader.read_exact(&mut compressed).is_err() {
            break;
        }
        let Ok(payload) = zstd::decode_all(compressed.as_slice()) else {
            break;
        };
        let Ok(tick) = bincode::deserialize::<Tick>(&payload) else {
            break;
        };
        out.push(tick);
    }
    Ok(out)
}

/// Lists chunk files in `data_dir` whose hour bucket overlaps
/// `[since, until]`, in chronological order.
pub fn chunks_in_range(data_dir: &Path, since: i64, until: i64) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return Ok(paths);
    };
    let lower = hour_bucket(since).format("samples-%Y-%m-%d-%H.chunk").to_string();
    let upper = hour_bucket(until).format("samples-%Y-%m-%d-%H.chunk").to_string();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("samples-") && name.ends_with(".chunk") && name.as_str() >= lower.as_str() && name.as_str() <= upper.as_str() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64) -> Tick {
        Tick {
            timestamp: ts,
            host: HostSample {
                timestamp: ts,
                ..Default::default()
            },
            users: Vec::new(),
        }
    }

    #[test]
    fn appends_and_reads_back_multiple_ticks() {
        let dir = tempfile::tempdir().unwrap();
        append_tick(dir.path(), &tick(1_700_000_000)).unwrap();
        append_tick(dir.path(), &tick(1_700_000_060)).unwrap();

        let path = chunk_path(dir.path(), 1_700_000_000);
        let ticks = read_chunk(&path).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].timestamp, 1_700_000_000);
        assert_eq!(ticks[1].timestamp, 1_700_000_060);
    }

    #[test]
    fn different_hours_go_to_different_files() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = 1_700_000_000;
        let t1 = t0 + 3700; // well over an hour later
        append_tick(dir.path(), &tick(t0)).unwrap();
        append_tick(dir.path(), &tick(t1)).unwrap();
        assert_ne!(chunk_path(dir.path(), t0), chunk_path(dir.path(), t1));
    }
}
