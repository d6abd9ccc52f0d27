//! Append-only write-ahead log. Events are length-prefixed, CRC32-checksummed
//! bincode records, replayed on startup to rebuild state newer than the last
//! `state.bin` snapshot (grounded in `StorageManager::recover_from_wal`).

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{Alert, AuthSecret, Metric};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreEvent {
    OffenderOpened {
        id: u64,
        username: String,
        metric: Metric,
        start_time: i64,
        opening_usage: f64,
    },
    OffenderUpdated {
        id: u64,
        peak: f64,
        sum: f64,
        count: u64,
    },
    OffenderClosed {
        id: u64,
        end_time: i64,
    },
    AlertInserted(Box<Alert>),
    AlertResolved {
        id: u64,
        at: i64,
    },
    SecretRotated(AuthSecret),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WalRecord {
    seq: u64,
    event: StoreEvent,
}

pub struct WalWriter {
    file: File,
}

impl WalWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, seq: u64, event: &StoreEvent) -> io::Result<()> {
        let record = WalRecord {
            seq,
            event: event.clone(),
        };
        let payload = bincode::serialize(&record).map_err(to_io_err)?;
        let checksum = crc32fast::hash(&payload);
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.flush()?;
        Ok(())
    }

    /// Truncates the log to empty, called right after a fresh `state.bin`
    /// snapshot has captured everything the log held.
    pub fn truncate(&mut self, path: &Path) -> io::Result<()> {
        self.file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(())
    }
}

fn to_io_err(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Reads all well-formed records from `path` with `seq > after_seq`,
/// stopping at the first truncated or corrupt record (a crash mid-append
/// leaves at most one partial trailing record).
pub fn replay(path: &Path, after_seq: u64) -> io::Result<Vec<(u64, StoreEvent)>> {
    let Ok(file) = File::open(path) else {
        return Ok(Vec::new());
    };
    let mut reader = BufReader::new(file);
    let mut out = Vec::new();

    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let mut checksum_buf = [0u8; 4];
        if reader.read_exact(&mut checksum_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let expected_checksum = u32::from_le_bytes(checksum_buf);

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            break;
        }
        if crc32fast::hash(&payload) != expected_checksum {
            break;
        }
        let Ok(record) = bincode::deserialize::<WalRecord>(&payload) else {
            break;
        };
        if record.seq > after_seq {
            out.push((record.seq, record.event));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(1, &StoreEvent::OffenderOpened {
                id: 1,
                username: "build".to_string(),
                metric: Metric::Cpu,
                start_time: 0,
                opening_usage: 90.0,
            })
            .unwrap();
            w.append(2, &StoreEvent::OffenderClosed { id: 1, end_time: 60 }).unwrap();
        }
        let events = replay(&path, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[1].0, 2);
    }

    #[test]
    fn replay_skips_already_snapshotted_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(1, &StoreEvent::OffenderClosed { id: 1, end_time: 10 }).unwrap();
            w.append(2, &StoreEvent::OffenderClosed { id: 2, end_time: 20 }).unwrap();
        }
        let events = replay(&path, 1).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 2);
    }

    #[test]
    fn replay_stops_at_truncated_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut w = WalWriter::open(&path).unwrap();
            w.append(1, &StoreEvent::OffenderClosed { id: 1, end_time: 10 }).unwrap();
        }
        // Simulate a crash mid-append: corrupt trailing bytes.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();

        let events = replay(&path, 0).unwrap();
        assert_eq!(events.len(), 1);
    }
}
