//! On-disk persistent store (spec §4.3): WAL + hourly sample chunks +
//! an atomically-rewritten state snapshot.

pub mod chunk;
pub mod manager;
pub mod wal;

pub use manager::{Store, StoreReader, StoreStats};
pub use wal::StoreEvent;
