//! Access to and parsing of the Linux `/proc` filesystem (spec §4.1, §6).
//!
//! Parsing is split from I/O so the parsers can be exercised with literal
//! fixture strings (grounded in the teacher's `collector::procfs::parser`
//! style), and I/O is behind a `FileSystem` trait so the sampler can run
//! against an in-memory fixture in tests.

pub mod fs;
pub mod parser;
pub mod resolver;

pub use fs::{FileSystem, RealFs};
pub use resolver::UserResolver;
