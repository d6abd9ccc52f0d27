//! Core of sysmedic: per-user persistence detection for Linux hosts.
//!
//! This crate contains everything that is shared between the Doctor process
//! (the sole writer to the persistent store) and the WebSocket process (a
//! reader of that store). It has no knowledge of configuration file formats,
//! CLI argument parsing, or dashboard rendering — those are the concern of
//! the binaries built on top of it.

pub mod alerts;
pub mod broadcast;
pub mod classifier;
pub mod config;
pub mod filter;
pub mod model;
pub mod pidlock;
pub mod procfs;
pub mod sampler;
pub mod store;
pub mod tracker;
