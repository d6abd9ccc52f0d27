//! sysmedic-dump - read-only inspector for the SysMedic store, grounded in
//! `rpglotd-dump`'s dispatch-and-print-JSON shape (here dispatched on a
//! subcommand instead of a file extension, since there is one store format).

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};

use sysmedic_core::store::StoreReader;

#[derive(Parser)]
#[command(name = "sysmedic-dump", about = "Inspect the SysMedic persistent store", version)]
struct Cli {
    /// Data directory written by sysmedic-doctord.
    #[arg(short = 'd', long, default_value = "/var/lib/sysmedic")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Alert/offender counts and chunk file count.
    Stats,
    /// The current live snapshot (latest host/user samples, status, open offenders).
    Live,
    /// Host samples from the last `--since-secs` seconds.
    Samples {
        #[arg(long, default_value = "3600")]
        since_secs: i64,
    },
    /// Alerts raised in the last `--since-secs` seconds.
    Alerts {
        #[arg(long, default_value = "86400")]
        since_secs: i64,
        /// Filter to resolved (true) or unresolved (false) alerts only.
        #[arg(long)]
        resolved: Option<bool>,
    },
}

fn now_wall() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn main() {
    let cli = Cli::parse();
    let store = StoreReader::new(cli.data_dir.clone());
    let now = now_wall();

    let result = match cli.command {
        Command::Stats => store.stats().map(|s| serde_json::json!(s)),
        Command::Live => store.live_snapshot().map(|s| serde_json::json!(s)),
        Command::Samples { since_secs } => store.recent_host_samples(since_secs, now).map(|s| serde_json::json!(s)),
        Command::Alerts { since_secs, resolved } => {
            store.get_alerts_since(since_secs, now, resolved).map(|a| serde_json::json!(a))
        }
    };

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
        }
        Err(e) => {
            eprintln!("error reading store at {}: {e}", cli.data_dir.display());
            std::process::exit(1);
        }
    }
}
