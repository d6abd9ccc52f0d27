//! sysmedic-wsd - WebSocket process: fans out live status and alerts read
//! from the Doctor-owned store to connected clients.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// MALLCTL_ARENAS_ALL = 4096: purges dirty pages from every jemalloc arena,
/// not just the calling thread's — this process allocates from many tokio
/// worker threads, each with its own arena.
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

mod auth;
mod background;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use sysmedic_core::pidlock::PidLock;
use sysmedic_core::store::StoreReader;

use state::AppStateInner;

/// WebSocket process: fans out live status and alerts to connected clients.
#[derive(Parser)]
#[command(name = "sysmedic-wsd", about = "SysMedic WebSocket broadcast server", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8060")]
    listen: String,

    /// Data directory the Doctor process writes to.
    #[arg(short = 'd', long, default_value = "/var/lib/sysmedic")]
    data_dir: String,

    /// Cadence of `system_update` broadcasts, in seconds.
    #[arg(long, default_value = "3")]
    broadcast_interval_secs: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

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
        .add_directive(format!("sysmedic_wsd={level}").parse().unwrap())
        .add_directive(format!("sysmedic_core={level}").parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("sysmedic-wsd {} starting", env!("CARGO_PKG_VERSION"));

    let addr: SocketAddr = match args.listen.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, listen = %args.listen, "invalid listen address");
            std::process::exit(1);
        }
    };

    let pid_path = std::path::Path::new(&args.data_dir).join("sysmedic.websocket.pid");
    let pid_lock = match PidLock::acquire(&pid_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "failed to acquire pid lock");
            std::process::exit(1);
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args, addr));

    drop(pid_lock);
}

async fn async_main(args: Args, addr: SocketAddr) {
    let store = StoreReader::new(args.data_dir.clone());
    let initial_secret_version = tokio::task::spawn_blocking({
        let store_path = args.data_dir.clone();
        move || StoreReader::new(store_path).auth_secret()
    })
    .await
    .ok()
    .and_then(|r| r.ok())
    .flatten()
    .map(|s| s.version)
    .unwrap_or(0);

    let shared_state = AppStateInner::new(store, addr.port(), args.broadcast_interval_secs, initial_secret_version);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install signal handler");
    }

    let background_state = shared_state.clone();
    let interval = Duration::from_secs(args.broadcast_interval_secs.max(1));
    tokio::spawn(async move {
        background::poll_loop(background_state, interval).await;
    });

    {
        let state_for_purge = shared_state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tick.tick().await;
                debug!(clients = state_for_purge.active_connections.load(Ordering::Relaxed), "hourly housekeeping");
                release_memory_to_os();
            }
        });
    }

    let app = Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/status", get(handlers::handle_status))
        .route("/ws", get(handlers::handle_ws))
        .layer(CorsLayer::permissive())
        .with_state(shared_state);

    info!(%addr, "listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind (port in use?)");
            std::process::exit(2);
        }
    };

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = wait_for_shutdown(running) => {
            info!("shutting down");
        }
    }
}

async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
