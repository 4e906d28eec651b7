// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tollgate — metered API gateway
//
//  Architecture: monoio thread-per-core + shared-nothing data plane
//  Control:      snapshot cache over in-process stores (standalone YAML)
//  Metering:     per-key rate windows, monthly quotas, batched usage log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

mod seed;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::{Parser, Subcommand};
use seed::{SeedState, Stores};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tollgate_core::config::GatewayConfig;
use tollgate_core::key::generate_key;
use tollgate_metering::{QuotaChecker, RateLimiter, RecorderConfig, UsageRecorder};
use tollgate_proxy::worker::{self, SharedState};
use tollgate_proxy::{Authenticator, Pipeline};
use tollgate_store::{MemoryRateLimitStore, MemoryUsageStore, SnapshotCache};
use tracing::info;

/// Global shutdown flag — set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Tollgate — metered API gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tollgate/tollgate.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed-state file (plans, users, keys, routes, upstreams) loaded at
    /// startup.
    #[arg(long, default_value = "data/tollgate-state.yaml")]
    state_file: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an API key and print the raw secret exactly once.
    Keygen {
        /// Owning user id
        #[arg(long)]
        user_id: String,

        /// Key display name
        #[arg(long, default_value = "cli-issued")]
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "Loading config file");
        GatewayConfig::load(&cli.config)?
    } else {
        info!("No config file found, using defaults");
        GatewayConfig::default()
    };

    if let Some(Command::Keygen { user_id, name }) = cli.command {
        return keygen(&config, &user_id, &name);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node_id,
        "Tollgate starting — monoio thread-per-core engine"
    );

    let num_workers = config.effective_workers();

    // ── Stores + seed state ──
    let stores = Stores::new();
    if cli.state_file.exists() {
        let state = SeedState::load(&cli.state_file)?;
        stores.apply(state);
    } else {
        info!(path = %cli.state_file.display(), "No seed state file; starting empty");
    }
    let rate_windows = Arc::new(MemoryRateLimitStore::new());
    let usage = Arc::new(MemoryUsageStore::new());

    // ── Snapshot cache; route/upstream mutations invalidate it ──
    let snapshots = SnapshotCache::new(stores.routes.clone(), stores.upstreams.clone())?;
    {
        let cache = Arc::clone(&snapshots);
        stores
            .routes
            .set_on_change(Arc::new(move || cache.invalidate()));
    }
    {
        let cache = Arc::clone(&snapshots);
        stores
            .upstreams
            .set_on_change(Arc::new(move || cache.invalidate()));
    }

    // ── Usage recorder ──
    let recorder = UsageRecorder::start(
        usage.clone(),
        RecorderConfig {
            capacity: config.recorder.capacity,
            batch_size: config.recorder.batch_size,
            flush_interval: Duration::from_millis(config.recorder.flush_interval_ms),
            max_attempts: config.recorder.max_attempts,
            close_timeout: Duration::from_millis(config.recorder.close_timeout_ms),
            ..RecorderConfig::default()
        },
    );

    // ── Pipeline ──
    let config = Arc::new(config);
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&snapshots),
        Authenticator::new(stores.keys.clone(), stores.users.clone()),
        RateLimiter::new(rate_windows, config.rate_limit.fail_open),
        QuotaChecker::new(
            usage.clone(),
            Duration::from_secs(config.quota.summary_ttl_secs),
            config.quota.warn_percent,
        ),
        stores.plans.clone(),
        Arc::clone(&recorder),
        Arc::clone(&config),
    ));

    // ── Workers ──
    let shared = SharedState::new(pipeline, Arc::clone(&snapshots), Arc::clone(&config));
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers);

    info!(
        workers = num_workers,
        proxy_addr = %config.proxy.http_addr,
        "Tollgate is ready — serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutdown signal received, draining usage recorder");
    let drained = recorder.close();
    let stats = recorder.stats();
    info!(
        drained,
        flushed = stats.flushed,
        dropped = stats.dropped,
        "Tollgate stopped"
    );

    drop(worker_handles);
    Ok(())
}

/// Issue a key against the configured vanity prefix. The raw secret is
/// printed here and nowhere else; only (prefix, hash) belong in the seed
/// state.
fn keygen(config: &GatewayConfig, user_id: &str, name: &str) -> anyhow::Result<()> {
    use base64::Engine as _;

    let generated = generate_key(&config.auth.key_prefix);
    let id = uuid::Uuid::new_v4().to_string();
    let hash_b64 = base64::engine::general_purpose::STANDARD.encode(&generated.hash);

    println!("raw key (shown once): {}", generated.raw);
    println!();
    println!("seed-state entry:");
    println!("  - id: {}", id);
    println!("    user_id: {}", user_id);
    println!("    name: {}", name);
    println!("    prefix: {}", generated.prefix);
    println!("    hash: \"{}\"", hash_b64);
    Ok(())
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
