use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use burstguard::config::{BurstguardConfig, LoggingConfig};
use burstguard::ratelimit::{InMemoryCounterStore, RateLimiter};
use burstguard::replay::{Replayer, RequestOrder};

/// How long an interrupted replay may take to notice the stop flag.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Replay a JSON-lines request trace through the rate limiter.
#[derive(Debug, Parser)]
#[command(name = "burstguard", version, about)]
struct Args {
    /// Configuration file (YAML); BURSTGUARD__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Threshold rules file, overriding `rules_path` from the configuration
    #[arg(short, long)]
    rules: Option<String>,

    /// Trace to replay; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Whether each request is counted before or after it is checked
    #[arg(long, value_enum, default_value_t = RequestOrder::RecordThenCheck)]
    order: RequestOrder,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BurstguardConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(rules) = args.rules.clone() {
        config.rules_path = Some(rules);
    }
    if args.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting Burstguard trace replay");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules = config
        .threshold_rules()
        .context("Failed to load threshold rules")?;
    info!(
        limit_per_second = rules.defaults.limit_per_second,
        burst_threshold_per_second = rules.defaults.burst_threshold_per_second,
        max_bursts_per_minute = rules.defaults.max_bursts_per_minute,
        overrides = rules.routes.len() + rules.api_keys.len(),
        "Threshold rules loaded"
    );

    let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::with_rules(rules)));
    let stop = Arc::new(AtomicBool::new(false));

    let order = args.order;
    let input = args.input.clone();
    let sweep_interval_secs = config.store.sweep_interval_secs;
    let replay_stop = Arc::clone(&stop);
    let mut replay = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        // Trace time drives eviction, not the wall clock
        let replayer = Replayer::new(&limiter, order)
            .with_sweep_interval(sweep_interval_secs)
            .with_stop(&replay_stop);
        let stdout = io::stdout().lock();
        let summary = match input {
            Some(path) => {
                let file = File::open(&path)
                    .with_context(|| format!("Failed to open trace {}", path.display()))?;
                replayer.run(BufReader::new(file), stdout)?
            }
            None => replayer.run(io::stdin().lock(), stdout)?,
        };
        Ok(summary)
    });

    tokio::select! {
        result = &mut replay => {
            let summary = result.context("Replay task failed")??;
            info!(
                total = summary.total,
                allowed = summary.allowed,
                rejected = summary.rejected,
                invalid = summary.invalid,
                swept = summary.swept,
                "Trace replayed"
            );
        }
        _ = shutdown_signal() => {
            stop.store(true, Ordering::Relaxed);

            // A replay blocked reading stdin never sees the flag, and the
            // runtime would wait for it on drop.
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut replay).await.is_err() {
                warn!("Replay still blocked on input, exiting");
                std::process::exit(130);
            }
        }
    }

    info!("Burstguard stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Decisions go to stdout, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}
