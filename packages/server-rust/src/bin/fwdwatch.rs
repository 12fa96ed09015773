//! fwdwatch: replays a routing node's HTLC and invoice streams through the
//! relay and logs every settled forward and settled invoice.
//!
//! ```sh
//! fwdwatch --directory dir.json --htlc-events htlc.jsonl --invoices invoices.jsonl
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fwdwatch_core::{Category, SystemClock};
use fwdwatch_server::{LogSubscriber, Relay, RelayConfig, ReplayNode, StaticDirectory};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Correlate forwarding events and relay them to subscribers.
#[derive(Parser, Debug)]
#[command(name = "fwdwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Channel/alias directory (JSON)
    #[arg(long, env = "FWDWATCH_DIRECTORY")]
    directory: PathBuf,

    /// HTLC events to replay, one JSON record per line
    #[arg(long, env = "FWDWATCH_HTLC_EVENTS")]
    htlc_events: Option<PathBuf>,

    /// Invoice updates to replay, one JSON record per line
    #[arg(long, env = "FWDWATCH_INVOICES")]
    invoices: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "FWDWATCH_LOG_JSON")]
    log_json: bool,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, env = "FWDWATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "FWDWATCH_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Resolver round-trip timeout, in milliseconds
    #[arg(long, env = "FWDWATCH_RESOLVER_TIMEOUT_MS", default_value_t = 5_000)]
    resolver_timeout_ms: u64,

    /// Per-subscriber delivery timeout, in milliseconds
    #[arg(long, env = "FWDWATCH_DELIVERY_TIMEOUT_MS", default_value_t = 2_000)]
    delivery_timeout_ms: u64,

    /// Age after which an unresolved forward is evicted, in seconds
    #[arg(long, env = "FWDWATCH_PENDING_MAX_AGE_SECS", default_value_t = 3_600)]
    pending_max_age_secs: u64,

    /// Interval between stale-entry sweeps, in seconds
    #[arg(long, env = "FWDWATCH_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Maximum number of pending forwards
    #[arg(long, env = "FWDWATCH_MAX_PENDING", default_value_t = 50_000)]
    max_pending: usize,

    /// Grace period for dispatchers on shutdown, in seconds
    #[arg(long, env = "FWDWATCH_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,

    /// Substituted for identities that cannot be resolved
    #[arg(long, env = "FWDWATCH_PLACEHOLDER", default_value = "unknown")]
    placeholder: String,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            resolver_timeout: Duration::from_millis(self.resolver_timeout_ms),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            pending_max_age: Duration::from_secs(self.pending_max_age_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_pending: self.max_pending,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            placeholder: self.placeholder.clone(),
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fwdwatch failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Serving metrics");
    }

    let directory = StaticDirectory::load(&cli.directory)
        .await
        .with_context(|| format!("failed to load directory {}", cli.directory.display()))?;

    let relay = Relay::new(cli.relay_config(), Arc::new(directory), Arc::new(SystemClock))?;

    // Subscribers are held here; the registry only keeps weak handles.
    let mut subscribers = Vec::new();
    for (category, path) in [
        (Category::Forward, &cli.htlc_events),
        (Category::InvoiceSettled, &cli.invoices),
    ] {
        if path.is_some() {
            let subscriber = Arc::new(LogSubscriber::new(format!("log-{category}")));
            relay.register(category, &subscriber);
            subscribers.push(subscriber);
        }
    }

    let node = ReplayNode {
        htlc_events: cli.htlc_events.clone(),
        invoices: cli.invoices.clone(),
    };
    let mut handle = relay.start(Arc::new(node)).await?;
    info!(categories = ?handle.categories(), "fwdwatch running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
            } else {
                info!("Interrupt received; shutting down");
            }
        }
        exits = handle.join() => {
            info!(dispatchers = exits.len(), "All streams ended");
        }
    }

    handle.stop().await;
    drop(subscribers);
    info!("fwdwatch stopped");
    Ok(())
}
