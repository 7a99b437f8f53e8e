//! `vigild` entry point.
//!
//! Parses flags (environment variables as fallback), initialises structured
//! logging, and runs the daemon on a current-thread runtime — the dispatch
//! model is cooperative and single-threaded by design, so one core is all
//! it ever uses.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use vigil_core::PluginRegistry;
use vigil_server::config::ServerConfig;

/// The vigil policy-decision daemon.
#[derive(Parser, Debug)]
#[command(name = "vigild", version, about = "vigil policy-decision daemon")]
struct Cli {
    /// Directory holding the policy database.
    #[arg(long, env = "VIGIL_STATE_PATH", default_value = "/var/lib/vigil/db")]
    state_dir: PathBuf,

    /// Directory the listening sockets are created in.
    #[arg(long, env = "VIGIL_RUNTIME_DIR", default_value = "/run/vigil")]
    runtime_dir: PathBuf,

    /// Log filter, tracing-subscriber syntax.
    #[arg(long, env = "VIGIL_LOG", default_value = "info")]
    log_filter: String,

    /// Capacity of the monitor entry ring.
    #[arg(long, env = "VIGIL_MONITOR_CAPACITY", default_value_t = vigil_core::monitor::DEFAULT_CAPACITY)]
    monitor_capacity: usize,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_filter)),
        )
        .init();

    let config = ServerConfig {
        runtime_dir: cli.runtime_dir,
        state_dir: cli.state_dir,
        log_filter: cli.log_filter,
        monitor_capacity: cli.monitor_capacity,
    };

    info!(
        state_dir = %config.state_dir.display(),
        runtime_dir = %config.runtime_dir.display(),
        "vigild starting"
    );

    // Plugins for non-terminal policy types register here before the
    // daemon starts serving.
    let plugins = PluginRegistry::new();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(vigil_server::run(config, plugins))
}
