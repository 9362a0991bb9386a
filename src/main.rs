use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dnsward::config::Config;
use dnsward::core::Core;
use dnsward::supervisor::{self, PidLock};
use tracing_subscriber::EnvFilter;

/// DNS fallback proxy: forwards client queries to a primary resolver,
/// falling back to configured upstreams on failure or timeout.
#[derive(Parser, Debug)]
#[command(name = "dnswardd", version, about)]
struct Cli {
    /// Path to the INI-shaped configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Validate configuration and exit without starting the listeners.
    #[arg(long)]
    check_config: bool,
}

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;
const EXIT_LOCK_CONTENTION: u8 = 3;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    if cli.check_config {
        println!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let pid_file = config.pid_file.clone();
    let lock = match PidLock::acquire(&pid_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_LOCK_CONTENTION);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start async runtime: {e}");
            return ExitCode::from(EXIT_BIND_FAILURE);
        }
    };

    let core = Core::new(config);
    let result = runtime.block_on(supervisor::run(core));
    drop(lock);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("listener failed: {e}");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
    }
}
