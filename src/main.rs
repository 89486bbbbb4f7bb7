use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Identity, RateLimiter};
use turnstile::store::open_store;

/// Admission limiter for client IPs and API tokens.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `turnstile=debug`
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks for one identity and print each decision as JSON
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Client IP address
    #[arg(long)]
    ip: Option<String>,

    /// API token; takes precedence over --ip
    #[arg(long)]
    token: Option<String>,

    /// Number of consecutive checks
    #[arg(long, default_value_t = 1)]
    repeat: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    info!(
        ip_limit = config.limits.ip_limit,
        token_limit = config.limits.token_limit,
        block_duration_secs = config.limits.block_duration_secs,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let store = open_store(&config.storage).await;
    let limiter = RateLimiter::from_config(store.clone(), &config.limits);

    let outcome = match cli.command {
        Command::Check(args) => {
            tokio::select! {
                result = run_checks(&limiter, args) => result,
                _ = shutdown_signal() => Ok(()),
            }
        }
    };

    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close counter store");
    }

    outcome
}

async fn run_checks(limiter: &RateLimiter, args: CheckArgs) -> anyhow::Result<()> {
    let identity = Identity::resolve(args.token.as_deref(), args.ip.as_deref())
        .ok_or_else(|| anyhow::anyhow!("either --ip or --token is required"))?;

    info!(
        kind = %identity.kind(),
        backend = limiter.store().backend(),
        repeat = args.repeat,
        "Running admission checks"
    );

    for _ in 0..args.repeat {
        let status = limiter.check(&identity).await?;
        println!("{}", serde_json::to_string(&status)?);
    }

    Ok(())
}

fn init_tracing(filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
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
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
