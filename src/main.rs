use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use std::sync::Arc;

use scooter_ums::config::Config;
use scooter_ums::service::UmsService;

/// Log level for the service
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// scooter-ums command line arguments
#[derive(Parser, Debug)]
#[command(name = "scooter-ums")]
#[command(version, about = "USB mass-storage gadget service", long_about = None)]
struct CliArgs {
    /// Coordination bus address (overrides REDIS_ADDR)
    #[arg(long, value_name = "ADDR")]
    redis_addr: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting scooter-ums v{}", env!("CARGO_PKG_VERSION"));

    let config = match args.redis_addr {
        Some(ref addr) => Config::with_redis_addr(
            addr,
            std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
        )?,
        None => Config::from_env()?,
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let service = Arc::new(UmsService::new(config, shutdown).await?);
    service.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Cancel the root token on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "scooter_ums=error",
        LogLevel::Warn => "scooter_ums=warn",
        LogLevel::Info => "scooter_ums=info",
        LogLevel::Debug => "scooter_ums=debug",
        LogLevel::Trace => "scooter_ums=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
