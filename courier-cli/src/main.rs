use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_core::config::Config;
use courier_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use courier_core::metrics::init_metrics;
use courier_core::shutdown::install_signal_handlers;
use courier_core::{
    ConnectionRegistry, Gateway, MemoryStore, PresenceMonitor, Repositories, RetryScheduler,
    ShutdownCoordinator, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(author, version, about = "Real-time message delivery engine", long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the delivery engine until SIGINT/SIGTERM
    Run {
        /// TOML configuration file; defaults plus COURIER_* variables otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate a configuration file
    CheckConfig { path: PathBuf },
    /// Print the default configuration as TOML
    DefaultConfig,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env().context("reading COURIER_* variables")?;
    config.validate()?;
    Ok(config)
}

fn init_logs(config: &Config, args: &Args) -> Result<()> {
    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level.parse::<LogLevel>()?;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    if config.metrics.enabled {
        init_metrics();
    }

    let store = Arc::new(MemoryStore::new());
    let repos = Repositories::in_memory(store);
    let clock = Arc::new(SystemClock);
    let registry = Arc::new(ConnectionRegistry::new());
    let gateway = Arc::new(Gateway::new(
        registry,
        repos.clone(),
        clock.clone(),
        config.gateway.clone(),
    ));
    let retry = Arc::new(RetryScheduler::new(
        repos.clone(),
        gateway.clone(),
        None,
        clock.clone(),
        config.retry.clone(),
    ));
    let presence = Arc::new(PresenceMonitor::new(
        repos,
        gateway,
        clock,
        config.presence.clone(),
    ));
    warn!("No push gateway configured, push fallback disabled");

    let coordinator = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(coordinator.clone()).context("installing signal handlers")?;

    let retry_task = tokio::spawn(retry.run(coordinator.subscribe()));
    let presence_task = tokio::spawn(presence.run(coordinator.subscribe()));
    info!("Courier engine running");

    coordinator.subscribe().wait().await;
    retry_task.await.context("retry scheduler panicked")?;
    presence_task.await.context("presence monitor panicked")?;

    info!("Courier engine stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Run { config } => {
            let config = load_config(config.as_deref())?;
            init_logs(&config, &args)?;
            run(config).await
        }
        Command::CheckConfig { path } => {
            let config = load_config(Some(path.as_path()))?;
            println!("{} is valid", path.display());
            println!(
                "retry: every {:?}, base {:?}, max {} attempts; presence timeout {:?}",
                config.retry.poll_interval,
                config.retry.base_interval,
                config.retry.max_retries,
                config.presence.timeout
            );
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", Config::default().to_toml()?);
            Ok(())
        }
    }
}
