use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bluehub::config::{self, Config};
use bluehub::daemon;

#[derive(Parser)]
#[command(name = "bluehub")]
#[command(author, version, about = "BLE device management daemon", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to an alternate config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Log to stdout instead of the rolling log file
        #[arg(short, long)]
        foreground: bool,
    },

    /// Show the effective configuration
    Config,
}

/// Guard that must be kept alive for file logging to work
struct LogGuard {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn init_logging(verbose: bool, foreground: bool, config_level: Option<&str>) -> LogGuard {
    // Priority: RUST_LOG env > --verbose flag > config file > default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config_level.unwrap_or("info")
        };
        // zbus and rumqttc are chatty one level below us
        EnvFilter::new(format!("bluehub={level},zbus=warn,rumqttc=warn"))
    });

    if foreground {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();

        LogGuard { _guard: None }
    } else {
        let log_dir = Config::data_dir()
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|_| std::env::temp_dir());

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {}: {}",
                log_dir.display(),
                e
            );
        }

        let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "bluehub.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .init();

        LogGuard {
            _guard: Some(guard),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            if let Some(path) = &cli.config {
                let config = Config::load_from(path)?;
                println!("Config file: {}\n", path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                config::show()?;
            }
            Ok(())
        }
        Commands::Start { foreground } => {
            let config = match &cli.config {
                Some(path) => Config::load_from(path)?,
                None => Config::load()?,
            };
            let _guard = init_logging(cli.verbose, foreground, config.log.level.as_deref());
            info!("bluehub {} starting", env!("CARGO_PKG_VERSION"));

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(daemon::run(config))?;
            Ok(())
        }
    }
}
