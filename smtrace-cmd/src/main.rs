mod check;
mod run;

use std::io::stderr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smtrace::config::Config;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read all configured meters and send reports until interrupted.
    ///
    /// SIGINT or SIGTERM stop all readers; the process exits once they have
    /// finished.
    Run {
        /// Configuration file.
        #[arg(short, long, default_value = "smtrace.yaml", value_name = "path")]
        config: PathBuf,
    },
    /// Validate a configuration file and show the resolved meters and reports.
    Check {
        /// Configuration file.
        #[arg(short, long, default_value = "smtrace.yaml", value_name = "path")]
        config: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: check::Format,
    },
}

fn load(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(stderr)
        .with_ansi(false)
        .without_time()
        .with_env_filter(
            EnvFilter::try_from_env("SMTRACE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { config } => {
            let config = load(config)?;
            init_logging(&config.general.log_level);
            run::run(config)
        }
        Commands::Check { config, format } => {
            init_logging("warn");
            let config = load(config)?;
            check::check(&config, format)
        }
    }
}
