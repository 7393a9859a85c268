//! ptgate — guarded evidence & health-gate supervisor for the
//! paper-trading ops pipeline.
//!
//! Subcommands are short-lived, single-threaded invocations meant to be
//! driven by an external scheduler or an operator. Exit codes follow the
//! documented convention: 0 PASS, 1 internal error, 2 usage error,
//! 3 gate failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ptgate_core::config::GateConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;
mod systemd;

use exit_codes::codes;

/// ptgate — guarded evidence & health-gate supervisor
#[derive(Parser, Debug)]
#[command(name = "ptgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to supervisor configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the health gate over the tick tree
    Health(commands::health::HealthArgs),

    /// Compute alerting metrics over the tick tree
    Metrics(commands::metrics::MetricsArgs),

    /// Evaluate the composed meta gate (the verdict CI consults)
    Meta(commands::meta::MetaArgs),

    /// Prune old evidence units, keeping the newest N
    Prune(commands::prune::PruneArgs),

    /// Stop every feeding job and capture final evidence
    Stop(commands::stop::StopArgs),

    /// Re-verify an evidence unit from its pin
    Verify(commands::verify::VerifyArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("ptgate: {error}");
            std::process::exit(i32::from(codes::USAGE));
        },
    };

    tracing::debug!(command = ?cli.command, "dispatching");
    let code = match cli.command {
        Commands::Health(args) => commands::health::run(&args, &config),
        Commands::Metrics(args) => commands::metrics::run(&args, &config),
        Commands::Meta(args) => commands::meta::run(&args, &config),
        Commands::Prune(args) => commands::prune::run(&args),
        Commands::Stop(args) => commands::stop::run(&args, &config),
        Commands::Verify(args) => commands::verify::run(&args),
    };
    std::process::exit(i32::from(code));
}

fn load_config(path: Option<&std::path::Path>) -> Result<GateConfig, ptgate_core::ConfigError> {
    match path {
        Some(path) => GateConfig::from_file(path),
        None => Ok(GateConfig::default()),
    }
}
