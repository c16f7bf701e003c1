//! emitfit CLI: train localisation networks, simulate datasets and inspect
//! configuration.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// emitfit: training orchestration for single-molecule localisation networks
#[derive(Parser, Debug)]
#[command(name = "emitfit", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a network
    Train(TrainArgs),
    /// Simulate a dataset for precomputed training
    Simulate {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Number of samples (defaults to simulation.pseudo_data_size)
        #[arg(short = 'n', long)]
        samples: Option<usize>,

        /// Random seed (defaults to hyper.seed)
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct TrainArgs {
    /// Number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Data mode: precomputed or online
    #[arg(long)]
    data_mode: Option<String>,

    /// Precomputed dataset file
    #[arg(long)]
    data_set: Option<PathBuf>,

    /// Samples per batch
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Checkpoint output path
    #[arg(long)]
    model_out: Option<PathBuf>,

    /// Checkpoint to warm-start from
    #[arg(long)]
    model_init: Option<PathBuf>,

    /// JSON-lines file for scalars and validation summaries
    #[arg(long)]
    scalars: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file
    Init,
    /// Show the resolved configuration
    Show,
    /// Load and validate the configuration
    Validate,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "emitfit", "emitfit")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "emitfit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref())
}
