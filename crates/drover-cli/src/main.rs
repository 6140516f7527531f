mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, quota::QuotaSubcommand, run::RunArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Run daily routines unattended across a fleet of emulated devices",
    version,
    propagate_version = true
)]
struct Cli {
    /// Farm config file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "DROVER_CONFIG",
        default_value = "config/farms.yaml"
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run routines on the configured targets
    Run(RunArgs),

    /// List configured targets with their 1-based indexes
    Targets,

    /// Check the config file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect or reset daily task progress
    Quota {
        #[command(subcommand)]
        subcommand: QuotaSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => cmd::run::run(&cli.config, args, cli.json),
        Commands::Targets => cmd::targets::run(&cli.config, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Quota { subcommand } => cmd::quota::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
