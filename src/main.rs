use anyhow::Result;
use cascade::commands::{down, status, up};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Local multi-service development launcher", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all services in dependency order and monitor them
    Up {
        /// Path to cascade.toml
        #[arg(short, long, default_value = "cascade.toml")]
        config: PathBuf,

        /// Reassign ports automatically when a configured port is taken
        #[arg(long)]
        dynamic_ports: bool,

        /// Skip loading the secrets env file
        #[arg(long)]
        no_secrets: bool,

        /// Never prompt; assume safe defaults
        #[arg(long)]
        non_interactive: bool,
    },

    /// Stop services recorded in the discovery store
    Down {
        /// Path to cascade.toml
        #[arg(short, long, default_value = "cascade.toml")]
        config: PathBuf,
    },

    /// Show discovered services and their liveness
    Status {
        /// Path to cascade.toml
        #[arg(short, long, default_value = "cascade.toml")]
        config: PathBuf,
    },
}

fn main() {
    // Diagnostics go to stderr so they never interleave with the
    // human-facing output; RUST_LOG raises the level when debugging.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let result: Result<i32> = match cli.command {
        Commands::Up {
            config,
            dynamic_ports,
            no_secrets,
            non_interactive,
        } => up::execute(&config, dynamic_ports, no_secrets, non_interactive),
        Commands::Down { config } => down::execute(&config),
        Commands::Status { config } => status::execute(&config),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}
