//! tracksync CLI
//!
//! Command-line tools for exercising the tracksync core.
//!
//! # Commands
//!
//! - `simulate` - Drive job runs through an in-memory backend and print
//!   every state change a view would render
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use commands::simulate::SimulateOptions;
use tracing_subscriber::EnvFilter;

/// tracksync command-line tools.
#[derive(Parser)]
#[command(name = "tracksync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate tracked job runs against an in-memory backend
    Simulate {
        /// Number of runs tracked at once
        #[arg(short, long, default_value = "1")]
        runs: usize,

        /// Server-side updates per run
        #[arg(short, long, default_value = "5")]
        steps: u32,

        /// Milliseconds between updates
        #[arg(long, default_value = "1000")]
        step_ms: u64,

        /// Active poll interval in milliseconds
        #[arg(long, default_value = "3000")]
        poll_ms: u64,

        /// Channel reconnect backoff in milliseconds
        #[arg(long, default_value = "2000")]
        backoff_ms: u64,

        /// Drop every Nth push event
        #[arg(long)]
        drop_every: Option<u64>,

        /// Break push channels after this step
        #[arg(long)]
        break_channel_at: Option<u32>,

        /// Revoke access to every run from this step on
        #[arg(long)]
        forbid_at: Option<u32>,

        /// Poll only, without a push channel
        #[arg(long)]
        no_push: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            runs,
            steps,
            step_ms,
            poll_ms,
            backoff_ms,
            drop_every,
            break_channel_at,
            forbid_at,
            no_push,
            format,
        } => {
            let options = SimulateOptions {
                runs,
                steps,
                step_ms,
                poll_ms,
                backoff_ms,
                drop_every,
                break_channel_at,
                forbid_at,
                push: !no_push,
                format,
            };
            commands::simulate::run(&options)?;
        }
        Commands::Version => {
            println!("tracksync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("tracksync core v{}", tracksync_core::VERSION);
        }
    }

    Ok(())
}
