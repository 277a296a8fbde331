//! Chaos testbench CLI
//!
//! Runs seeded, deterministic chaos scenarios against a gossip node binary:
//! provisions a network-namespace topology, launches the node in its roles,
//! drives a fault timeline, and records the run's artifacts.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one chaos scenario end to end
    Scenario {
        /// Topology shape (pair, line, throttle, star)
        shape: String,

        /// Node transport (tcp, quic)
        transport: String,

        /// Seed for deterministic fault parameters
        seed: u64,

        /// Nominal run duration in seconds
        duration_secs: u64,
    },

    /// Tear down a shape's namespaces and links left by a crashed run
    Cleanup {
        /// Topology shape (pair, line, throttle, star)
        shape: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Scenario {
            shape,
            transport,
            seed,
            duration_secs,
        } => commands::cmd_scenario(&shape, &transport, seed, duration_secs).await,
        Commands::Cleanup { shape } => commands::cmd_cleanup(&shape).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
