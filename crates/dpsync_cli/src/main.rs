//! dpsync CLI
//!
//! Command-line entry point for the dataplane sync agent.
//!
//! # Commands
//!
//! - `agent` - Subscribe to a sync service and apply the latest dataplane view
//! - `serve` - Run the reference sync server, optionally preloaded from a feed
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Dataplane policy sync agent.
#[derive(Parser)]
#[command(name = "dpsync")]
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
    /// Subscribe to a sync service and apply updates until Ctrl-C
    Agent {
        /// Sync service address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:50051")]
        target: String,

        /// Subscription tag selecting the feed
        #[arg(short, long, default_value = "default")]
        subscription: String,

        /// Delay between reconnect attempts, in milliseconds
        #[arg(long, default_value = "500")]
        retry_ms: u64,

        /// Connect timeout, in milliseconds
        #[arg(long, default_value = "5000")]
        connect_timeout_ms: u64,

        /// Simulated time to program one dataplane view, in milliseconds
        #[arg(long, default_value = "0")]
        apply_ms: u64,
    },

    /// Run the reference sync server until Ctrl-C
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:50051")]
        bind: SocketAddr,

        /// JSON-lines file of updates to preload
        #[arg(short, long)]
        feed: Option<PathBuf>,

        /// Maximum concurrent subscribers
        #[arg(long, default_value = "256")]
        max_connections: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Agent {
            target,
            subscription,
            retry_ms,
            connect_timeout_ms,
            apply_ms,
        } => {
            commands::agent::run(commands::agent::AgentOptions {
                target,
                subscription,
                retry_ms,
                connect_timeout_ms,
                apply_ms,
            })?;
        }
        Commands::Serve {
            bind,
            feed,
            max_connections,
        } => {
            commands::serve::run(bind, feed.as_deref(), max_connections)?;
        }
        Commands::Version => {
            println!("dpsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
