//! Yieldnet CLI
//!
//! Command-line interface for driving the yield allocation validator:
//! local demo rounds, the scoring sweep daemon and request inspection.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Yieldnet: score miner capital allocations across lending pools.
///
/// Requests fan out to miners, answers are collected and frozen, and a
/// periodic sweep simulates each allocation's yield and commits scores.
#[derive(Parser)]
#[command(name = "yieldnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a self-contained scoring round against scripted miners
    Demo {
        /// Number of synthetic requests to issue
        #[arg(short, long, default_value_t = 3)]
        requests: usize,

        /// Number of scripted miners to dispatch to
        #[arg(short, long, default_value_t = 8)]
        miners: usize,

        /// Persist requests under this directory instead of in memory
        #[arg(short, long)]
        store_dir: Option<PathBuf>,

        /// Output format (json, human)
        #[arg(short, long, default_value = "human")]
        format: String,
    },

    /// Run the periodic scoring sweep over a persistent store
    ///
    /// Runs until interrupted. Organic requests score against the pool
    /// observations given at startup; pools absent from that file realize
    /// zero yield.
    Sweep {
        /// Request store directory
        #[arg(short, long)]
        store_dir: PathBuf,

        /// JSON file mapping pool ids to chain observations
        #[arg(short, long)]
        observations: Option<PathBuf>,
    },

    /// Show one stored request record
    Show {
        /// Request id
        id: String,

        /// Request store directory
        #[arg(short, long)]
        store_dir: PathBuf,

        /// Output format (json, human)
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Print the effective engine configuration
    ///
    /// Reads YIELDNET_* environment overrides on top of the defaults and
    /// prints the validated result as JSON.
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Demo {
            requests,
            miners,
            store_dir,
            format,
        } => commands::demo::run(requests, miners, store_dir, format),
        Commands::Sweep {
            store_dir,
            observations,
        } => commands::sweep::run(store_dir, observations),
        Commands::Show {
            id,
            store_dir,
            format,
        } => commands::show::run(id, store_dir, format),
        Commands::Config => commands::config::run(),
    }
}
