// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Podshift CLI
//!
//! Operator interface for live pod migration between nodes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod report;

/// Migrate a running pod to another node via checkpoint/restore
#[derive(Parser)]
#[command(name = "migrate")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "/etc/podshift/podshift.yaml")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Pod to migrate: `id:<sandbox>`, `<namespace>/<name>`, `k=v[,k=v]` or `<name>`
    #[arg(requires = "destination")]
    pub pod: Option<String>,

    /// Destination node name
    pub destination: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the stored state of a migration
    Status {
        /// Migration ID
        id: String,
    },

    /// Continue an interrupted migration from its last persisted state
    Resume {
        /// Migration ID
        id: String,
    },

    /// Request cancellation of a migration that is capturing or transferring
    Cancel {
        /// Migration ID
        id: String,
    },

    /// Purge a finished migration's record and local bundle
    Ack {
        /// Migration ID
        id: String,
    },

    /// List stored migrations
    List,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match (cli.command, cli.pod, cli.destination) {
        (Some(Commands::Validate { file }), _, _) => commands::validate::execute(&file),
        (Some(command), _, _) => {
            let config = match context::load_config(&cli.config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            match command {
                Commands::Status { id } => commands::status::execute(&config, &id),
                Commands::Resume { id } => commands::resume::execute(&config, &id).await,
                Commands::Cancel { id } => commands::cancel::execute(&config, &id),
                Commands::Ack { id } => commands::ack::execute(&config, &id),
                Commands::List => commands::list::execute(&config),
                Commands::Validate { file } => commands::validate::execute(&file),
            }
        }
        (None, Some(pod), Some(destination)) => {
            let config = match context::load_config(&cli.config) {
                Ok(config) => config,
                Err(code) => return code,
            };
            commands::run::execute(&config, &pod, &destination).await
        }
        _ => {
            eprintln!("error: expected `<podSelector> <destinationNode>` or a subcommand; see --help");
            ExitCode::from(report::EXIT_INVALID)
        }
    }
}
