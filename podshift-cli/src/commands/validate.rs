// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate validate` command - Validate configuration file.

use std::path::Path;
use std::process::ExitCode;

use podshift_core::ConfigLoader;

use crate::report;

pub fn execute(file: &Path) -> ExitCode {
    tracing::info!(file = %file.display(), "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            let migration = &config.migration;
            println!("✓ Configuration is valid");
            println!();
            println!("Node:                 {}", config.node);
            println!("Runtime endpoint:     {}", config.runtime.endpoint);
            println!("RPC timeout:          {}ms", config.runtime.rpc_timeout.as_millis());
            println!("Bundle directory:     {}", config.storage.bundle_dir.display());
            println!("State directory:      {}", config.storage.state_dir.display());
            println!("Workers:              {}", migration.workers);
            println!(
                "Checkpoint timeout:   {}ms",
                migration.checkpoint_timeout.as_millis()
            );
            println!(
                "Retry:                {} attempts, {}ms..{}ms backoff",
                migration.retry.max_attempts,
                migration.retry.initial_backoff.as_millis(),
                migration.retry.max_backoff.as_millis()
            );
            println!();
            println!("Destinations ({}):", config.destinations.len());
            for dest in &config.destinations {
                println!(
                    "  - {} (endpoint: {}, inbox: {})",
                    dest.name,
                    dest.runtime_endpoint,
                    dest.inbox_dir.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            ExitCode::from(report::EXIT_CONFIG)
        }
    }
}
