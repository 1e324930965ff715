// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Terminal reports and exit codes.

use std::process::ExitCode;

use podshift_core::{MigrationError, MigrationRecord, MigrationState};

pub const EXIT_COMPLETED: u8 = 0;
pub const EXIT_CONFIG: u8 = 1;
pub const EXIT_INVALID: u8 = 2;
pub const EXIT_ROLLED_BACK: u8 = 3;
pub const EXIT_FAILED: u8 = 4;
/// Record is stored but has not reached a terminal state.
pub const EXIT_IN_FLIGHT: u8 = 5;

pub fn exit_code(state: MigrationState) -> u8 {
    match state {
        MigrationState::Completed => EXIT_COMPLETED,
        MigrationState::RolledBack => EXIT_ROLLED_BACK,
        MigrationState::Failed => EXIT_FAILED,
        _ => EXIT_IN_FLIGHT,
    }
}

/// Print an error raised before or outside a migration's own state
/// handling and map it to an exit code.
pub fn error(err: &MigrationError) -> ExitCode {
    eprintln!("✗ {}", err);
    match err {
        MigrationError::ConfigNotFound { .. } | MigrationError::ConfigParse { .. } => {
            ExitCode::from(EXIT_CONFIG)
        }
        MigrationError::Io { .. } | MigrationError::CorruptRecord { .. } => {
            ExitCode::from(EXIT_FAILED)
        }
        _ => ExitCode::from(EXIT_INVALID),
    }
}

pub fn print_record(record: &MigrationRecord) {
    let symbol = match record.state {
        MigrationState::Completed => "✓",
        MigrationState::RolledBack | MigrationState::Failed => "✗",
        _ => "▶",
    };

    println!("{} Migration {}", symbol, record.migration_id);
    println!("  Pod:                  {}", record.pod);
    println!(
        "  Route:                {} → {}",
        record.source_node, record.destination_node
    );
    println!("  State:                {}", record.state);
    println!(
        "  Last completed stage: {}",
        record
            .last_completed_stage
            .map(|s| s.name())
            .unwrap_or("none")
    );
    println!("  Attempt:              {}", record.attempt);
    if record.cancel_requested {
        println!("  Cancel requested:     yes");
    }
    if let Some(pod) = &record.restored_pod {
        println!("  Destination pod:      {}", pod);
    }
    if let Some(error) = &record.last_error {
        println!("  Error:                {}", error);
    }
    if !record.restore_failures.is_empty() {
        println!("  Containers not restored:");
        for failure in &record.restore_failures {
            println!("    - {}: {}", failure.container_id, failure.error);
        }
    }
}

/// Print a terminal report and exit with the code of its state.
pub fn finish(record: &MigrationRecord) -> ExitCode {
    print_record(record);
    ExitCode::from(exit_code(record.state))
}
