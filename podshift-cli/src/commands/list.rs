// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate list` command - List stored migrations, oldest first.

use std::process::ExitCode;

use podshift_core::Config;

use crate::{context, report};

pub fn execute(config: &Config) -> ExitCode {
    let scan = match context::open_store(config).and_then(|store| store.scan()) {
        Ok(scan) => scan,
        Err(e) => return report::error(&e),
    };
    let records = &scan.records;

    for (path, reason) in &scan.corrupt {
        eprintln!("✗ Corrupt record {}: {}", path.display(), reason);
        eprintln!("  Inspect it, then remove the file to forget that migration");
    }

    if records.is_empty() {
        println!("No migrations recorded.");
        return ExitCode::SUCCESS;
    }

    println!("╔══════════╦══════════════════════════╦════════════╦══════════════╦═════════════════════╗");
    println!("║ ID       ║ Pod                      ║ Target     ║ State        ║ Updated             ║");
    println!("╠══════════╬══════════════════════════╬════════════╬══════════════╬═════════════════════╣");

    for record in records {
        println!(
            "║ {:<8} ║ {:<24} ║ {:<10} ║ {:<12} ║ {:<19} ║",
            record.migration_id.short(),
            truncate(&record.pod.qualified_name(), 24),
            truncate(record.destination_node.as_str(), 10),
            record.state.name(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("╚══════════╩══════════════════════════╩════════════╩══════════════╩═════════════════════╝");
    println!();
    println!("Total: {} migration(s)", records.len());

    ExitCode::SUCCESS
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let kept: String = value.chars().take(width - 1).collect();
        format!("{}…", kept)
    }
}
