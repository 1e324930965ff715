// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate <podSelector> <destinationNode>` - Run a migration to completion.

use std::process::ExitCode;
use std::sync::Arc;

use podshift_core::{MigrationError, MigrationStore, NodeName, PodSelector};

use crate::{context, report};

pub async fn execute(config: &podshift_core::Config, pod: &str, destination: &str) -> ExitCode {
    let selector = match PodSelector::parse(pod) {
        Ok(selector) => selector,
        Err(e) => return report::error(&MigrationError::from(e)),
    };
    let destination = match NodeName::new(destination) {
        Ok(node) => node,
        Err(e) => return report::error(&MigrationError::from(e)),
    };
    let machine = match context::build_machine(config) {
        Ok(machine) => machine,
        Err(e) => return report::error(&e),
    };

    // Selection and validation failures surface here, before any record.
    let record = match machine.start(&selector, &destination, config.migration).await {
        Ok(record) => record,
        Err(e) => return report::error(&e),
    };
    println!(
        "▶ Migrating {} from {} to {} (migration {})",
        record.pod, record.source_node, record.destination_node, record.migration_id
    );

    let store = match context::open_store(config) {
        Ok(store) => store,
        Err(e) => return report::error(&e),
    };
    let interrupt = tokio::spawn(cancel_on_interrupt(store, record.migration_id.clone()));

    let id = record.migration_id.clone();
    let outcome = machine.drive(record).await;
    interrupt.abort();

    match outcome {
        Ok(record) => report::finish(&record),
        Err(e) => {
            // The record could not be persisted; it stays resumable.
            eprintln!("✗ Migration {} interrupted: {}", id, e);
            eprintln!("  Resume with: migrate resume {}", id);
            ExitCode::from(report::EXIT_IN_FLIGHT)
        }
    }
}

/// Ctrl-C asks for cancellation instead of killing the driver mid-stage.
async fn cancel_on_interrupt(store: Arc<MigrationStore>, id: podshift_core::MigrationId) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        match store.request_cancel(&id) {
            Ok(_) => eprintln!("▶ Cancellation requested; rolling back"),
            Err(e) => eprintln!("✗ {}", e),
        }
    }
}
