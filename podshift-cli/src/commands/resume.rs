// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate resume` command - Continue from the last persisted state.

use std::process::ExitCode;

use podshift_core::Config;

use crate::{context, report};

pub async fn execute(config: &Config, id: &str) -> ExitCode {
    let id = match context::parse_id(id) {
        Ok(id) => id,
        Err(code) => return code,
    };
    let machine = match context::build_machine(config) {
        Ok(machine) => machine,
        Err(e) => return report::error(&e),
    };

    tracing::info!(migration_id = %id, "Resuming");
    match machine.resume(&id).await {
        Ok(record) => report::finish(&record),
        Err(e) => report::error(&e),
    }
}
