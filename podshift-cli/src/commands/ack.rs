// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate ack` command - Purge a terminal migration.

use std::process::ExitCode;

use podshift_core::Config;

use crate::{context, report};

pub fn execute(config: &Config, id: &str) -> ExitCode {
    let id = match context::parse_id(id) {
        Ok(id) => id,
        Err(code) => return code,
    };
    let codec = context::codec(config);

    match context::open_store(config).and_then(|store| store.acknowledge(&id, &codec)) {
        Ok(record) => {
            println!("✓ Acknowledged {} ({})", id, record.state);
            ExitCode::SUCCESS
        }
        Err(e) => report::error(&e),
    }
}
