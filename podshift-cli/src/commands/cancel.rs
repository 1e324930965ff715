// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate cancel` command - Flag a running migration for rollback.
//!
//! The driver observes the flag while capturing or transferring and rolls
//! back; this command returns as soon as the flag is stored.

use std::process::ExitCode;

use podshift_core::Config;

use crate::{context, report};

pub fn execute(config: &Config, id: &str) -> ExitCode {
    let id = match context::parse_id(id) {
        Ok(id) => id,
        Err(code) => return code,
    };

    match context::open_store(config).and_then(|store| store.request_cancel(&id)) {
        Ok(record) => {
            println!("✓ Cancellation requested for {} (state {})", id, record.state);
            ExitCode::SUCCESS
        }
        Err(e) => report::error(&e),
    }
}
