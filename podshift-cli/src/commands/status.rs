// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `migrate status` command - Show a stored migration.

use std::process::ExitCode;

use podshift_core::Config;

use crate::{context, report};

pub fn execute(config: &Config, id: &str) -> ExitCode {
    let id = match context::parse_id(id) {
        Ok(id) => id,
        Err(code) => return code,
    };

    match context::open_store(config).and_then(|store| store.load(&id)) {
        Ok(record) => report::finish(&record),
        Err(e) => report::error(&e),
    }
}
