// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod ack;
pub mod cancel;
pub mod list;
pub mod resume;
pub mod run;
pub mod status;
pub mod validate;
