// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Wiring from a validated configuration to the state machine.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use podshift_core::{
    BundleCodec, Config, ConfigLoader, CrictlClient, Destination, LocalDirTransport,
    MigrationId, MigrationResult, MigrationStateMachine, MigrationStore, NodeClients,
};

use crate::report;

/// Load the configuration, printing the failure and mapping it to the
/// configuration exit code.
pub fn load_config(path: &Path) -> Result<Config, ExitCode> {
    ConfigLoader::load_file(path).map_err(|e| {
        eprintln!("✗ Configuration error: {}", e);
        ExitCode::from(report::EXIT_CONFIG)
    })
}

pub fn open_store(config: &Config) -> MigrationResult<Arc<MigrationStore>> {
    MigrationStore::open_shared(&config.storage.state_dir)
}

pub fn codec(config: &Config) -> BundleCodec {
    BundleCodec::new(&config.storage.bundle_dir)
}

/// One `crictl` client per node, and a transport into each destination's
/// inbox.
pub fn build_machine(config: &Config) -> MigrationResult<MigrationStateMachine> {
    let runtime = &config.runtime;
    let source = Arc::new(CrictlClient::new(
        &runtime.crictl_path,
        runtime.endpoint.clone(),
        runtime.rpc_timeout,
    ));

    let mut machine = MigrationStateMachine::new(
        config.node.clone(),
        NodeClients::shared(source),
        codec(config),
        open_store(config)?,
        config.transfer_key.clone(),
    );

    for dest in &config.destinations {
        let client = Arc::new(CrictlClient::new(
            &runtime.crictl_path,
            dest.runtime_endpoint.clone(),
            runtime.rpc_timeout,
        ));
        let transport = LocalDirTransport::new(
            dest.name.clone(),
            &dest.inbox_dir,
            &dest.remote_inbox_dir,
            config.transfer_key.clone(),
        );
        tracing::debug!(
            node = %dest.name,
            endpoint = %dest.runtime_endpoint,
            inbox = %dest.inbox_dir.display(),
            "Destination configured"
        );
        machine = machine.with_destination(Destination {
            name: dest.name.clone(),
            clients: NodeClients::shared(client),
            transport: Arc::new(transport),
        });
    }

    Ok(machine)
}

pub fn parse_id(id: &str) -> Result<MigrationId, ExitCode> {
    MigrationId::new(id).map_err(|e| {
        eprintln!("✗ {}", e);
        ExitCode::from(report::EXIT_INVALID)
    })
}
