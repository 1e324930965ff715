// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates the orchestrator configuration before any runtime is touched.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, MigrationError, MigrationResult};
use crate::record::{MigrationOptions, StageDeadlines};
use crate::retry::RetryPolicy;
use crate::transfer::ConfirmationKey;
use crate::types::NodeName;

const MAX_WORKERS: usize = 64;
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_RPC_TIMEOUT_MS: u64 = 600_000;

/// Raw local node section.
#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    name: String,
}

/// Raw runtime client section.
#[derive(Debug, Deserialize)]
struct RawRuntimeConfig {
    #[serde(default = "default_crictl_path")]
    crictl_path: String,
    #[serde(default = "default_endpoint")]
    endpoint: String,
    #[serde(default = "default_rpc_timeout_ms")]
    rpc_timeout_ms: u64,
}

fn default_crictl_path() -> String {
    "crictl".to_string()
}

fn default_endpoint() -> String {
    "unix:///var/run/crio/crio.sock".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

impl Default for RawRuntimeConfig {
    fn default() -> Self {
        Self {
            crictl_path: default_crictl_path(),
            endpoint: default_endpoint(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

/// Raw storage section.
#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    #[serde(default = "default_bundle_dir")]
    bundle_dir: String,
    #[serde(default = "default_state_dir")]
    state_dir: String,
}

fn default_bundle_dir() -> String {
    "/var/lib/podshift/bundles".to_string()
}

fn default_state_dir() -> String {
    "/var/lib/podshift/state".to_string()
}

impl Default for RawStorageConfig {
    fn default() -> Self {
        Self {
            bundle_dir: default_bundle_dir(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRetryConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RawRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDeadlines {
    #[serde(default = "default_capturing_ms")]
    capturing_ms: u64,
    #[serde(default = "default_transferring_ms")]
    transferring_ms: u64,
    #[serde(default = "default_restoring_ms")]
    restoring_ms: u64,
    #[serde(default = "default_committing_ms")]
    committing_ms: u64,
    #[serde(default = "default_rolling_back_ms")]
    rolling_back_ms: u64,
}

fn default_capturing_ms() -> u64 {
    600_000
}

fn default_transferring_ms() -> u64 {
    1_800_000
}

fn default_restoring_ms() -> u64 {
    600_000
}

fn default_committing_ms() -> u64 {
    300_000
}

fn default_rolling_back_ms() -> u64 {
    300_000
}

impl Default for RawDeadlines {
    fn default() -> Self {
        Self {
            capturing_ms: default_capturing_ms(),
            transferring_ms: default_transferring_ms(),
            restoring_ms: default_restoring_ms(),
            committing_ms: default_committing_ms(),
            rolling_back_ms: default_rolling_back_ms(),
        }
    }
}

/// Raw migration tuning section.
#[derive(Debug, Deserialize)]
struct RawMigrationConfig {
    #[serde(default = "default_workers")]
    workers: usize,
    #[serde(default = "default_checkpoint_timeout_ms")]
    checkpoint_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    stop_timeout_ms: u64,
    #[serde(default = "default_ready_poll_interval_ms")]
    ready_poll_interval_ms: u64,
    #[serde(default)]
    retry: RawRetryConfig,
    #[serde(default)]
    deadlines: RawDeadlines,
}

fn default_workers() -> usize {
    4
}

fn default_checkpoint_timeout_ms() -> u64 {
    300_000 // 5 minutes per container
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_ready_poll_interval_ms() -> u64 {
    500
}

impl Default for RawMigrationConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            checkpoint_timeout_ms: default_checkpoint_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            retry: RawRetryConfig::default(),
            deadlines: RawDeadlines::default(),
        }
    }
}

/// Raw transfer section. Exactly one of the two keys must be set.
#[derive(Debug, Default, Deserialize)]
struct RawTransferConfig {
    key_file: Option<String>,
    key_hex: Option<String>,
}

/// Raw destination node entry.
#[derive(Debug, Deserialize)]
struct RawDestinationConfig {
    name: String,
    runtime_endpoint: String,
    inbox_dir: String,
    remote_inbox_dir: Option<String>,
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    node: RawNodeConfig,
    #[serde(default)]
    runtime: RawRuntimeConfig,
    #[serde(default)]
    storage: RawStorageConfig,
    #[serde(default)]
    migration: RawMigrationConfig,
    #[serde(default)]
    transfer: RawTransferConfig,
    #[serde(default)]
    nodes: Vec<RawDestinationConfig>,
}

/// Validated runtime client configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub crictl_path: PathBuf,
    pub endpoint: String,
    pub rpc_timeout: Duration,
}

/// Validated storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bundle_dir: PathBuf,
    pub state_dir: PathBuf,
}

/// Validated destination node.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub name: NodeName,
    pub runtime_endpoint: String,
    /// Inbox as mounted on this node.
    pub inbox_dir: PathBuf,
    /// Same inbox as the destination runtime sees it.
    pub remote_inbox_dir: PathBuf,
}

/// Complete validated configuration.
#[derive(Debug)]
pub struct Config {
    pub node: NodeName,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
    /// Defaults copied into every new migration record.
    pub migration: MigrationOptions,
    pub transfer_key: ConfirmationKey,
    pub destinations: Vec<DestinationConfig>,
}

impl Config {
    pub fn destination(&self, name: &NodeName) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| &d.name == name)
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> MigrationResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MigrationError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::io("reading config file", e))?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> MigrationResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| MigrationError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> MigrationResult<Config> {
        let node = NodeName::new(raw.node.name)?;
        let runtime = Self::validate_runtime(raw.runtime)?;
        let storage = StorageConfig {
            bundle_dir: absolute_path("storage.bundle_dir", &raw.storage.bundle_dir)?,
            state_dir: absolute_path("storage.state_dir", &raw.storage.state_dir)?,
        };
        let migration = Self::validate_migration(raw.migration, runtime.rpc_timeout)?;
        let transfer_key = Self::load_key(raw.transfer)?;

        let mut destinations = Vec::with_capacity(raw.nodes.len());
        let mut seen = HashSet::new();
        for raw_dest in raw.nodes {
            let dest = Self::validate_destination(raw_dest)?;

            if dest.name == node {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "nodes.name",
                    value: dest.name.to_string(),
                    reason: "The local node cannot be a destination".to_string(),
                }
                .into());
            }

            // Check for duplicate names
            if !seen.insert(dest.name.clone()) {
                return Err(HardValidationError::DuplicateNode {
                    name: dest.name.to_string(),
                }
                .into());
            }

            destinations.push(dest);
        }

        Ok(Config {
            node,
            runtime,
            storage,
            migration,
            transfer_key,
            destinations,
        })
    }

    fn validate_runtime(raw: RawRuntimeConfig) -> MigrationResult<RuntimeConfig> {
        if raw.endpoint.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "runtime.endpoint",
                context: "runtime".to_string(),
            }
            .into());
        }
        if raw.crictl_path.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "runtime.crictl_path",
                context: "runtime".to_string(),
            }
            .into());
        }

        Ok(RuntimeConfig {
            crictl_path: PathBuf::from(raw.crictl_path),
            endpoint: raw.endpoint,
            rpc_timeout: positive_ms("runtime.rpc_timeout_ms", raw.rpc_timeout_ms, MAX_RPC_TIMEOUT_MS)?,
        })
    }

    fn validate_migration(
        raw: RawMigrationConfig,
        rpc_timeout: Duration,
    ) -> MigrationResult<MigrationOptions> {
        if raw.workers == 0 || raw.workers > MAX_WORKERS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "migration.workers",
                value: raw.workers.to_string(),
                reason: format!("Must be between 1 and {}", MAX_WORKERS),
            }
            .into());
        }

        let retry = &raw.retry;
        if retry.max_attempts == 0 || retry.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "migration.retry.max_attempts",
                value: retry.max_attempts.to_string(),
                reason: format!("Must be between 1 and {}", MAX_RETRY_ATTEMPTS),
            }
            .into());
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(HardValidationError::InvalidFieldValue {
                field: "migration.retry.initial_backoff_ms",
                value: retry.initial_backoff_ms.to_string(),
                reason: "Initial backoff cannot exceed max_backoff_ms".to_string(),
            }
            .into());
        }

        let d = &raw.deadlines;
        let deadlines = StageDeadlines {
            capturing: positive_ms("migration.deadlines.capturing_ms", d.capturing_ms, u64::MAX)?,
            transferring: positive_ms(
                "migration.deadlines.transferring_ms",
                d.transferring_ms,
                u64::MAX,
            )?,
            restoring: positive_ms("migration.deadlines.restoring_ms", d.restoring_ms, u64::MAX)?,
            committing: positive_ms("migration.deadlines.committing_ms", d.committing_ms, u64::MAX)?,
            rolling_back: positive_ms(
                "migration.deadlines.rolling_back_ms",
                d.rolling_back_ms,
                u64::MAX,
            )?,
        };

        // A single checkpoint must fit in the capture deadline
        let checkpoint_timeout = positive_ms(
            "migration.checkpoint_timeout_ms",
            raw.checkpoint_timeout_ms,
            d.capturing_ms,
        )?;

        Ok(MigrationOptions {
            workers: raw.workers,
            rpc_timeout,
            checkpoint_timeout,
            stop_timeout: positive_ms("migration.stop_timeout_ms", raw.stop_timeout_ms, u64::MAX)?,
            ready_poll_interval: positive_ms(
                "migration.ready_poll_interval_ms",
                raw.ready_poll_interval_ms,
                rpc_timeout.as_millis() as u64,
            )?,
            retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(retry.max_backoff_ms),
            },
            deadlines,
        })
    }

    fn load_key(raw: RawTransferConfig) -> MigrationResult<ConfirmationKey> {
        match (raw.key_file, raw.key_hex) {
            (Some(path), None) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    HardValidationError::InvalidFieldValue {
                        field: "transfer.key_file",
                        value: path.clone(),
                        reason: format!("Cannot read key file: {}", e),
                    }
                })?;
                Ok(ConfirmationKey::from_hex(&content)?)
            }
            (None, Some(hex_key)) => Ok(ConfirmationKey::from_hex(&hex_key)?),
            (Some(_), Some(_)) => Err(HardValidationError::SchemaValidation {
                message: "Set only one of transfer.key_file and transfer.key_hex".to_string(),
            }
            .into()),
            (None, None) => Err(HardValidationError::MissingRequiredField {
                field: "transfer.key_file",
                context: "transfer".to_string(),
            }
            .into()),
        }
    }

    fn validate_destination(raw: RawDestinationConfig) -> MigrationResult<DestinationConfig> {
        let name = NodeName::new(raw.name)?;
        if raw.runtime_endpoint.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "runtime_endpoint",
                context: format!("node {}", name),
            }
            .into());
        }

        let inbox_dir = absolute_path("nodes.inbox_dir", &raw.inbox_dir)?;
        let remote_inbox_dir = match raw.remote_inbox_dir {
            Some(dir) => absolute_path("nodes.remote_inbox_dir", &dir)?,
            None => inbox_dir.clone(),
        };

        Ok(DestinationConfig {
            name,
            runtime_endpoint: raw.runtime_endpoint,
            inbox_dir,
            remote_inbox_dir,
        })
    }
}

fn positive_ms(field: &'static str, value: u64, max: u64) -> Result<Duration, HardValidationError> {
    if value == 0 {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: "0".to_string(),
            reason: "Must be greater than 0".to_string(),
        });
    }
    if value > max {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: format!("Must not exceed {}ms", max),
        });
    }
    Ok(Duration::from_millis(value))
}

fn absolute_path(field: &'static str, value: &str) -> Result<PathBuf, HardValidationError> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "Path must be absolute".to_string(),
        });
    }
    Ok(path)
}
