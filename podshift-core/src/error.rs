//! Custom error types for podshift.
//!
//! This module defines explicit enum error types as per coding guidelines.
//! No `Box<dyn Error>`, no `anyhow::Result` - all errors are strongly typed so
//! the state machine can tell retryable failures from fatal ones.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ContainerId, MigrationId};

/// Top-level error type for the migration orchestrator.
/// All errors are explicit variants - no catch-all or generic handling.
#[derive(Debug, Error)]
pub enum MigrationError {
    // =========================================================================
    // Selection Errors - User-Correctable
    // =========================================================================
    #[error("No Ready pod sandbox matches selector '{selector}'")]
    NotFound { selector: String },

    #[error("Selector '{selector}' is ambiguous: matches {} pod sandboxes ({})", candidates.len(), candidates.join(", "))]
    Ambiguous {
        selector: String,
        candidates: Vec<String>,
    },

    // =========================================================================
    // Data Errors - May Allow Partial Success
    // =========================================================================
    #[error("Pod {pod} has no containers to migrate")]
    EmptyPod { pod: String },

    #[error("Cannot resolve image for container {container_id}: snapshot has neither image nor image ID")]
    UnresolvableImage { container_id: ContainerId },

    #[error("Partial restore of pod {pod}: {failed} of {total} containers failed")]
    PartialRestore {
        pod: String,
        failed: usize,
        total: usize,
    },

    // =========================================================================
    // Timeouts - Retried per RPC, Fatal per Stage
    // =========================================================================
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Stage {stage} exceeded its deadline of {deadline_ms}ms")]
    DeadlineExceeded {
        stage: &'static str,
        deadline_ms: u64,
    },

    // =========================================================================
    // Integrity Errors - Always Fatal to the Attempt
    // =========================================================================
    #[error("Corrupt bundle at {path}: {reason}")]
    CorruptBundle { path: PathBuf, reason: String },

    #[error("Unsupported bundle format version {found} (this build reads up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Transfer to node {node} incomplete: {reason}")]
    TransferIncomplete { node: String, reason: String },

    // =========================================================================
    // Runtime Errors - Propagated Verbatim
    // =========================================================================
    #[error("Runtime RPC {operation} failed [{code}]: {message}")]
    RuntimeRpc {
        operation: &'static str,
        code: RpcCode,
        message: String,
    },

    #[error("Transport to node {node} failed: {reason}")]
    Transport { node: String, reason: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("Pod {pod} already has migration {migration_id} in flight")]
    MigrationInProgress {
        pod: String,
        migration_id: MigrationId,
    },

    #[error("Migration record not found: {0}")]
    RecordNotFound(MigrationId),

    #[error("Corrupt migration record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("Migration {migration_id} cannot be cancelled in state {state}")]
    CancelRefused {
        migration_id: MigrationId,
        state: &'static str,
    },

    #[error("Migration {migration_id} is still {state}; only terminal migrations can be acknowledged")]
    NotTerminal {
        migration_id: MigrationId,
        state: &'static str,
    },

    #[error("Migration {migration_id} was cancelled by the operator")]
    Cancelled { migration_id: MigrationId },

    #[error("Unknown destination node: {0}")]
    UnknownNode(String),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker task in {stage} did not complete: {reason}")]
    WorkerJoin { stage: &'static str, reason: String },
}

impl MigrationError {
    /// Build an `Io` error with a static context string.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Transient failures that a stage may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => true,
            Self::RuntimeRpc { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Integrity failures abort the attempt immediately and are never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::CorruptBundle { .. }
                | Self::UnsupportedVersion { .. }
                | Self::TransferIncomplete { .. }
        )
    }

    /// The runtime reported that the object no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RuntimeRpc {
                code: RpcCode::NotFound,
                ..
            }
        )
    }
}

/// Status code attached to a failed runtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCode {
    NotFound,
    AlreadyExists,
    Unavailable,
    DeadlineExceeded,
    InvalidArgument,
    Unknown,
}

impl RpcCode {
    /// Codes worth retrying inside a stage.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable | Self::DeadlineExceeded)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Unavailable => "Unavailable",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::InvalidArgument => "InvalidArgument",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hard validation errors reject input before any runtime is touched.
/// Used for invalid configuration, identifiers and status snapshots.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Duplicate node name: {name}")]
    DuplicateNode { name: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// State transition errors for the migration state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for migration {migration_id}")]
    InvalidTransition {
        migration_id: MigrationId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Migration {migration_id} is in terminal state: {state}")]
    TerminalState {
        migration_id: MigrationId,
        state: &'static str,
    },
}

/// Result type alias using MigrationError.
pub type MigrationResult<T> = Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "uid",
            context: "pod sandbox 'web-0'".to_string(),
        };
        assert!(err.to_string().contains("uid"));
        assert!(err.to_string().contains("web-0"));
    }

    #[test]
    fn test_error_chain() {
        let validation_err = HardValidationError::InvalidFieldValue {
            field: "workers",
            value: "0".to_string(),
            reason: "Must be at least 1".to_string(),
        };
        let err: MigrationError = validation_err.into();
        assert!(matches!(err, MigrationError::HardValidation(_)));
    }

    #[test]
    fn test_retry_classification() {
        let timeout = MigrationError::Timeout {
            operation: "CheckpointContainer".to_string(),
            timeout_ms: 1000,
        };
        assert!(timeout.is_retryable());

        let unavailable = MigrationError::RuntimeRpc {
            operation: "ListPodSandbox",
            code: RpcCode::Unavailable,
            message: "connection refused".to_string(),
        };
        assert!(unavailable.is_retryable());

        let missing = MigrationError::RuntimeRpc {
            operation: "RemoveContainer",
            code: RpcCode::NotFound,
            message: "no such container".to_string(),
        };
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_integrity_errors_are_not_retryable() {
        let corrupt = MigrationError::CorruptBundle {
            path: PathBuf::from("/var/lib/podshift/bundles/x"),
            reason: "checksum mismatch".to_string(),
        };
        assert!(corrupt.is_integrity());
        assert!(!corrupt.is_retryable());

        let incomplete = MigrationError::TransferIncomplete {
            node: "n2".to_string(),
            reason: "c2.tar differs".to_string(),
        };
        assert!(incomplete.is_integrity());
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = MigrationError::Ambiguous {
            selector: "web".to_string(),
            candidates: vec!["default/web".to_string(), "prod/web".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("matches 2"));
        assert!(msg.contains("prod/web"));
    }
}
