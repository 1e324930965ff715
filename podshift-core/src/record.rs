// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Durable per-migration state.
//!
//! A [`MigrationRecord`] is the anchor that lets a migration resume after a
//! crash. Every tunable the driver needs is copied into [`MigrationOptions`]
//! when the migration starts, so a resumed attempt behaves exactly like the
//! original one even if the configuration file changed in between.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::retry::RetryPolicy;
use crate::state::MigrationState;
use crate::types::{serde_ms, ContainerId, MigrationId, NodeName, PodRef};

/// Deadline per long-running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDeadlines {
    #[serde(rename = "capturing_ms", with = "serde_ms")]
    pub capturing: Duration,
    #[serde(rename = "transferring_ms", with = "serde_ms")]
    pub transferring: Duration,
    #[serde(rename = "restoring_ms", with = "serde_ms")]
    pub restoring: Duration,
    #[serde(rename = "committing_ms", with = "serde_ms")]
    pub committing: Duration,
    #[serde(rename = "rolling_back_ms", with = "serde_ms")]
    pub rolling_back: Duration,
}

impl StageDeadlines {
    /// Deadline for the work performed while in `state`, if it has one.
    pub fn for_state(&self, state: MigrationState) -> Option<Duration> {
        match state {
            MigrationState::Capturing => Some(self.capturing),
            MigrationState::Transferring => Some(self.transferring),
            MigrationState::Restoring => Some(self.restoring),
            MigrationState::Committing => Some(self.committing),
            MigrationState::RollingBack => Some(self.rolling_back),
            _ => None,
        }
    }
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            capturing: Duration::from_secs(600),
            transferring: Duration::from_secs(1800),
            restoring: Duration::from_secs(600),
            committing: Duration::from_secs(300),
            rolling_back: Duration::from_secs(300),
        }
    }
}

/// Per-migration tuning, frozen into the record at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Concurrent checkpoint/restore calls per stage.
    pub workers: usize,
    /// Bound on every individual runtime call.
    #[serde(rename = "rpc_timeout_ms", with = "serde_ms")]
    pub rpc_timeout: Duration,
    /// Ceiling handed to the runtime for one container checkpoint.
    #[serde(rename = "checkpoint_timeout_ms", with = "serde_ms")]
    pub checkpoint_timeout: Duration,
    /// Grace period for stopping a container at commit or rollback.
    #[serde(rename = "stop_timeout_ms", with = "serde_ms")]
    pub stop_timeout: Duration,
    /// How often to poll a new sandbox until it reports Ready.
    #[serde(rename = "ready_poll_interval_ms", with = "serde_ms")]
    pub ready_poll_interval: Duration,
    pub retry: RetryPolicy,
    pub deadlines: StageDeadlines,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            rpc_timeout: Duration::from_secs(30),
            checkpoint_timeout: Duration::from_secs(300),
            stop_timeout: Duration::from_secs(10),
            ready_poll_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            deadlines: StageDeadlines::default(),
        }
    }
}

/// A container that could not be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFailure {
    pub container_id: ContainerId,
    pub error: String,
}

/// Persistent state of one migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub migration_id: MigrationId,
    pub pod: PodRef,
    /// Selector as the operator typed it.
    pub selector: String,
    pub source_node: NodeName,
    pub destination_node: NodeName,
    pub state: MigrationState,
    /// Number of times a driver has picked this record up.
    pub attempt: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_completed_stage: Option<MigrationState>,
    pub options: MigrationOptions,
    /// New sandbox on the destination, once restore created it.
    #[serde(default)]
    pub restored_pod: Option<PodRef>,
    #[serde(default)]
    pub restore_failures: Vec<ContainerFailure>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(
        migration_id: MigrationId,
        pod: PodRef,
        selector: String,
        source_node: NodeName,
        destination_node: NodeName,
        options: MigrationOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            migration_id,
            pod,
            selector,
            source_node,
            destination_node,
            state: MigrationState::Selected,
            attempt: 1,
            last_error: None,
            last_completed_stage: None,
            options,
            restored_pod: None,
            restore_failures: Vec::new(),
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target`, enforcing the transition table.
    pub fn transition(&mut self, target: MigrationState) -> Result<(), StateTransitionError> {
        if self.state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                migration_id: self.migration_id.clone(),
                state: self.state.name(),
            });
        }
        if !self.state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                migration_id: self.migration_id.clone(),
                from: self.state.name(),
                to: target.name(),
            });
        }

        self.state = target;
        if target.is_stage_boundary() {
            self.last_completed_stage = Some(target);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SandboxId;

    fn record() -> MigrationRecord {
        MigrationRecord::new(
            MigrationId::generate(),
            PodRef {
                sandbox_id: SandboxId::new("p1").unwrap(),
                name: "web".to_string(),
                namespace: "default".to_string(),
                uid: "u1".to_string(),
            },
            "default/web".to_string(),
            NodeName::new("n1").unwrap(),
            NodeName::new("n2").unwrap(),
            MigrationOptions::default(),
        )
    }

    #[test]
    fn test_transition_tracks_completed_stage() {
        let mut rec = record();
        rec.transition(MigrationState::Capturing).unwrap();
        assert_eq!(rec.last_completed_stage, None);
        rec.transition(MigrationState::Captured).unwrap();
        assert_eq!(rec.last_completed_stage, Some(MigrationState::Captured));
        rec.transition(MigrationState::Transferring).unwrap();
        assert_eq!(rec.last_completed_stage, Some(MigrationState::Captured));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut rec = record();
        let err = rec.transition(MigrationState::Committing).unwrap_err();
        assert!(matches!(err, StateTransitionError::InvalidTransition { .. }));
        assert_eq!(rec.state, MigrationState::Selected);
    }

    #[test]
    fn test_terminal_record_is_frozen() {
        let mut rec = record();
        rec.transition(MigrationState::Failed).unwrap();
        let err = rec.transition(MigrationState::Capturing).unwrap_err();
        assert!(matches!(err, StateTransitionError::TerminalState { .. }));
    }

    #[test]
    fn test_options_serialize_as_milliseconds() {
        let json = serde_json::to_value(MigrationOptions::default()).unwrap();
        assert_eq!(json["rpc_timeout_ms"], 30_000);
        assert_eq!(json["retry"]["initial_backoff_ms"], 200);
        assert_eq!(json["deadlines"]["committing_ms"], 300_000);

        let back: MigrationOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, MigrationOptions::default());
    }

    #[test]
    fn test_deadline_lookup() {
        let deadlines = StageDeadlines::default();
        assert_eq!(
            deadlines.for_state(MigrationState::Restoring),
            Some(Duration::from_secs(600))
        );
        assert_eq!(deadlines.for_state(MigrationState::Captured), None);
    }
}
