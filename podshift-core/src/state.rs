// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Migration states with typed transitions.
//!
//! Implements the migration lifecycle:
//! Selected → Capturing → Captured → Transferring → Transferred → Restoring →
//! Restored → Committing → Completed, with Failed reachable from any
//! non-terminal state and RollingBack → RolledBack from the pre-commit stages.
//! Invalid transitions result in StateTransitionError.

use serde::{Deserialize, Serialize};

/// Migration lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    /// Pod chosen and record persisted; nothing captured yet.
    Selected,
    /// Checkpointing containers on the source.
    Capturing,
    /// Bundle published on the source.
    Captured,
    /// Moving the bundle to the destination.
    Transferring,
    /// Destination confirmed every file checksum.
    Transferred,
    /// Recreating sandbox and containers on the destination.
    Restoring,
    /// Destination reports every container running.
    Restored,
    /// Tearing down the source pod. Past the point of safe reversal.
    Committing,
    /// Source removed, destination serving.
    Completed,
    /// Discarding destination state; source untouched.
    RollingBack,
    /// Rollback finished; source still serving.
    RolledBack,
    /// Attempt aborted.
    Failed,
}

impl MigrationState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Selected => "Selected",
            Self::Capturing => "Capturing",
            Self::Captured => "Captured",
            Self::Transferring => "Transferring",
            Self::Transferred => "Transferred",
            Self::Restoring => "Restoring",
            Self::Restored => "Restored",
            Self::Committing => "Committing",
            Self::Completed => "Completed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::Failed => "Failed",
        }
    }

    /// Terminal states are retained until the operator acknowledges them.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Operator cancellation is honoured only while work is still pre-commit
    /// and purely additive.
    pub const fn is_cancellable(&self) -> bool {
        matches!(self, Self::Capturing | Self::Transferring)
    }

    /// Reaching this state marks the named stage as completed.
    pub const fn is_stage_boundary(&self) -> bool {
        matches!(
            self,
            Self::Captured | Self::Transferred | Self::Restored | Self::Completed | Self::RolledBack
        )
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: MigrationState) -> bool {
        if self.is_terminal() {
            return false;
        }

        if target == Self::Failed {
            return true;
        }

        matches!(
            (self, target),
            // Forward path
            (Self::Selected, Self::Capturing) |
            (Self::Capturing, Self::Captured) |
            (Self::Captured, Self::Transferring) |
            (Self::Transferring, Self::Transferred) |
            (Self::Transferred, Self::Restoring) |
            (Self::Restoring, Self::Restored) |
            (Self::Restored, Self::Committing) |
            (Self::Committing, Self::Completed) |
            // Rollback: cancellation, deadlines and restore failures
            (Self::Capturing, Self::RollingBack) |
            (Self::Captured, Self::RollingBack) |
            (Self::Transferring, Self::RollingBack) |
            (Self::Transferred, Self::RollingBack) |
            (Self::Restoring, Self::RollingBack) |
            (Self::Restored, Self::RollingBack) |
            (Self::RollingBack, Self::RolledBack)
        )
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
