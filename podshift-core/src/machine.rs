// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Migration state machine driver.
//!
//! Drives one [`MigrationRecord`] through capture, transfer, restore and
//! commit. Each call to [`MigrationStateMachine::step`] performs the work of
//! the current state and persists the resulting transition, so a driver that
//! dies between steps is resumed by replaying from the stored state.
//!
//! The source pod is stopped and removed only in `Committing`, which is
//! reachable only from a persisted `Restored`. Every failure before that
//! point leaves the source running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bundle::{BundleCodec, CheckpointBundle};
use crate::capture::{self, CaptureEngine};
use crate::error::{HardValidationError, MigrationError, MigrationResult, StateTransitionError};
use crate::record::{MigrationOptions, MigrationRecord};
use crate::restore::{self, RestoreEngine};
use crate::retry::RetryPolicy;
use crate::runtime::NodeClients;
use crate::state::MigrationState;
use crate::store::MigrationStore;
use crate::transfer::{ConfirmationKey, TransferCoordinator, TransferLimits, Transport};
use crate::types::{MigrationId, NodeName, PodSelector};

/// How often an in-flight cancellable stage checks for operator cancellation.
const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(500);

/// A node migrations can target.
#[derive(Clone)]
pub struct Destination {
    pub name: NodeName,
    pub clients: NodeClients,
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Owns every commit/rollback decision for migrations out of one source
/// node.
pub struct MigrationStateMachine {
    source_node: NodeName,
    source: NodeClients,
    capture: CaptureEngine,
    coordinator: TransferCoordinator,
    destinations: HashMap<NodeName, Destination>,
    store: Arc<MigrationStore>,
    cancel_poll: Duration,
}

impl MigrationStateMachine {
    pub fn new(
        source_node: NodeName,
        source: NodeClients,
        codec: BundleCodec,
        store: Arc<MigrationStore>,
        key: ConfirmationKey,
    ) -> Self {
        let capture = CaptureEngine::new(source.runtime.clone(), codec, source_node.clone());
        Self {
            source_node,
            source,
            capture,
            coordinator: TransferCoordinator::new(key),
            destinations: HashMap::new(),
            store,
            cancel_poll: DEFAULT_CANCEL_POLL,
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destinations.insert(destination.name.clone(), destination);
        self
    }

    pub fn with_cancel_poll(mut self, interval: Duration) -> Self {
        self.cancel_poll = interval;
        self
    }

    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    pub fn codec(&self) -> &BundleCodec {
        self.capture.codec()
    }

    fn destination(&self, name: &NodeName) -> MigrationResult<&Destination> {
        self.destinations
            .get(name)
            .ok_or_else(|| MigrationError::UnknownNode(name.to_string()))
    }

    /// Select the pod and persist a new record in `Selected`.
    ///
    /// Selection and validation errors surface here, before any record
    /// exists.
    pub async fn start(
        &self,
        selector: &PodSelector,
        destination: &NodeName,
        options: MigrationOptions,
    ) -> MigrationResult<MigrationRecord> {
        if destination == &self.source_node {
            return Err(HardValidationError::InvalidFieldValue {
                field: "destination_node",
                value: destination.to_string(),
                reason: "Destination must differ from the source node".to_string(),
            }
            .into());
        }
        self.destination(destination)?;

        let pod = capture::select_pod(
            self.source.runtime.as_ref(),
            selector,
            options.rpc_timeout,
            &options.retry,
        )
        .await?;

        let record = MigrationRecord::new(
            MigrationId::generate(),
            pod,
            selector.to_string(),
            self.source_node.clone(),
            destination.clone(),
            options,
        );
        self.store.create(&record)?;
        Ok(record)
    }

    /// Start a migration and drive it to a terminal state.
    pub async fn migrate(
        &self,
        selector: &PodSelector,
        destination: &NodeName,
        options: MigrationOptions,
    ) -> MigrationResult<MigrationRecord> {
        let record = self.start(selector, destination, options).await?;
        self.drive(record).await
    }

    /// Continue a stored migration from its persisted state.
    pub async fn resume(&self, id: &MigrationId) -> MigrationResult<MigrationRecord> {
        let mut record = self.store.load(id)?;
        if record.is_terminal() {
            tracing::info!(migration_id = %id, state = %record.state, "Migration already terminal");
            return Ok(record);
        }

        record.attempt += 1;
        self.store.save(&mut record)?;
        tracing::info!(
            migration_id = %id,
            state = %record.state,
            attempt = record.attempt,
            "Resuming migration"
        );
        self.drive(record).await
    }

    /// Step until terminal.
    pub async fn drive(&self, mut record: MigrationRecord) -> MigrationResult<MigrationRecord> {
        let started = Instant::now();
        while !record.is_terminal() {
            self.step(&mut record).await?;
        }

        tracing::info!(
            migration_id = %record.migration_id,
            state = %record.state,
            last_completed_stage = record.last_completed_stage.map(|s| s.name()).unwrap_or("none"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Migration finished"
        );
        Ok(record)
    }

    /// Perform the work of the current state and persist the transition.
    ///
    /// Stage failures are routed to `Failed` or `RollingBack` and persisted;
    /// only a failure to persist is returned as an error.
    pub async fn step(&self, record: &mut MigrationRecord) -> MigrationResult<()> {
        let state = record.state;
        let result = match state {
            MigrationState::Selected => Ok(MigrationState::Capturing),
            MigrationState::Capturing => self.do_capture(record).await,
            MigrationState::Captured => Ok(MigrationState::Transferring),
            MigrationState::Transferring => self.do_transfer(record).await,
            MigrationState::Transferred => Ok(MigrationState::Restoring),
            MigrationState::Restoring => self.do_restore(record).await,
            MigrationState::Restored => Ok(MigrationState::Committing),
            MigrationState::Committing => self.do_commit(record).await,
            MigrationState::RollingBack => self.do_rollback(record).await,
            MigrationState::Completed | MigrationState::RolledBack | MigrationState::Failed => {
                return Err(StateTransitionError::TerminalState {
                    migration_id: record.migration_id.clone(),
                    state: state.name(),
                }
                .into())
            }
        };

        match result {
            Ok(next) => self.advance(record, next),
            Err(e) => self.route_failure(record, e).await,
        }
    }

    fn advance(&self, record: &mut MigrationRecord, next: MigrationState) -> MigrationResult<()> {
        let from = record.state;
        record.transition(next)?;
        self.store.save(record)?;
        tracing::info!(
            migration_id = %record.migration_id,
            from = %from,
            state = %next,
            "State transition"
        );
        Ok(())
    }

    /// Decide where a failed stage leads. The source has not been touched
    /// before `Committing`, so everything earlier either fails cleanly or
    /// rolls the destination back.
    async fn route_failure(
        &self,
        record: &mut MigrationRecord,
        error: MigrationError,
    ) -> MigrationResult<()> {
        let state = record.state;
        let interrupted = matches!(
            error,
            MigrationError::Cancelled { .. } | MigrationError::DeadlineExceeded { .. }
        );
        let next = match state {
            MigrationState::Capturing if interrupted => MigrationState::RollingBack,
            MigrationState::Transferring if error.is_integrity() => MigrationState::Failed,
            MigrationState::Transferring
            | MigrationState::Restoring
            | MigrationState::Captured
            | MigrationState::Transferred
            | MigrationState::Restored => MigrationState::RollingBack,
            _ => MigrationState::Failed,
        };

        tracing::error!(
            migration_id = %record.migration_id,
            state = %state,
            next = %next,
            error = %error,
            "Stage failed"
        );
        record.last_error = Some(error.to_string());

        if next == MigrationState::Failed && state == MigrationState::Transferring {
            // Integrity failure: drop whatever reached the destination.
            if let Ok(destination) = self.destination(&record.destination_node) {
                if let Err(e) = destination.transport.discard(&record.migration_id).await {
                    tracing::warn!(migration_id = %record.migration_id, error = %e, "Discard after failed transfer");
                }
            }
        }

        self.advance(record, next)
    }

    /// Bound `work` by the deadline of the current state and, in cancellable
    /// states, race it against operator cancellation.
    async fn guarded<T>(
        &self,
        record: &MigrationRecord,
        work: impl Future<Output = MigrationResult<T>>,
    ) -> MigrationResult<T> {
        let state = record.state;
        let deadline = record.options.deadlines.for_state(state);
        let bounded = async {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrationError::DeadlineExceeded {
                        stage: state.name(),
                        deadline_ms: limit.as_millis() as u64,
                    }),
                },
                None => work.await,
            }
        };

        if !state.is_cancellable() {
            return bounded.await;
        }
        if record.cancel_requested {
            return Err(MigrationError::Cancelled {
                migration_id: record.migration_id.clone(),
            });
        }

        tokio::select! {
            result = bounded => result,
            _ = self.wait_for_cancel(&record.migration_id) => Err(MigrationError::Cancelled {
                migration_id: record.migration_id.clone(),
            }),
        }
    }

    async fn wait_for_cancel(&self, id: &MigrationId) {
        let mut ticker = tokio::time::interval(self.cancel_poll);
        loop {
            ticker.tick().await;
            match self.store.is_cancel_requested(id) {
                Ok(true) => {
                    tracing::warn!(migration_id = %id, "Cancellation observed");
                    return;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(migration_id = %id, error = %e, "Cannot read cancel flag"),
            }
        }
    }

    async fn do_capture(&self, record: &MigrationRecord) -> MigrationResult<MigrationState> {
        self.guarded(
            record,
            self.capture
                .capture(&record.migration_id, &record.pod, &record.options),
        )
        .await?;
        Ok(MigrationState::Captured)
    }

    async fn published_bundle(&self, id: &MigrationId) -> MigrationResult<CheckpointBundle> {
        let path = self.codec().bundle_dir(id);
        tokio::task::spawn_blocking(move || BundleCodec::decode(&path))
            .await
            .map_err(|e| MigrationError::WorkerJoin {
                stage: "LoadBundle",
                reason: e.to_string(),
            })?
    }

    async fn do_transfer(&self, record: &MigrationRecord) -> MigrationResult<MigrationState> {
        let destination = self.destination(&record.destination_node)?;
        let options = &record.options;
        let limits = TransferLimits {
            rpc_timeout: options.rpc_timeout,
            bulk_timeout: options.deadlines.transferring,
            retry: options.retry,
        };

        let work = async {
            let bundle = self.published_bundle(&record.migration_id).await?;
            let dir = self.codec().bundle_dir(&record.migration_id);
            self.coordinator
                .transfer(&bundle, &dir, destination.transport.as_ref(), &limits)
                .await
        };
        self.guarded(record, work).await?;
        Ok(MigrationState::Transferred)
    }

    async fn do_restore(&self, record: &mut MigrationRecord) -> MigrationResult<MigrationState> {
        let destination = self.destination(&record.destination_node)?.clone();
        let engine = RestoreEngine::new(destination.clients.clone());

        let bundle = self
            .published_bundle(&record.migration_id)
            .await?
            .relocated(&destination.transport.remote_bundle_dir(&record.migration_id));

        let report = self
            .guarded(record, engine.restore(&bundle, &record.options))
            .await?;

        record.restored_pod = Some(report.pod.clone());
        record.restore_failures = report.failures.clone();

        if !report.is_complete() {
            return Err(MigrationError::PartialRestore {
                pod: report.pod.qualified_name(),
                failed: report.failures.len(),
                total: report.total(),
            });
        }
        Ok(MigrationState::Restored)
    }

    async fn do_commit(&self, record: &MigrationRecord) -> MigrationResult<MigrationState> {
        let options = &record.options;
        let runtime = self.source.runtime.as_ref();
        let sandbox = &record.pod.sandbox_id;

        tracing::warn!(
            migration_id = %record.migration_id,
            pod = %record.pod,
            "Removing source pod"
        );
        self.guarded(
            record,
            retry_any(&options.retry, "Commit", || restore::remove_pod(runtime, sandbox, options)),
        )
        .await?;
        Ok(MigrationState::Completed)
    }

    async fn do_rollback(&self, record: &MigrationRecord) -> MigrationResult<MigrationState> {
        let destination = self.destination(&record.destination_node)?;
        let engine = &RestoreEngine::new(destination.clients.clone());
        let options = &record.options;
        let id = &record.migration_id;

        let work = retry_any(&options.retry, "Rollback", move || async move {
            engine.teardown(id, options).await?;
            destination.transport.discard(id).await
        });
        self.guarded(record, work).await?;

        tracing::info!(migration_id = %id, pod = %record.pod, "Rolled back; source untouched");
        Ok(MigrationState::RolledBack)
    }
}

/// Retry `op` on any error, with the policy's backoff. Used where giving up
/// early is worse than retrying a non-transient failure.
async fn retry_any<F, Fut>(retry: &RetryPolicy, operation: &str, mut op: F) -> MigrationResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrationResult<()>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
