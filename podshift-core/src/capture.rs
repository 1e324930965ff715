// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint capture engine.
//!
//! Selects a pod on the source node, checkpoints every running container
//! into the bundle staging directory on a bounded worker pool, snapshots pod
//! and container status afterwards, and publishes the bundle. Capture is
//! all-or-nothing: one failed checkpoint means no bundle is published.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bundle::{self, BundleCodec, BundleEntry, CheckpointArtifact, CheckpointBundle};
use crate::error::{HardValidationError, MigrationError, MigrationResult};
use crate::integrity;
use crate::record::MigrationOptions;
use crate::retry::RetryPolicy;
use crate::runtime::{Container, ContainerFilter, ContainerState, PodSandbox, RuntimeService, SandboxFilter};
use crate::snapshot::{ContainerStatusSnapshot, PodStatusSnapshot};
use crate::types::{ContainerId, MigrationId, NodeName, PodRef, PodSelector};

/// Extra time granted on top of the runtime's own checkpoint timeout before
/// the call is abandoned locally.
const CHECKPOINT_GRACE: Duration = Duration::from_secs(5);

/// Resolve `selector` against Ready sandboxes on the source node.
pub async fn select_pod(
    runtime: &dyn RuntimeService,
    selector: &PodSelector,
    rpc_timeout: Duration,
    retry: &RetryPolicy,
) -> MigrationResult<PodRef> {
    let mut filter = SandboxFilter::ready();
    match selector {
        PodSelector::SandboxId { id } => filter.id = Some(id.clone()),
        PodSelector::Labels { labels } => filter.label_selector = labels.clone(),
        PodSelector::Name { .. } => {}
    }

    let sandboxes = retry
        .call("ListPodSandbox", rpc_timeout, || runtime.list_pod_sandbox(&filter))
        .await?;

    let candidates: Vec<&PodSandbox> = sandboxes
        .iter()
        .filter(|s| filter.matches(s))
        .filter(|s| match selector {
            PodSelector::Name { namespace, name } => {
                &s.metadata.name == name
                    && namespace
                        .as_ref()
                        .map(|ns| &s.metadata.namespace == ns)
                        .unwrap_or(true)
            }
            _ => true,
        })
        .collect();

    match candidates.as_slice() {
        [] => Err(MigrationError::NotFound {
            selector: selector.to_string(),
        }),
        [sandbox] => Ok(PodRef {
            sandbox_id: sandbox.id.clone(),
            name: sandbox.metadata.name.clone(),
            namespace: sandbox.metadata.namespace.clone(),
            uid: sandbox.metadata.uid.clone(),
        }),
        many => Err(MigrationError::Ambiguous {
            selector: selector.to_string(),
            candidates: many
                .iter()
                .map(|s| format!("{}/{} ({})", s.metadata.namespace, s.metadata.name, s.id))
                .collect(),
        }),
    }
}

/// Produces published checkpoint bundles on the source node.
#[derive(Clone)]
pub struct CaptureEngine {
    runtime: Arc<dyn RuntimeService>,
    codec: BundleCodec,
    source_node: NodeName,
}

impl CaptureEngine {
    pub fn new(runtime: Arc<dyn RuntimeService>, codec: BundleCodec, source_node: NodeName) -> Self {
        Self {
            runtime,
            codec,
            source_node,
        }
    }

    pub fn codec(&self) -> &BundleCodec {
        &self.codec
    }

    /// Checkpoint `pod` and publish its bundle under `migration_id`.
    ///
    /// Safe to repeat: a bundle already published for `migration_id` is
    /// verified and returned instead of checkpointing again.
    pub async fn capture(
        &self,
        migration_id: &MigrationId,
        pod: &PodRef,
        options: &MigrationOptions,
    ) -> MigrationResult<CheckpointBundle> {
        if let Some(bundle) = self.existing_bundle(migration_id, pod).await? {
            return Ok(bundle);
        }

        let started = Instant::now();
        let containers = self.running_containers(pod, options).await?;
        let staging = self.codec.prepare_staging(migration_id)?;

        tracing::info!(
            migration_id = %migration_id,
            pod = %pod,
            containers = containers.len(),
            workers = options.workers,
            "Checkpointing containers"
        );

        let artifacts = self
            .checkpoint_all(migration_id, &containers, staging, options)
            .await?;

        // Statuses are taken only now: checkpointing may change what the
        // runtime reports.
        let sandbox_status = options
            .retry
            .call("PodSandboxStatus", options.rpc_timeout, || {
                self.runtime.pod_sandbox_status(&pod.sandbox_id)
            })
            .await?;
        let pod_snapshot = PodStatusSnapshot::from_status(&sandbox_status)?;

        let mut entries = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let status = options
                .retry
                .call("ContainerStatus", options.rpc_timeout, || {
                    self.runtime.container_status(&artifact.container_id)
                })
                .await?;
            entries.push(BundleEntry {
                status: ContainerStatusSnapshot::from_status(&status)?,
                artifact,
            });
        }

        let bundle = CheckpointBundle {
            format_version: bundle::FORMAT_VERSION,
            migration_id: migration_id.clone(),
            source_node: self.source_node.clone(),
            created_at: Utc::now(),
            pod: pod_snapshot,
            containers: entries,
        };

        let codec = self.codec.clone();
        let to_encode = bundle.clone();
        let published = tokio::task::spawn_blocking(move || codec.encode(&to_encode))
            .await
            .map_err(|e| MigrationError::WorkerJoin {
                stage: "Capturing",
                reason: e.to_string(),
            })??;

        tracing::info!(
            migration_id = %migration_id,
            path = %published.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Capture complete"
        );

        Ok(bundle.relocated(&published))
    }

    async fn existing_bundle(
        &self,
        migration_id: &MigrationId,
        pod: &PodRef,
    ) -> MigrationResult<Option<CheckpointBundle>> {
        if !self.codec.is_published(migration_id) {
            return Ok(None);
        }

        let path = self.codec.bundle_dir(migration_id);
        let decoded = tokio::task::spawn_blocking(move || BundleCodec::decode(&path))
            .await
            .map_err(|e| MigrationError::WorkerJoin {
                stage: "Capturing",
                reason: e.to_string(),
            })?;

        match decoded {
            Ok(bundle) if bundle.pod.sandbox_id == pod.sandbox_id => {
                tracing::info!(
                    migration_id = %migration_id,
                    containers = bundle.containers.len(),
                    "Reusing published bundle"
                );
                Ok(Some(bundle))
            }
            Ok(bundle) => Err(MigrationError::CorruptBundle {
                path: self.codec.bundle_dir(migration_id),
                reason: format!(
                    "bundle belongs to sandbox {}, expected {}",
                    bundle.pod.sandbox_id, pod.sandbox_id
                ),
            }),
            Err(e) if e.is_integrity() => {
                // Source is untouched before commit, so a damaged local
                // bundle is simply recaptured.
                tracing::warn!(
                    migration_id = %migration_id,
                    error = %e,
                    "Discarding unusable bundle"
                );
                self.codec.discard(migration_id)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn running_containers(
        &self,
        pod: &PodRef,
        options: &MigrationOptions,
    ) -> MigrationResult<Vec<Container>> {
        let filter = ContainerFilter {
            state: Some(ContainerState::Running),
            ..ContainerFilter::in_sandbox(&pod.sandbox_id)
        };
        let containers: Vec<Container> = options
            .retry
            .call("ListContainers", options.rpc_timeout, || {
                self.runtime.list_containers(&filter)
            })
            .await?
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect();

        if containers.is_empty() {
            return Err(MigrationError::EmptyPod {
                pod: pod.qualified_name(),
            });
        }
        Ok(containers)
    }

    /// Checkpoint every container concurrently. Returns artifacts in the
    /// order of `containers`, or the first error after cancelling the rest.
    async fn checkpoint_all(
        &self,
        migration_id: &MigrationId,
        containers: &[Container],
        staging: PathBuf,
        options: &MigrationOptions,
    ) -> MigrationResult<Vec<CheckpointArtifact>> {
        let permits = Arc::new(Semaphore::new(options.workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, container) in containers.iter().enumerate() {
            let runtime = self.runtime.clone();
            let permits = permits.clone();
            let id = container.id.clone();
            let location = staging.join(bundle::archive_name(&id));
            let options = *options;

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|e| {
                    MigrationError::WorkerJoin {
                        stage: "Capturing",
                        reason: e.to_string(),
                    }
                })?;
                checkpoint_one(runtime, id, location, &options)
                    .await
                    .map(|artifact| (index, artifact))
            });
        }

        let mut artifacts: Vec<Option<CheckpointArtifact>> = vec![None; containers.len()];
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| MigrationError::WorkerJoin {
                stage: "Capturing",
                reason: e.to_string(),
            });
            match result.and_then(|r| r) {
                Ok((index, artifact)) => artifacts[index] = Some(artifact),
                Err(e) => {
                    tasks.abort_all();
                    let completed = artifacts.iter().flatten().count();
                    tracing::error!(
                        migration_id = %migration_id,
                        completed = completed,
                        total = containers.len(),
                        error = %e,
                        "Checkpoint failed, abandoning capture"
                    );
                    return Err(e);
                }
            }
        }

        artifacts
            .into_iter()
            .zip(containers)
            .map(|(artifact, container)| {
                artifact.ok_or_else(|| MigrationError::WorkerJoin {
                    stage: "Capturing",
                    reason: format!("no result for container {}", container.id),
                })
            })
            .collect()
    }
}

async fn checkpoint_one(
    runtime: Arc<dyn RuntimeService>,
    id: ContainerId,
    location: PathBuf,
    options: &MigrationOptions,
) -> MigrationResult<CheckpointArtifact> {
    let started = Instant::now();
    options
        .retry
        .call(
            "CheckpointContainer",
            options.checkpoint_timeout + CHECKPOINT_GRACE,
            || runtime.checkpoint_container(&id, &location, options.checkpoint_timeout),
        )
        .await?;

    let path = location.clone();
    let digest = tokio::task::spawn_blocking(move || integrity::digest_file(&path))
        .await
        .map_err(|e| MigrationError::WorkerJoin {
            stage: "Capturing",
            reason: e.to_string(),
        })?
        .map_err(|e| MigrationError::CorruptBundle {
            path: location.clone(),
            reason: format!("runtime reported success but archive is unreadable: {}", e),
        })?;

    if digest.size_bytes == 0 {
        return Err(MigrationError::HardValidation(
            HardValidationError::InvalidFieldValue {
                field: "checkpoint_archive",
                value: location.display().to_string(),
                reason: "Runtime produced an empty archive".to_string(),
            },
        ));
    }

    tracing::debug!(
        container_id = %id,
        size_bytes = digest.size_bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Container checkpointed"
    );

    Ok(CheckpointArtifact {
        container_id: id,
        archive_path: location,
        size_bytes: digest.size_bytes,
        checksum: digest.checksum,
    })
}

