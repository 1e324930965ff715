// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Restore engine.
//!
//! Recreates a captured pod on the destination node: the sandbox first, then
//! every container concurrently once the sandbox reports Ready. Objects are
//! labelled with the migration ID so a repeated restore finds and reuses
//! what an earlier attempt already created instead of duplicating it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bundle::{BundleEntry, CheckpointBundle};
use crate::error::{MigrationError, MigrationResult};
use crate::record::{ContainerFailure, MigrationOptions};
use crate::runtime::{
    call_with_timeout, Container, ContainerConfig, ContainerFilter, ContainerMetadata,
    ContainerState, ImageService, ImageSpec, NodeClients, PodSandboxConfig, PodSandboxMetadata,
    PodSandboxState, RuntimeService, SandboxFilter,
};
use crate::types::{ContainerId, MigrationId, PodRef, SandboxId};

/// Label carrying the migration ID on every object created by a restore.
pub const MIGRATION_ID_LABEL: &str = "io.podshift.migration-id";
/// Label linking a restored container to the container it was captured from.
pub const SOURCE_CONTAINER_LABEL: &str = "io.podshift.source-container";

/// Annotation asking the runtime to resume from a checkpoint.
pub const RESTORE_ANNOTATION: &str = "io.cri-o.Restore";
/// Annotation naming the checkpoint archive to resume from.
pub const CHECKPOINT_ANNOTATION: &str = "io.cri-o.Checkpoint";

/// One container resumed on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredContainer {
    pub source_id: ContainerId,
    pub container_id: ContainerId,
}

/// Outcome of a restore. A report with failures is a partial restore and
/// must never be treated as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub pod: PodRef,
    pub restored: Vec<RestoredContainer>,
    pub failures: Vec<ContainerFailure>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.restored.len() + self.failures.len()
    }
}

/// Restores bundles through one destination node's runtime.
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    clients: NodeClients,
}

impl RestoreEngine {
    pub fn new(clients: NodeClients) -> Self {
        Self { clients }
    }

    /// Restore `bundle`, whose artifact paths must already point at the
    /// destination's copy.
    pub async fn restore(
        &self,
        bundle: &CheckpointBundle,
        options: &MigrationOptions,
    ) -> MigrationResult<RestoreReport> {
        let started = Instant::now();
        let migration_id = &bundle.migration_id;
        let sandbox_config = sandbox_config(bundle);

        let sandbox_id = self.ensure_sandbox(bundle, &sandbox_config, options).await?;
        self.wait_ready(&sandbox_id, options).await?;

        let pod = PodRef {
            sandbox_id: sandbox_id.clone(),
            name: bundle.pod.name.clone(),
            namespace: bundle.pod.namespace.clone(),
            uid: bundle.pod.uid.clone(),
        };
        tracing::info!(
            migration_id = %migration_id,
            pod = %pod,
            containers = bundle.containers.len(),
            "Sandbox ready, restoring containers"
        );

        let existing = self.existing_containers(migration_id, &sandbox_id, options).await?;

        let permits = Arc::new(Semaphore::new(options.workers.max(1)));
        let sandbox_config = Arc::new(sandbox_config);
        let mut tasks = JoinSet::new();

        for (index, entry) in bundle.containers.iter().enumerate() {
            let job = ContainerJob {
                runtime: self.clients.runtime.clone(),
                images: self.clients.images.clone(),
                migration_id: migration_id.clone(),
                sandbox_id: sandbox_id.clone(),
                sandbox_config: sandbox_config.clone(),
                entry: entry.clone(),
                existing: existing.get(&entry.artifact.container_id).cloned(),
                options: *options,
            };
            let permits = permits.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => job.run().await,
                    Err(e) => Err(MigrationError::WorkerJoin {
                        stage: "Restoring",
                        reason: e.to_string(),
                    }),
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<MigrationResult<ContainerId>>> =
            (0..bundle.containers.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| MigrationError::WorkerJoin {
                stage: "Restoring",
                reason: e.to_string(),
            })?;
            results[index] = Some(result);
        }

        let mut report = RestoreReport {
            pod,
            restored: Vec::new(),
            failures: Vec::new(),
        };
        for (entry, result) in bundle.containers.iter().zip(results) {
            let source_id = entry.artifact.container_id.clone();
            match result {
                Some(Ok(container_id)) => report.restored.push(RestoredContainer {
                    source_id,
                    container_id,
                }),
                Some(Err(e)) => {
                    tracing::warn!(
                        migration_id = %migration_id,
                        container_id = %source_id,
                        error = %e,
                        "Container restore failed"
                    );
                    report.failures.push(ContainerFailure {
                        container_id: source_id,
                        error: e.to_string(),
                    });
                }
                None => report.failures.push(ContainerFailure {
                    container_id: source_id,
                    error: "restore task produced no result".to_string(),
                }),
            }
        }

        tracing::info!(
            migration_id = %migration_id,
            restored = report.restored.len(),
            failed = report.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Restore finished"
        );
        Ok(report)
    }

    /// Remove every sandbox this migration created on the node. Idempotent.
    pub async fn teardown(
        &self,
        migration_id: &MigrationId,
        options: &MigrationOptions,
    ) -> MigrationResult<usize> {
        let filter = SandboxFilter::default().with_label(MIGRATION_ID_LABEL, migration_id.as_str());
        let runtime = self.clients.runtime.as_ref();
        let sandboxes = options
            .retry
            .call("ListPodSandbox", options.rpc_timeout, || {
                runtime.list_pod_sandbox(&filter)
            })
            .await?;

        let mut removed = 0;
        for sandbox in sandboxes.iter().filter(|s| filter.matches(s)) {
            remove_pod(runtime, &sandbox.id, options).await?;
            removed += 1;
        }

        tracing::info!(migration_id = %migration_id, sandboxes = removed, "Destination torn down");
        Ok(removed)
    }

    /// Sandbox from an earlier attempt of this migration, or a new one.
    async fn ensure_sandbox(
        &self,
        bundle: &CheckpointBundle,
        config: &PodSandboxConfig,
        options: &MigrationOptions,
    ) -> MigrationResult<SandboxId> {
        let runtime = self.clients.runtime.as_ref();
        let filter = SandboxFilter::default()
            .with_label(MIGRATION_ID_LABEL, bundle.migration_id.as_str());
        let existing = options
            .retry
            .call("ListPodSandbox", options.rpc_timeout, || {
                runtime.list_pod_sandbox(&filter)
            })
            .await?;

        if let Some(sandbox) = existing
            .iter()
            .filter(|s| filter.matches(s))
            .find(|s| s.state == PodSandboxState::Ready)
        {
            tracing::info!(
                migration_id = %bundle.migration_id,
                sandbox_id = %sandbox.id,
                "Reusing sandbox from earlier attempt"
            );
            return Ok(sandbox.id.clone());
        }

        // Stale NotReady sandboxes of this migration are replaced.
        for stale in existing.iter().filter(|s| filter.matches(s)) {
            remove_pod(runtime, &stale.id, options).await?;
        }

        // Not retried: a timed-out RunPodSandbox may still have succeeded,
        // and the label lookup above is what makes a rerun safe.
        call_with_timeout(
            "RunPodSandbox",
            options.rpc_timeout,
            runtime.run_pod_sandbox(config, &bundle.pod.runtime_handler),
        )
        .await
    }

    async fn wait_ready(&self, id: &SandboxId, options: &MigrationOptions) -> MigrationResult<()> {
        let runtime = self.clients.runtime.as_ref();
        call_with_timeout("PodSandboxReady", options.rpc_timeout, async {
            loop {
                let status = options
                    .retry
                    .call("PodSandboxStatus", options.rpc_timeout, || {
                        runtime.pod_sandbox_status(id)
                    })
                    .await?;
                if status.state == PodSandboxState::Ready {
                    return Ok(());
                }
                tokio::time::sleep(options.ready_poll_interval).await;
            }
        })
        .await
    }

    /// Containers already created by this migration in `sandbox`, keyed by
    /// the source container they restore.
    async fn existing_containers(
        &self,
        migration_id: &MigrationId,
        sandbox: &SandboxId,
        options: &MigrationOptions,
    ) -> MigrationResult<HashMap<ContainerId, Container>> {
        let runtime = self.clients.runtime.as_ref();
        let filter =
            ContainerFilter::in_sandbox(sandbox).with_label(MIGRATION_ID_LABEL, migration_id.as_str());
        let containers = options
            .retry
            .call("ListContainers", options.rpc_timeout, || {
                runtime.list_containers(&filter)
            })
            .await?;

        Ok(containers
            .into_iter()
            .filter(|c| filter.matches(c))
            .filter_map(|c| {
                let source = c.labels.get(SOURCE_CONTAINER_LABEL)?;
                let source = ContainerId::new(source.as_str()).ok()?;
                Some((source, c))
            })
            .collect())
    }
}

/// Sandbox configuration carrying over the captured identity. Deterministic
/// so reruns pass the runtime the same config.
pub fn sandbox_config(bundle: &CheckpointBundle) -> PodSandboxConfig {
    let mut labels = bundle.pod.labels.clone();
    labels.insert(MIGRATION_ID_LABEL.to_string(), bundle.migration_id.to_string());

    PodSandboxConfig {
        metadata: PodSandboxMetadata {
            name: bundle.pod.name.clone(),
            uid: bundle.pod.uid.clone(),
            namespace: bundle.pod.namespace.clone(),
            attempt: bundle.pod.attempt,
        },
        hostname: bundle.pod.name.clone(),
        log_directory: String::new(),
        labels,
        annotations: bundle.pod.annotations.clone(),
    }
}

/// Container configuration that resumes `entry` from its checkpoint.
pub fn container_config(
    migration_id: &MigrationId,
    entry: &BundleEntry,
) -> MigrationResult<ContainerConfig> {
    let status = &entry.status;
    let image = status
        .resolve_image()
        .ok_or_else(|| MigrationError::UnresolvableImage {
            container_id: status.container_id.clone(),
        })?;

    let mut labels: BTreeMap<String, String> = status.labels.clone();
    labels.insert(MIGRATION_ID_LABEL.to_string(), migration_id.to_string());
    labels.insert(
        SOURCE_CONTAINER_LABEL.to_string(),
        entry.artifact.container_id.to_string(),
    );

    let mut annotations = status.annotations.clone();
    annotations.insert(RESTORE_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(
        CHECKPOINT_ANNOTATION.to_string(),
        entry.artifact.archive_path.display().to_string(),
    );

    Ok(ContainerConfig {
        metadata: ContainerMetadata {
            name: status.name.clone(),
            attempt: status.attempt,
        },
        image: ImageSpec::new(image),
        labels,
        annotations,
        log_path: status.log_path.clone(),
    })
}

/// Stop and remove every container of a sandbox, then the sandbox itself.
/// Objects that are already gone are not an error.
pub async fn remove_pod(
    runtime: &dyn RuntimeService,
    sandbox: &SandboxId,
    options: &MigrationOptions,
) -> MigrationResult<()> {
    let filter = ContainerFilter::in_sandbox(sandbox);
    let containers = options
        .retry
        .call("ListContainers", options.rpc_timeout, || {
            runtime.list_containers(&filter)
        })
        .await?;

    for container in containers.iter().filter(|c| filter.matches(c)) {
        let stop = options
            .retry
            .call("StopContainer", options.rpc_timeout + options.stop_timeout, || {
                runtime.stop_container(&container.id, options.stop_timeout)
            })
            .await;
        tolerate_missing(stop)?;
        let remove = options
            .retry
            .call("RemoveContainer", options.rpc_timeout, || {
                runtime.remove_container(&container.id)
            })
            .await;
        tolerate_missing(remove)?;
        tracing::debug!(sandbox_id = %sandbox, container_id = %container.id, "Container removed");
    }

    let stop = options
        .retry
        .call("StopPodSandbox", options.rpc_timeout, || runtime.stop_pod_sandbox(sandbox))
        .await;
    tolerate_missing(stop)?;
    let remove = options
        .retry
        .call("RemovePodSandbox", options.rpc_timeout, || {
            runtime.remove_pod_sandbox(sandbox)
        })
        .await;
    tolerate_missing(remove)?;

    tracing::info!(sandbox_id = %sandbox, containers = containers.len(), "Pod removed");
    Ok(())
}

fn tolerate_missing(result: MigrationResult<()>) -> MigrationResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Everything one restore task needs, owned so it can run on the pool.
struct ContainerJob {
    runtime: Arc<dyn RuntimeService>,
    images: Arc<dyn ImageService>,
    migration_id: MigrationId,
    sandbox_id: SandboxId,
    sandbox_config: Arc<PodSandboxConfig>,
    entry: BundleEntry,
    existing: Option<Container>,
    options: MigrationOptions,
}

impl ContainerJob {
    async fn run(self) -> MigrationResult<ContainerId> {
        let options = &self.options;
        let runtime = self.runtime.as_ref();
        let config = container_config(&self.migration_id, &self.entry)?;

        let container_id = match &self.existing {
            Some(c) if c.state == ContainerState::Running => {
                tracing::debug!(container_id = %c.id, "Already restored");
                return Ok(c.id.clone());
            }
            Some(c) if c.state == ContainerState::Created => c.id.clone(),
            Some(c) => {
                // Exited or unknown leftovers cannot be resumed; recreate.
                tolerate_missing(
                    options
                        .retry
                        .call("RemoveContainer", options.rpc_timeout, || {
                            runtime.remove_container(&c.id)
                        })
                        .await,
                )?;
                self.create(&config).await?
            }
            None => self.create(&config).await?,
        };

        options
            .retry
            .call("StartContainer", options.rpc_timeout, || {
                runtime.start_container(&container_id)
            })
            .await?;

        let status = options
            .retry
            .call("ContainerStatus", options.rpc_timeout, || {
                runtime.container_status(&container_id)
            })
            .await?;
        if status.state != ContainerState::Running {
            return Err(MigrationError::RuntimeRpc {
                operation: "StartContainer",
                code: crate::error::RpcCode::Unknown,
                message: format!(
                    "container {} is {} after restore, expected Running",
                    container_id,
                    status.state.name()
                ),
            });
        }

        tracing::debug!(
            source = %self.entry.artifact.container_id,
            container_id = %container_id,
            "Container restored"
        );
        Ok(container_id)
    }

    async fn create(&self, config: &ContainerConfig) -> MigrationResult<ContainerId> {
        let options = &self.options;
        self.ensure_image(&config.image).await?;
        call_with_timeout(
            "CreateContainer",
            options.rpc_timeout,
            self.runtime
                .create_container(&self.sandbox_id, config, &self.sandbox_config),
        )
        .await
    }

    /// Pull only when the destination does not already have the image.
    async fn ensure_image(&self, image: &ImageSpec) -> MigrationResult<()> {
        let options = &self.options;
        let images = self.images.as_ref();
        let present = options
            .retry
            .call("ImageStatus", options.rpc_timeout, || images.image_status(image))
            .await?;
        if present.is_some() {
            return Ok(());
        }

        tracing::info!(image = %image.image, "Pulling image");
        let limit = options.deadlines.restoring;
        options
            .retry
            .call("PullImage", limit, || images.pull_image(image, limit))
            .await?;
        Ok(())
    }
}
