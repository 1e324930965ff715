// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Container runtime client boundary.
//!
//! The orchestrator only ever talks to a node through these two traits. The
//! runtime itself (the process doing the kernel-level checkpoint/restore) is
//! an external collaborator; [`CrictlClient`] reaches it through `crictl`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MigrationError, MigrationResult};
use crate::types::{ContainerId, SandboxId};

mod crictl;
pub mod types;

pub use crictl::CrictlClient;
pub use types::{
    Container, ContainerConfig, ContainerFilter, ContainerMetadata, ContainerState,
    ContainerStatus, Image, ImageSpec, PodSandbox, PodSandboxConfig, PodSandboxMetadata,
    PodSandboxState, PodSandboxStatus, SandboxFilter,
};

/// Typed surface over the CRI `RuntimeService`.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn list_pod_sandbox(&self, filter: &SandboxFilter) -> MigrationResult<Vec<PodSandbox>>;

    async fn pod_sandbox_status(&self, id: &SandboxId) -> MigrationResult<PodSandboxStatus>;

    async fn list_containers(&self, filter: &ContainerFilter) -> MigrationResult<Vec<Container>>;

    async fn container_status(&self, id: &ContainerId) -> MigrationResult<ContainerStatus>;

    /// Write the container's process state to `location`. The runtime must
    /// give up after `timeout`.
    async fn checkpoint_container(
        &self,
        id: &ContainerId,
        location: &Path,
        timeout: Duration,
    ) -> MigrationResult<()>;

    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> MigrationResult<SandboxId>;

    async fn create_container(
        &self,
        sandbox_id: &SandboxId,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> MigrationResult<ContainerId>;

    async fn start_container(&self, id: &ContainerId) -> MigrationResult<()>;

    async fn stop_container(&self, id: &ContainerId, timeout: Duration) -> MigrationResult<()>;

    async fn remove_container(&self, id: &ContainerId) -> MigrationResult<()>;

    async fn stop_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()>;

    async fn remove_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()>;
}

/// Typed surface over the CRI `ImageService`.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// `None` when the image is not present on the node.
    async fn image_status(&self, image: &ImageSpec) -> MigrationResult<Option<Image>>;

    /// Returns the resolved image reference. The runtime must give up after
    /// `timeout`.
    async fn pull_image(&self, image: &ImageSpec, timeout: Duration) -> MigrationResult<String>;
}

/// Runtime and image clients for one node.
#[derive(Clone)]
pub struct NodeClients {
    pub runtime: Arc<dyn RuntimeService>,
    pub images: Arc<dyn ImageService>,
}

impl NodeClients {
    pub fn new(runtime: Arc<dyn RuntimeService>, images: Arc<dyn ImageService>) -> Self {
        Self { runtime, images }
    }

    /// One client serving both services, as `crictl` does.
    pub fn shared<C>(client: Arc<C>) -> Self
    where
        C: RuntimeService + ImageService + 'static,
    {
        Self {
            runtime: client.clone(),
            images: client,
        }
    }
}

impl std::fmt::Debug for NodeClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClients").finish_non_exhaustive()
    }
}

/// Bound a runtime call. There is no unbounded wait anywhere in the
/// orchestrator; an elapsed deadline becomes a retryable `Timeout`.
pub async fn call_with_timeout<T, F>(
    operation: &str,
    timeout: Duration,
    call: F,
) -> MigrationResult<T>
where
    F: Future<Output = MigrationResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(MigrationError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_with_timeout_elapses() {
        let result: MigrationResult<()> =
            call_with_timeout("StartContainer", Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(MigrationError::Timeout {
                operation,
                timeout_ms,
            }) => {
                assert_eq!(operation, "StartContainer");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_with_timeout_passes_through() {
        let result = call_with_timeout("ListContainers", Duration::from_secs(1), async {
            Ok::<_, MigrationError>(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
