// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-memory CRI node with fault injection, shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podshift_core::error::{MigrationError, MigrationResult, RpcCode};
use podshift_core::integrity::FileDigest;
use podshift_core::machine::Destination;
use podshift_core::record::{MigrationOptions, StageDeadlines};
use podshift_core::restore::{CHECKPOINT_ANNOTATION, MIGRATION_ID_LABEL, RESTORE_ANNOTATION};
use podshift_core::runtime::{
    Container, ContainerConfig, ContainerFilter, ContainerMetadata, ContainerState,
    ContainerStatus, Image, ImageService, ImageSpec, NodeClients, PodSandbox, PodSandboxConfig,
    PodSandboxMetadata, PodSandboxState, PodSandboxStatus, RuntimeService, SandboxFilter,
};
use podshift_core::transfer::{
    ConfirmationKey, LocalDirTransport, TransferConfirmation, TransferManifest, Transport,
};
use podshift_core::{
    BundleCodec, ContainerId, MigrationId, MigrationStateMachine, MigrationStore, NodeName,
    RetryPolicy, SandboxId,
};
use tempfile::TempDir;

pub const KEY: &[u8] = b"integration-test-confirmation-key";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: ContainerId,
    pub sandbox: SandboxId,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub state: ContainerState,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FakeSandbox {
    pub id: SandboxId,
    pub metadata: PodSandboxMetadata,
    pub state: PodSandboxState,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub runtime_handler: String,
}

/// Failures a test can arm on a node.
#[derive(Debug, Default)]
pub struct Faults {
    /// Source container IDs whose checkpoint fails.
    pub fail_checkpoint: HashSet<String>,
    /// Delay every checkpoint by this much.
    pub checkpoint_delay: Option<Duration>,
    /// Container names whose start fails with a transient error this many times.
    pub transient_start_failures: BTreeMap<String, u32>,
    /// Container names whose start always fails.
    pub fail_start: HashSet<String>,
    /// Every RemovePodSandbox fails.
    pub fail_remove_sandbox: bool,
    /// Delay every StartContainer by this much.
    pub start_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct NodeState {
    pub sandboxes: BTreeMap<SandboxId, FakeSandbox>,
    pub containers: BTreeMap<ContainerId, FakeContainer>,
    pub images: BTreeSet<String>,
    pub pulls: Vec<String>,
    pub checkpoints: Vec<ContainerId>,
}

/// One fake node serving both CRI services.
#[derive(Debug)]
pub struct FakeNode {
    pub name: String,
    pub state: Mutex<NodeState>,
    pub faults: Mutex<Faults>,
    next_id: AtomicU32,
}

fn rpc_error(operation: &'static str, code: RpcCode, message: impl Into<String>) -> MigrationError {
    MigrationError::RuntimeRpc {
        operation,
        code,
        message: message.into(),
    }
}

impl FakeNode {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(NodeState::default()),
            faults: Mutex::new(Faults::default()),
            next_id: AtomicU32::new(1),
        })
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{}{}{}", self.name, prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Add a Ready pod with running containers `(id, name, image)`.
    pub fn add_pod(&self, sandbox: &str, namespace: &str, name: &str, containers: &[(&str, &str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let sandbox_id = SandboxId::new(sandbox).unwrap();
        state.sandboxes.insert(
            sandbox_id.clone(),
            FakeSandbox {
                id: sandbox_id.clone(),
                metadata: PodSandboxMetadata {
                    name: name.to_string(),
                    uid: format!("uid-{}", sandbox),
                    namespace: namespace.to_string(),
                    attempt: 0,
                },
                state: PodSandboxState::Ready,
                labels: BTreeMap::from([("app".to_string(), name.to_string())]),
                annotations: BTreeMap::from([("owner".to_string(), "team-a".to_string())]),
                runtime_handler: "runc".to_string(),
            },
        );
        for (id, cname, image) in containers {
            let id = ContainerId::new(*id).unwrap();
            if !image.is_empty() {
                state.images.insert(image.to_string());
            }
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    id,
                    sandbox: sandbox_id.clone(),
                    name: cname.to_string(),
                    image: image.to_string(),
                    image_id: String::new(),
                    state: ContainerState::Running,
                    labels: BTreeMap::new(),
                    annotations: BTreeMap::new(),
                },
            );
        }
    }

    pub fn sandbox(&self, id: &str) -> Option<FakeSandbox> {
        let id = SandboxId::new(id).ok()?;
        self.state.lock().unwrap().sandboxes.get(&id).cloned()
    }

    pub fn sandboxes(&self) -> Vec<FakeSandbox> {
        self.state.lock().unwrap().sandboxes.values().cloned().collect()
    }

    pub fn containers_in(&self, sandbox: &SandboxId) -> Vec<FakeContainer> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| &c.sandbox == sandbox)
            .cloned()
            .collect()
    }

    /// The pod is present, Ready, and every listed container is running.
    pub fn pod_is_live(&self, sandbox: &str, containers: &[&str]) -> bool {
        let state = self.state.lock().unwrap();
        let Ok(id) = SandboxId::new(sandbox) else {
            return false;
        };
        let ready = state
            .sandboxes
            .get(&id)
            .map(|s| s.state == PodSandboxState::Ready)
            .unwrap_or(false);
        ready
            && containers.iter().all(|c| {
                ContainerId::new(*c)
                    .ok()
                    .and_then(|cid| state.containers.get(&cid))
                    .map(|c| c.state == ContainerState::Running && c.sandbox == id)
                    .unwrap_or(false)
            })
    }

    fn to_container(c: &FakeContainer) -> Container {
        Container {
            id: c.id.clone(),
            pod_sandbox_id: c.sandbox.clone(),
            metadata: ContainerMetadata {
                name: c.name.clone(),
                attempt: 0,
            },
            image: ImageSpec::new(c.image.clone()),
            image_ref: c.image_id.clone(),
            state: c.state,
            labels: c.labels.clone(),
            annotations: c.annotations.clone(),
        }
    }

    fn to_sandbox(s: &FakeSandbox) -> PodSandbox {
        PodSandbox {
            id: s.id.clone(),
            metadata: s.metadata.clone(),
            state: s.state,
            labels: s.labels.clone(),
            annotations: s.annotations.clone(),
            runtime_handler: s.runtime_handler.clone(),
        }
    }
}

#[async_trait]
impl RuntimeService for FakeNode {
    async fn list_pod_sandbox(&self, filter: &SandboxFilter) -> MigrationResult<Vec<PodSandbox>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sandboxes
            .values()
            .map(Self::to_sandbox)
            .filter(|s| filter.matches(s))
            .collect())
    }

    async fn pod_sandbox_status(&self, id: &SandboxId) -> MigrationResult<PodSandboxStatus> {
        let state = self.state.lock().unwrap();
        let s = state
            .sandboxes
            .get(id)
            .ok_or_else(|| rpc_error("PodSandboxStatus", RpcCode::NotFound, id.to_string()))?;
        Ok(PodSandboxStatus {
            id: s.id.clone(),
            metadata: s.metadata.clone(),
            state: s.state,
            labels: s.labels.clone(),
            annotations: s.annotations.clone(),
            runtime_handler: s.runtime_handler.clone(),
        })
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> MigrationResult<Vec<Container>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .map(Self::to_container)
            .filter(|c| filter.matches(c))
            .collect())
    }

    async fn container_status(&self, id: &ContainerId) -> MigrationResult<ContainerStatus> {
        let state = self.state.lock().unwrap();
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| rpc_error("ContainerStatus", RpcCode::NotFound, id.to_string()))?;
        Ok(ContainerStatus {
            id: c.id.clone(),
            metadata: ContainerMetadata {
                name: c.name.clone(),
                attempt: 0,
            },
            state: c.state,
            image: (!c.image.is_empty()).then(|| ImageSpec::new(c.image.clone())),
            image_ref: c.image_id.clone(),
            image_id: c.image_id.clone(),
            exit_code: 0,
            labels: c.labels.clone(),
            annotations: c.annotations.clone(),
            log_path: format!("{}/0.log", c.name),
        })
    }

    async fn checkpoint_container(
        &self,
        id: &ContainerId,
        location: &Path,
        _timeout: Duration,
    ) -> MigrationResult<()> {
        let (fail, delay) = {
            let faults = self.faults.lock().unwrap();
            (faults.fail_checkpoint.contains(id.as_str()), faults.checkpoint_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(rpc_error("CheckpointContainer", RpcCode::Unknown, "criu dump failed"));
        }

        {
            let mut state = self.state.lock().unwrap();
            if !state.containers.contains_key(id) {
                return Err(rpc_error("CheckpointContainer", RpcCode::NotFound, id.to_string()));
            }
            state.checkpoints.push(id.clone());
        }
        std::fs::write(location, format!("process state of {} on {}", id, self.name))
            .map_err(|e| MigrationError::io("writing fake checkpoint", e))
    }

    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> MigrationResult<SandboxId> {
        let id = SandboxId::new(self.fresh_id("-sb-")).unwrap();
        let mut state = self.state.lock().unwrap();
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                id: id.clone(),
                metadata: config.metadata.clone(),
                state: PodSandboxState::Ready,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
                runtime_handler: runtime_handler.to_string(),
            },
        );
        Ok(id)
    }

    async fn create_container(
        &self,
        sandbox_id: &SandboxId,
        config: &ContainerConfig,
        _sandbox_config: &PodSandboxConfig,
    ) -> MigrationResult<ContainerId> {
        if config.annotations.get(RESTORE_ANNOTATION).map(String::as_str) != Some("true") {
            return Err(rpc_error("CreateContainer", RpcCode::InvalidArgument, "not a restore"));
        }
        let archive = config
            .annotations
            .get(CHECKPOINT_ANNOTATION)
            .ok_or_else(|| rpc_error("CreateContainer", RpcCode::InvalidArgument, "no checkpoint"))?;
        if !Path::new(archive).is_file() {
            return Err(rpc_error(
                "CreateContainer",
                RpcCode::InvalidArgument,
                format!("checkpoint {} missing", archive),
            ));
        }

        let id = ContainerId::new(self.fresh_id("-ct-")).unwrap();
        let mut state = self.state.lock().unwrap();
        let sandbox = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| rpc_error("CreateContainer", RpcCode::NotFound, sandbox_id.to_string()))?;
        if sandbox.state != PodSandboxState::Ready {
            return Err(rpc_error("CreateContainer", RpcCode::InvalidArgument, "sandbox not ready"));
        }
        if !state.images.contains(&config.image.image) {
            return Err(rpc_error("CreateContainer", RpcCode::NotFound, "image not present"));
        }
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                sandbox: sandbox_id.clone(),
                name: config.metadata.name.clone(),
                image: config.image.image.clone(),
                image_id: String::new(),
                state: ContainerState::Created,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> MigrationResult<()> {
        let delay = self.faults.lock().unwrap().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let name = state
            .containers
            .get(id)
            .map(|c| c.name.clone())
            .ok_or_else(|| rpc_error("StartContainer", RpcCode::NotFound, id.to_string()))?;

        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fail_start.contains(&name) {
                return Err(rpc_error("StartContainer", RpcCode::Unknown, "restore failed"));
            }
            if let Some(left) = faults.transient_start_failures.get_mut(&name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(rpc_error("StartContainer", RpcCode::Unavailable, "runtime busy"));
                }
            }
        }

        if let Some(c) = state.containers.get_mut(id) {
            c.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, _timeout: Duration) -> MigrationResult<()> {
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .get_mut(id)
            .ok_or_else(|| rpc_error("StopContainer", RpcCode::NotFound, id.to_string()))?;
        c.state = ContainerState::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId) -> MigrationResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| rpc_error("RemoveContainer", RpcCode::NotFound, id.to_string()))
    }

    async fn stop_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()> {
        let mut state = self.state.lock().unwrap();
        let s = state
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| rpc_error("StopPodSandbox", RpcCode::NotFound, id.to_string()))?;
        s.state = PodSandboxState::NotReady;
        Ok(())
    }

    async fn remove_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()> {
        if self.faults.lock().unwrap().fail_remove_sandbox {
            return Err(rpc_error("RemovePodSandbox", RpcCode::Unknown, "device busy"));
        }
        let mut state = self.state.lock().unwrap();
        state
            .sandboxes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| rpc_error("RemovePodSandbox", RpcCode::NotFound, id.to_string()))
    }
}

#[async_trait]
impl ImageService for FakeNode {
    async fn image_status(&self, image: &ImageSpec) -> MigrationResult<Option<Image>> {
        let state = self.state.lock().unwrap();
        Ok(state.images.contains(&image.image).then(|| Image {
            id: format!("sha256:{}", image.image.len()),
            repo_tags: vec![image.image.clone()],
            repo_digests: vec![],
        }))
    }

    async fn pull_image(&self, image: &ImageSpec, _timeout: Duration) -> MigrationResult<String> {
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.image.clone());
        state.pulls.push(image.image.clone());
        Ok(image.image.clone())
    }
}

/// Transport that flips one byte of a named file while sending it.
pub struct CorruptingTransport {
    pub inner: LocalDirTransport,
    pub target: String,
    pub scratch: TempDir,
}

#[async_trait]
impl Transport for CorruptingTransport {
    fn node(&self) -> &NodeName {
        self.inner.node()
    }

    async fn probe(&self, id: &MigrationId, name: &str) -> MigrationResult<Option<FileDigest>> {
        self.inner.probe(id, name).await
    }

    async fn send_file(&self, id: &MigrationId, name: &str, source: &Path) -> MigrationResult<()> {
        if name != self.target {
            return self.inner.send_file(id, name, source).await;
        }
        let mut data = std::fs::read(source).map_err(|e| MigrationError::io("reading", e))?;
        data[0] ^= 0xff;
        let damaged = self.scratch.path().join(name);
        std::fs::write(&damaged, data).map_err(|e| MigrationError::io("writing", e))?;
        self.inner.send_file(id, name, &damaged).await
    }

    async fn confirm(&self, manifest: &TransferManifest) -> MigrationResult<TransferConfirmation> {
        self.inner.confirm(manifest).await
    }

    async fn discard(&self, id: &MigrationId) -> MigrationResult<()> {
        self.inner.discard(id).await
    }

    fn remote_bundle_dir(&self, id: &MigrationId) -> PathBuf {
        self.inner.remote_bundle_dir(id)
    }
}

/// Transport that remembers the name of every file it sends.
pub struct RecordingTransport {
    pub inner: LocalDirTransport,
    pub sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new(inbox: &Path) -> Self {
        Self {
            inner: LocalDirTransport::new(n2(), inbox, inbox, key()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn node(&self) -> &NodeName {
        self.inner.node()
    }

    async fn probe(&self, id: &MigrationId, name: &str) -> MigrationResult<Option<FileDigest>> {
        self.inner.probe(id, name).await
    }

    async fn send_file(&self, id: &MigrationId, name: &str, source: &Path) -> MigrationResult<()> {
        self.sent.lock().unwrap().push(name.to_string());
        self.inner.send_file(id, name, source).await
    }

    async fn confirm(&self, manifest: &TransferManifest) -> MigrationResult<TransferConfirmation> {
        self.inner.confirm(manifest).await
    }

    async fn discard(&self, id: &MigrationId) -> MigrationResult<()> {
        self.inner.discard(id).await
    }

    fn remote_bundle_dir(&self, id: &MigrationId) -> PathBuf {
        self.inner.remote_bundle_dir(id)
    }
}

/// Two fake nodes, on-disk state and everything needed to build drivers.
pub struct Cluster {
    pub source: Arc<FakeNode>,
    pub dest: Arc<FakeNode>,
    pub dir: TempDir,
    pub transport: Arc<dyn Transport>,
}

impl Cluster {
    /// Source `n1` with pod `p1` (`c1`, `c2`), empty destination `n2`.
    pub fn new() -> Self {
        let source = FakeNode::new("n1");
        source.add_pod(
            "p1",
            "default",
            "web",
            &[("c1", "app", "nginx:1.25"), ("c2", "sidecar", "busybox:1.36")],
        );
        Self::with_source(source)
    }

    pub fn with_source(source: Arc<FakeNode>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn Transport> = Arc::new(LocalDirTransport::new(
            NodeName::new("n2").unwrap(),
            dir.path().join("inbox"),
            dir.path().join("inbox"),
            key(),
        ));
        Self {
            source,
            dest: FakeNode::new("n2"),
            dir,
            transport,
        }
    }

    pub fn corrupt_transfers_of(&mut self, file: &str) {
        self.transport = Arc::new(CorruptingTransport {
            inner: LocalDirTransport::new(
                NodeName::new("n2").unwrap(),
                self.dir.path().join("inbox"),
                self.dir.path().join("inbox"),
                key(),
            ),
            target: file.to_string(),
            scratch: tempfile::tempdir().unwrap(),
        });
    }

    pub fn codec(&self) -> BundleCodec {
        BundleCodec::new(self.dir.path().join("bundles"))
    }

    pub fn store(&self) -> Arc<MigrationStore> {
        MigrationStore::open_shared(self.dir.path().join("state")).unwrap()
    }

    /// A fresh driver over the same nodes and on-disk state, as a restarted
    /// process would build it.
    pub fn machine(&self) -> MigrationStateMachine {
        MigrationStateMachine::new(
            NodeName::new("n1").unwrap(),
            NodeClients::shared(self.source.clone()),
            self.codec(),
            self.store(),
            key(),
        )
        .with_destination(Destination {
            name: NodeName::new("n2").unwrap(),
            clients: NodeClients::shared(self.dest.clone()),
            transport: self.transport.clone(),
        })
        .with_cancel_poll(Duration::from_millis(10))
    }

    /// Sandboxes on the destination created for `id`.
    pub fn restored_sandboxes(&self, id: &MigrationId) -> Vec<FakeSandbox> {
        self.dest
            .sandboxes()
            .into_iter()
            .filter(|s| s.labels.get(MIGRATION_ID_LABEL).map(String::as_str) == Some(id.as_str()))
            .collect()
    }
}

pub fn key() -> ConfirmationKey {
    ConfirmationKey::new(KEY.to_vec()).unwrap()
}

pub fn n2() -> NodeName {
    NodeName::new("n2").unwrap()
}

/// Options with millisecond backoff so failing tests stay fast.
pub fn fast_options() -> MigrationOptions {
    MigrationOptions {
        workers: 2,
        rpc_timeout: Duration::from_secs(5),
        checkpoint_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_millis(100),
        ready_poll_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        deadlines: StageDeadlines {
            capturing: Duration::from_secs(10),
            transferring: Duration::from_secs(10),
            restoring: Duration::from_secs(10),
            committing: Duration::from_secs(10),
            rolling_back: Duration::from_secs(10),
        },
    }
}
