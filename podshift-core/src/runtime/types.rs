//! CRI message shapes.
//!
//! Field names follow the protobuf JSON mapping used by `crictl -o json`, so
//! the same structs parse runtime output and serialize sandbox/container
//! configs. Unknown fields are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, SandboxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodSandboxState {
    #[serde(rename = "SANDBOX_READY")]
    Ready,
    #[serde(rename = "SANDBOX_NOTREADY")]
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    #[serde(rename = "CONTAINER_CREATED")]
    Created,
    #[serde(rename = "CONTAINER_RUNNING")]
    Running,
    #[serde(rename = "CONTAINER_EXITED")]
    Exited,
    #[serde(rename = "CONTAINER_UNKNOWN")]
    Unknown,
}

impl ContainerState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Exited => "Exited",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Entry of `ListPodSandbox`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandbox {
    pub id: SandboxId,
    #[serde(default)]
    pub metadata: PodSandboxMetadata,
    pub state: PodSandboxState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_handler: String,
}

/// Response of `PodSandboxStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxStatus {
    pub id: SandboxId,
    #[serde(default)]
    pub metadata: PodSandboxMetadata,
    pub state: PodSandboxState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_handler: String,
}

/// Entry of `ListContainers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: ContainerId,
    pub pod_sandbox_id: SandboxId,
    #[serde(default)]
    pub metadata: ContainerMetadata,
    #[serde(default)]
    pub image: ImageSpec,
    #[serde(default)]
    pub image_ref: String,
    pub state: ContainerState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Response of `ContainerStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub id: ContainerId,
    #[serde(default)]
    pub metadata: ContainerMetadata,
    pub state: ContainerState,
    #[serde(default)]
    pub image: Option<ImageSpec>,
    #[serde(default)]
    pub image_ref: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub log_path: String,
}

/// Response of `ImageStatus` when the image is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub repo_digests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_directory: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_path: String,
}

/// Filter for `ListPodSandbox`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxFilter {
    pub id: Option<String>,
    pub state: Option<PodSandboxState>,
    pub label_selector: BTreeMap<String, String>,
}

impl SandboxFilter {
    pub fn ready() -> Self {
        Self {
            state: Some(PodSandboxState::Ready),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label_selector.insert(key.into(), value.into());
        self
    }

    /// Client-side evaluation, for runtimes that cannot filter server-side.
    pub fn matches(&self, sandbox: &PodSandbox) -> bool {
        if let Some(id) = &self.id {
            if !sandbox.id.as_str().starts_with(id.as_str()) {
                return false;
            }
        }
        if let Some(state) = self.state {
            if sandbox.state != state {
                return false;
            }
        }
        self.label_selector
            .iter()
            .all(|(k, v)| sandbox.labels.get(k) == Some(v))
    }
}

/// Filter for `ListContainers`. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub pod_sandbox_id: Option<SandboxId>,
    pub state: Option<ContainerState>,
    pub label_selector: BTreeMap<String, String>,
}

impl ContainerFilter {
    pub fn in_sandbox(sandbox_id: &SandboxId) -> Self {
        Self {
            pod_sandbox_id: Some(sandbox_id.clone()),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label_selector.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, container: &Container) -> bool {
        if let Some(id) = &self.id {
            if !container.id.as_str().starts_with(id.as_str()) {
                return false;
            }
        }
        if let Some(sandbox) = &self.pod_sandbox_id {
            if &container.pod_sandbox_id != sandbox {
                return false;
            }
        }
        if let Some(state) = self.state {
            if container.state != state {
                return false;
            }
        }
        self.label_selector
            .iter()
            .all(|(k, v)| container.labels.get(k) == Some(v))
    }
}
