//! Typed status snapshots stored in a bundle.
//!
//! Runtime statuses are parsed into these records once, at capture time, and
//! validated there. Restore logic only ever sees the validated form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;
use crate::runtime::{ContainerState, ContainerStatus, PodSandboxStatus};
use crate::types::{ContainerId, PodRef, SandboxId};

/// Sandbox metadata needed to recreate the pod elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusSnapshot {
    pub sandbox_id: SandboxId,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_handler: String,
}

impl PodStatusSnapshot {
    pub fn from_status(status: &PodSandboxStatus) -> Result<Self, HardValidationError> {
        let context = format!("pod sandbox {}", status.id);
        require("metadata.name", &status.metadata.name, &context)?;
        require("metadata.namespace", &status.metadata.namespace, &context)?;
        require("metadata.uid", &status.metadata.uid, &context)?;

        Ok(Self {
            sandbox_id: status.id.clone(),
            name: status.metadata.name.clone(),
            namespace: status.metadata.namespace.clone(),
            uid: status.metadata.uid.clone(),
            attempt: status.metadata.attempt,
            labels: status.labels.clone(),
            annotations: status.annotations.clone(),
            runtime_handler: status.runtime_handler.clone(),
        })
    }

    pub fn pod_ref(&self) -> PodRef {
        PodRef {
            sandbox_id: self.sandbox_id.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Per-container metadata needed to recreate and restore the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatusSnapshot {
    pub container_id: ContainerId,
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
    /// Image as requested in the container spec.
    #[serde(default)]
    pub image: Option<String>,
    /// Image ID or digest the runtime resolved.
    #[serde(default)]
    pub image_id: Option<String>,
    pub state: ContainerState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub log_path: String,
}

impl ContainerStatusSnapshot {
    pub fn from_status(status: &ContainerStatus) -> Result<Self, HardValidationError> {
        require(
            "metadata.name",
            &status.metadata.name,
            &format!("container {}", status.id),
        )?;

        let image = status
            .image
            .as_ref()
            .map(|spec| spec.image.trim())
            .filter(|i| !i.is_empty())
            .map(str::to_string);

        let image_id = [status.image_id.trim(), status.image_ref.trim()]
            .into_iter()
            .find(|i| !i.is_empty())
            .map(str::to_string);

        Ok(Self {
            container_id: status.id.clone(),
            name: status.metadata.name.clone(),
            attempt: status.metadata.attempt,
            image,
            image_id,
            state: status.state,
            labels: status.labels.clone(),
            annotations: status.annotations.clone(),
            log_path: status.log_path.clone(),
        })
    }

    /// Explicit image first, then the resolved image ID.
    pub fn resolve_image(&self) -> Option<&str> {
        self.image.as_deref().or(self.image_id.as_deref())
    }
}

fn require(field: &'static str, value: &str, context: &str) -> Result<(), HardValidationError> {
    if value.trim().is_empty() {
        return Err(HardValidationError::MissingRequiredField {
            field,
            context: context.to_string(),
        });
    }
    Ok(())
}
