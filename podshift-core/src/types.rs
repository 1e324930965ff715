// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HardValidationError;

/// Maximum length of a runtime-assigned sandbox or container ID.
const MAX_RUNTIME_ID_LEN: usize = 128;
/// Maximum length of a node name (DNS name limit).
const MAX_NODE_NAME_LEN: usize = 253;

/// Identifier of one migration attempt. Always a UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId(String);

impl MigrationId {
    /// Create a new MigrationId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        match Uuid::parse_str(&id) {
            Ok(uuid) => Ok(Self(uuid.hyphenated().to_string())),
            Err(e) => Err(HardValidationError::InvalidFieldValue {
                field: "migration_id",
                value: id,
                reason: format!("Migration ID must be a UUID: {}", e),
            }),
        }
    }

    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines and default names.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MigrationId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.0
    }
}

/// Validated node name.
/// Lowercase alphanumerics, hyphens and dots; max 253 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(String);

impl NodeName {
    /// Create a new NodeName with validation.
    pub fn new(name: impl Into<String>) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > MAX_NODE_NAME_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "node",
                value: name.clone(),
                reason: format!("Node name must be 1-{} chars", MAX_NODE_NAME_LEN),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "node",
                value: name,
                reason: "Node name must contain only lowercase alphanumerics, '-' and '.'"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NodeName {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0
    }
}

/// Runtime IDs share one rule set: non-empty, ASCII alphanumeric plus '-'/'_',
/// at most 128 chars. They end up in file names inside the bundle, so path
/// separators are rejected here rather than at encode time.
fn validate_runtime_id(field: &'static str, id: &str) -> Result<(), HardValidationError> {
    if id.is_empty() || id.len() > MAX_RUNTIME_ID_LEN {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: id.to_string(),
            reason: format!("ID must be 1-{} chars", MAX_RUNTIME_ID_LEN),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: id.to_string(),
            reason: "ID must contain only ASCII alphanumerics, '-' and '_'".to_string(),
        });
    }

    Ok(())
}

/// Runtime-assigned pod sandbox ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        validate_runtime_id("sandbox_id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SandboxId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> Self {
        id.0
    }
}

/// Runtime-assigned container ID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        validate_runtime_id("container_id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Identifies a pod sandbox. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub sandbox_id: SandboxId,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl PodRef {
    /// `namespace/name`, the form operators recognise.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.sandbox_id.as_str();
        write!(
            f,
            "{}/{} ({})",
            self.namespace,
            self.name,
            &id[..id.len().min(13)]
        )
    }
}

/// A container belonging to a captured pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRef {
    pub container_id: ContainerId,
    pub pod: PodRef,
    pub image_ref: String,
}

/// How an operator names the pod to migrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PodSelector {
    /// Full sandbox ID or a unique prefix of one.
    SandboxId { id: String },
    /// Pod name, optionally restricted to a namespace.
    Name {
        namespace: Option<String>,
        name: String,
    },
    /// All labels must match.
    Labels { labels: BTreeMap<String, String> },
}

impl PodSelector {
    /// Parse the operator syntax:
    /// `id:<sandbox-id>`, `<namespace>/<name>`, `k=v[,k=v]` or `<name>`.
    pub fn parse(input: &str) -> Result<Self, HardValidationError> {
        let input = input.trim();
        let invalid = |reason: &str| HardValidationError::InvalidFieldValue {
            field: "pod_selector",
            value: input.to_string(),
            reason: reason.to_string(),
        };

        if input.is_empty() {
            return Err(invalid("Selector cannot be empty"));
        }

        if let Some(id) = input.strip_prefix("id:") {
            validate_runtime_id("pod_selector", id)?;
            return Ok(Self::SandboxId { id: id.to_string() });
        }

        if input.contains('=') {
            let mut labels = BTreeMap::new();
            for pair in input.split(',') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| invalid("Label selector entries must be key=value"))?;
                if key.trim().is_empty() {
                    return Err(invalid("Label key cannot be empty"));
                }
                labels.insert(key.trim().to_string(), value.trim().to_string());
            }
            return Ok(Self::Labels { labels });
        }

        match input.split_once('/') {
            Some((namespace, name)) => {
                if namespace.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid("Expected <namespace>/<name>"));
                }
                Ok(Self::Name {
                    namespace: Some(namespace.to_string()),
                    name: name.to_string(),
                })
            }
            None => Ok(Self::Name {
                namespace: None,
                name: input.to_string(),
            }),
        }
    }

    /// Whether this selector names a sandbox ID explicitly.
    pub fn is_explicit_id(&self) -> bool {
        matches!(self, Self::SandboxId { .. })
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SandboxId { id } => write!(f, "id:{}", id),
            Self::Name {
                namespace: Some(ns),
                name,
            } => write!(f, "{}/{}", ns, name),
            Self::Name {
                namespace: None,
                name,
            } => write!(f, "{}", name),
            Self::Labels { labels } => {
                let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}", pairs.join(","))
            }
        }
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod serde_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
