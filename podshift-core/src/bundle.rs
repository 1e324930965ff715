// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint bundle codec.
//!
//! On-disk layout of a published bundle `<root>/<migration-id>/`:
//!
//! ```text
//! manifest.json                 format version, pod snapshot, ordered entries
//! <container-id>.tar            checkpoint archive written by the runtime
//! <container-id>.status.json    container status snapshot
//! ```
//!
//! Bundles are assembled in `<root>/.<migration-id>.partial/` and renamed into
//! place only when complete, so readers never observe a half-written bundle.
//! Decode recomputes every checksum; any mismatch is `CorruptBundle`.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, MigrationResult};
use crate::integrity::{self, FileDigest};
use crate::snapshot::{ContainerStatusSnapshot, PodStatusSnapshot};
use crate::types::{ContainerId, MigrationId, NodeName};

/// Current bundle format. Decode rejects anything newer.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the manifest file inside a bundle directory.
pub const MANIFEST_FILE: &str = "manifest.json";

const STAGING_SUFFIX: &str = ".partial";

/// Opaque process-state archive produced by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointArtifact {
    pub container_id: ContainerId,
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
}

/// One container of a bundle: its status snapshot and its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    pub status: ContainerStatusSnapshot,
    pub artifact: CheckpointArtifact,
}

/// The unit of migration. Always complete: every entry has a present,
/// checksum-valid artifact and a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBundle {
    pub format_version: u32,
    pub migration_id: MigrationId,
    pub source_node: NodeName,
    pub created_at: DateTime<Utc>,
    pub pod: PodStatusSnapshot,
    pub containers: Vec<BundleEntry>,
}

impl CheckpointBundle {
    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.containers
            .iter()
            .map(|e| e.artifact.container_id.clone())
            .collect()
    }

    /// The same bundle with artifact paths re-rooted at `dir`, e.g. the
    /// directory the destination runtime sees after transfer.
    pub fn relocated(&self, dir: &Path) -> Self {
        let mut bundle = self.clone();
        for entry in &mut bundle.containers {
            entry.artifact.archive_path = dir.join(archive_name(&entry.artifact.container_id));
        }
        bundle
    }

    /// Relative names of every file making up the bundle, manifest last.
    pub fn file_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.containers.len() * 2 + 1);
        for entry in &self.containers {
            names.push(archive_name(&entry.artifact.container_id));
            names.push(status_name(&entry.artifact.container_id));
        }
        names.push(MANIFEST_FILE.to_string());
        names
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format_version: u32,
    migration_id: MigrationId,
    source_node: NodeName,
    created_at: DateTime<Utc>,
    pod: PodStatusSnapshot,
    containers: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    container_id: ContainerId,
    archive: String,
    status: String,
    size_bytes: u64,
    checksum: String,
    status_checksum: String,
}

/// Parsed before the full manifest so future layouts fail cleanly.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    format_version: u32,
}

pub fn archive_name(container_id: &ContainerId) -> String {
    format!("{}.tar", container_id)
}

pub fn status_name(container_id: &ContainerId) -> String {
    format!("{}.status.json", container_id)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> MigrationError {
    MigrationError::CorruptBundle {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Reads and writes bundles under one root directory.
#[derive(Debug, Clone)]
pub struct BundleCodec {
    root: PathBuf,
}

impl BundleCodec {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Published location of a migration's bundle.
    pub fn bundle_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.root.join(migration_id.as_str())
    }

    /// Private assembly location of a migration's bundle.
    pub fn staging_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.root
            .join(format!(".{}{}", migration_id, STAGING_SUFFIX))
    }

    /// Whether a published bundle exists for this migration.
    pub fn is_published(&self, migration_id: &MigrationId) -> bool {
        self.bundle_dir(migration_id).join(MANIFEST_FILE).is_file()
    }

    /// Create an empty staging directory, discarding leftovers of an earlier
    /// failed attempt.
    pub fn prepare_staging(&self, migration_id: &MigrationId) -> MigrationResult<PathBuf> {
        let staging = self.staging_dir(migration_id);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)
                .map_err(|e| MigrationError::io("clearing bundle staging dir", e))?;
        }
        std::fs::create_dir_all(&staging)
            .map_err(|e| MigrationError::io("creating bundle staging dir", e))?;
        Ok(staging)
    }

    /// Write `bundle` and atomically publish it. Returns the published path.
    ///
    /// Artifacts outside the staging directory are copied in; every artifact
    /// is re-hashed so a corrupt archive is never published.
    pub fn encode(&self, bundle: &CheckpointBundle) -> MigrationResult<PathBuf> {
        if bundle.containers.is_empty() {
            return Err(MigrationError::EmptyPod {
                pod: bundle.pod.pod_ref().qualified_name(),
            });
        }

        std::fs::create_dir_all(&self.root)
            .map_err(|e| MigrationError::io("creating bundle root", e))?;
        let staging = self.staging_dir(&bundle.migration_id);
        std::fs::create_dir_all(&staging)
            .map_err(|e| MigrationError::io("creating bundle staging dir", e))?;

        let mut entries = Vec::with_capacity(bundle.containers.len());
        let mut seen = HashSet::new();

        for entry in &bundle.containers {
            let id = &entry.artifact.container_id;
            if !seen.insert(id.clone()) {
                return Err(corrupt(&staging, format!("duplicate container {}", id)));
            }

            let archive = archive_name(id);
            let target = staging.join(&archive);
            if entry.artifact.archive_path != target {
                std::fs::copy(&entry.artifact.archive_path, &target)
                    .map_err(|e| MigrationError::io("copying checkpoint archive", e))?;
            }

            let digest = integrity::digest_file(&target)
                .map_err(|e| corrupt(&target, format!("unreadable archive: {}", e)))?;
            if digest.checksum != entry.artifact.checksum {
                return Err(corrupt(
                    &target,
                    format!(
                        "archive checksum {} does not match captured {}",
                        digest.checksum, entry.artifact.checksum
                    ),
                ));
            }
            sync_file(&target)?;

            let status = status_name(id);
            let status_json = serde_json::to_vec_pretty(&entry.status)
                .map_err(|e| corrupt(&staging, format!("cannot serialize status: {}", e)))?;
            write_synced(&staging.join(&status), &status_json)?;

            entries.push(ManifestEntry {
                container_id: id.clone(),
                archive,
                status,
                size_bytes: digest.size_bytes,
                checksum: digest.checksum,
                status_checksum: integrity::checksum_bytes(&status_json),
            });
        }

        let manifest = Manifest {
            format_version: bundle.format_version,
            migration_id: bundle.migration_id.clone(),
            source_node: bundle.source_node.clone(),
            created_at: bundle.created_at,
            pod: bundle.pod.clone(),
            containers: entries,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| corrupt(&staging, format!("cannot serialize manifest: {}", e)))?;
        write_synced(&staging.join(MANIFEST_FILE), &manifest_json)?;
        sync_dir(&staging)?;

        let published = self.bundle_dir(&bundle.migration_id);
        if published.exists() {
            std::fs::remove_dir_all(&published)
                .map_err(|e| MigrationError::io("replacing published bundle", e))?;
        }
        std::fs::rename(&staging, &published)
            .map_err(|e| MigrationError::io("publishing bundle", e))?;
        sync_dir(&self.root)?;

        tracing::info!(
            migration_id = %bundle.migration_id,
            path = %published.display(),
            containers = manifest.containers.len(),
            "Bundle published"
        );

        Ok(published)
    }

    /// Read a published bundle directory, verifying every file.
    pub fn decode(path: &Path) -> MigrationResult<CheckpointBundle> {
        let manifest_path = path.join(MANIFEST_FILE);
        let raw = std::fs::read(&manifest_path)
            .map_err(|e| corrupt(path, format!("cannot read {}: {}", MANIFEST_FILE, e)))?;

        let probe: VersionProbe = serde_json::from_slice(&raw)
            .map_err(|e| corrupt(path, format!("manifest has no format version: {}", e)))?;
        if probe.format_version == 0 || probe.format_version > FORMAT_VERSION {
            return Err(MigrationError::UnsupportedVersion {
                found: probe.format_version,
                supported: FORMAT_VERSION,
            });
        }

        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| corrupt(path, format!("invalid manifest: {}", e)))?;

        if manifest.containers.is_empty() {
            return Err(corrupt(path, "manifest lists no containers"));
        }

        let mut seen = HashSet::new();
        let mut containers = Vec::with_capacity(manifest.containers.len());

        for entry in manifest.containers {
            let id = &entry.container_id;
            if !seen.insert(id.clone()) {
                return Err(corrupt(path, format!("duplicate container {}", id)));
            }
            if entry.archive != archive_name(id) || entry.status != status_name(id) {
                return Err(corrupt(
                    path,
                    format!("unexpected file names for container {}", id),
                ));
            }

            let archive_path = path.join(&entry.archive);
            let digest: FileDigest = integrity::digest_file(&archive_path)
                .map_err(|e| corrupt(&archive_path, format!("missing archive: {}", e)))?;
            if digest.size_bytes != entry.size_bytes {
                return Err(corrupt(
                    &archive_path,
                    format!(
                        "size {} does not match manifest {}",
                        digest.size_bytes, entry.size_bytes
                    ),
                ));
            }
            if digest.checksum != entry.checksum {
                return Err(corrupt(
                    &archive_path,
                    format!(
                        "checksum {} does not match manifest {}",
                        digest.checksum, entry.checksum
                    ),
                ));
            }

            let status_path = path.join(&entry.status);
            let status_raw = std::fs::read(&status_path)
                .map_err(|e| corrupt(&status_path, format!("missing status: {}", e)))?;
            if integrity::checksum_bytes(&status_raw) != entry.status_checksum {
                return Err(corrupt(&status_path, "status checksum mismatch"));
            }
            let status: ContainerStatusSnapshot = serde_json::from_slice(&status_raw)
                .map_err(|e| corrupt(&status_path, format!("invalid status: {}", e)))?;
            if &status.container_id != id {
                return Err(corrupt(
                    &status_path,
                    format!("status belongs to {}, expected {}", status.container_id, id),
                ));
            }

            containers.push(BundleEntry {
                status,
                artifact: CheckpointArtifact {
                    container_id: id.clone(),
                    archive_path,
                    size_bytes: digest.size_bytes,
                    checksum: digest.checksum,
                },
            });
        }

        Ok(CheckpointBundle {
            format_version: manifest.format_version,
            migration_id: manifest.migration_id,
            source_node: manifest.source_node,
            created_at: manifest.created_at,
            pod: manifest.pod,
            containers,
        })
    }

    /// Remove published and staged data for a migration.
    pub fn discard(&self, migration_id: &MigrationId) -> MigrationResult<()> {
        for dir in [self.bundle_dir(migration_id), self.staging_dir(migration_id)] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .map_err(|e| MigrationError::io("discarding bundle", e))?;
            }
        }
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> MigrationResult<()> {
    let mut file = File::create(path).map_err(|e| MigrationError::io("creating bundle file", e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| MigrationError::io("writing bundle file", e))
}

fn sync_file(path: &Path) -> MigrationResult<()> {
    File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(|e| MigrationError::io("syncing bundle file", e))
}

pub(crate) fn sync_dir(path: &Path) -> MigrationResult<()> {
    File::open(path)
        .and_then(|d| d.sync_all())
        .map_err(|e| MigrationError::io("syncing directory", e))
}
