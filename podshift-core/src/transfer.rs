// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Transfer coordinator.
//!
//! Protocol, not plumbing: the coordinator computes a manifest of every
//! bundle file with its checksum, sends what the destination does not
//! already hold, and asks the destination to recompute all checksums and
//! return an HMAC-signed confirmation. Restore may only start once the
//! confirmation verifies and matches the manifest exactly.
//!
//! The byte transport is pluggable through [`Transport`]; the bundled
//! [`LocalDirTransport`] writes into a destination inbox mounted locally.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::bundle::{sync_dir, CheckpointBundle};
use crate::error::{HardValidationError, MigrationError, MigrationResult};
use crate::integrity::{self, FileDigest};
use crate::retry::RetryPolicy;
use crate::types::{MigrationId, NodeName};

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted confirmation key length in bytes.
const MIN_KEY_LEN: usize = 16;

/// One file of a bundle as seen by either side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEntry {
    pub name: String,
    pub size_bytes: u64,
    pub checksum: String,
}

impl TransferEntry {
    fn digest(&self) -> FileDigest {
        FileDigest {
            size_bytes: self.size_bytes,
            checksum: self.checksum.clone(),
        }
    }
}

/// Files and checksums the source intends the destination to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    pub migration_id: MigrationId,
    pub files: Vec<TransferEntry>,
}

impl TransferManifest {
    /// Hash every file of `bundle` under `dir`. Blocking.
    pub fn compute(bundle: &CheckpointBundle, dir: &Path) -> MigrationResult<Self> {
        let mut files = Vec::new();
        for name in bundle.file_names() {
            let path = dir.join(&name);
            let digest = integrity::digest_file(&path).map_err(|e| MigrationError::CorruptBundle {
                path: path.clone(),
                reason: format!("cannot hash for transfer: {}", e),
            })?;
            files.push(TransferEntry {
                name,
                size_bytes: digest.size_bytes,
                checksum: digest.checksum,
            });
        }
        Ok(Self {
            migration_id: bundle.migration_id.clone(),
            files,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Destination's signed statement of what it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferConfirmation {
    pub migration_id: MigrationId,
    pub node: NodeName,
    /// Digests recomputed by the destination, sorted by name.
    pub files: Vec<TransferEntry>,
    /// Whether the destination published the bundle.
    pub published: bool,
    /// Hex HMAC-SHA256 over the canonical form of the fields above.
    pub signature: String,
}

/// Shared secret used to sign and verify confirmations.
#[derive(Clone)]
pub struct ConfirmationKey {
    mac: HmacSha256,
}

impl ConfirmationKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, HardValidationError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_KEY_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "transfer.key",
                value: format!("<{} bytes>", bytes.len()),
                reason: format!("Confirmation key must be at least {} bytes", MIN_KEY_LEN),
            });
        }
        let mac = HmacSha256::new_from_slice(&bytes).map_err(|e| {
            HardValidationError::InvalidFieldValue {
                field: "transfer.key",
                value: format!("<{} bytes>", bytes.len()),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { mac })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, HardValidationError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| HardValidationError::InvalidFieldValue {
            field: "transfer.key",
            value: "<redacted>".to_string(),
            reason: format!("Key must be hex encoded: {}", e),
        })?;
        Self::new(bytes)
    }

    fn canonical(
        migration_id: &MigrationId,
        node: &NodeName,
        files: &[TransferEntry],
        published: bool,
    ) -> Vec<u8> {
        let mut out = format!("{}\n{}\n{}\n", migration_id, node, published);
        for f in files {
            out.push_str(&format!("{} {} {}\n", f.name, f.size_bytes, f.checksum));
        }
        out.into_bytes()
    }

    /// Build a signed confirmation. `files` is sorted by name first.
    pub fn sign(
        &self,
        migration_id: MigrationId,
        node: NodeName,
        mut files: Vec<TransferEntry>,
        published: bool,
    ) -> TransferConfirmation {
        files.sort();
        let mut mac = self.mac.clone();
        mac.update(&Self::canonical(&migration_id, &node, &files, published));
        TransferConfirmation {
            migration_id,
            node,
            files,
            published,
            signature: hex::encode(mac.finalize().into_bytes()),
        }
    }

    pub fn verify(&self, confirmation: &TransferConfirmation) -> bool {
        let Ok(signature) = hex::decode(&confirmation.signature) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(&Self::canonical(
            &confirmation.migration_id,
            &confirmation.node,
            &confirmation.files,
            confirmation.published,
        ));
        mac.verify_slice(&signature).is_ok()
    }
}

impl std::fmt::Debug for ConfirmationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfirmationKey(<redacted>)")
    }
}

/// Moves bundle files to one destination node.
#[async_trait]
pub trait Transport: Send + Sync {
    fn node(&self) -> &NodeName;

    /// Digest of `name` if the destination already holds it for this
    /// migration.
    async fn probe(&self, migration_id: &MigrationId, name: &str)
        -> MigrationResult<Option<FileDigest>>;

    async fn send_file(
        &self,
        migration_id: &MigrationId,
        name: &str,
        source: &Path,
    ) -> MigrationResult<()>;

    /// Recompute every checksum at the destination, publish the bundle if it
    /// matches `manifest`, and return a signed statement of what was found.
    async fn confirm(&self, manifest: &TransferManifest) -> MigrationResult<TransferConfirmation>;

    /// Remove everything received for this migration.
    async fn discard(&self, migration_id: &MigrationId) -> MigrationResult<()>;

    /// Published bundle directory as the destination runtime sees it.
    fn remote_bundle_dir(&self, migration_id: &MigrationId) -> PathBuf;
}

/// Limits for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Bound on probe calls.
    pub rpc_timeout: Duration,
    /// Bound on sending one file and on confirmation.
    pub bulk_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Drives the transfer protocol over a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransferCoordinator {
    key: ConfirmationKey,
}

impl TransferCoordinator {
    pub fn new(key: ConfirmationKey) -> Self {
        Self { key }
    }

    /// Transfer the bundle published at `bundle_dir` and return the verified
    /// confirmation. Files already present with a matching checksum are
    /// skipped, so a retry resumes where the last attempt stopped.
    pub async fn transfer(
        &self,
        bundle: &CheckpointBundle,
        bundle_dir: &Path,
        transport: &dyn Transport,
        limits: &TransferLimits,
    ) -> MigrationResult<TransferConfirmation> {
        let started = Instant::now();
        let migration_id = &bundle.migration_id;
        let node = transport.node().clone();

        let manifest = {
            let bundle = bundle.clone();
            let dir = bundle_dir.to_path_buf();
            tokio::task::spawn_blocking(move || TransferManifest::compute(&bundle, &dir))
                .await
                .map_err(|e| MigrationError::WorkerJoin {
                    stage: "Transferring",
                    reason: e.to_string(),
                })??
        };

        tracing::info!(
            migration_id = %migration_id,
            node = %node,
            files = manifest.files.len(),
            total_bytes = manifest.total_bytes(),
            "Starting transfer"
        );

        let mut sent = 0usize;
        for entry in &manifest.files {
            let present = limits
                .retry
                .call("ProbeFile", limits.rpc_timeout, || {
                    transport.probe(migration_id, &entry.name)
                })
                .await?;
            if present.as_ref() == Some(&entry.digest()) {
                tracing::debug!(migration_id = %migration_id, file = %entry.name, "Already at destination");
                continue;
            }

            let source = bundle_dir.join(&entry.name);
            limits
                .retry
                .call("SendFile", limits.bulk_timeout, || {
                    transport.send_file(migration_id, &entry.name, &source)
                })
                .await?;
            sent += 1;
        }

        let confirmation = limits
            .retry
            .call("ConfirmTransfer", limits.bulk_timeout, || transport.confirm(&manifest))
            .await?;
        self.check(&manifest, &node, &confirmation)?;

        tracing::info!(
            migration_id = %migration_id,
            node = %node,
            sent = sent,
            skipped = manifest.files.len() - sent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transfer confirmed"
        );
        Ok(confirmation)
    }

    /// Verify signature, identity and every digest of a confirmation.
    pub fn check(
        &self,
        manifest: &TransferManifest,
        node: &NodeName,
        confirmation: &TransferConfirmation,
    ) -> MigrationResult<()> {
        let incomplete = |reason: String| MigrationError::TransferIncomplete {
            node: node.to_string(),
            reason,
        };

        if !self.key.verify(confirmation) {
            return Err(incomplete("confirmation signature does not verify".to_string()));
        }
        if &confirmation.node != node || confirmation.migration_id != manifest.migration_id {
            return Err(incomplete(format!(
                "confirmation is for {} on {}",
                confirmation.migration_id, confirmation.node
            )));
        }

        let remote: BTreeMap<&str, &TransferEntry> = confirmation
            .files
            .iter()
            .map(|f| (f.name.as_str(), f))
            .collect();
        let mut problems = Vec::new();
        for expected in &manifest.files {
            match remote.get(expected.name.as_str()) {
                None => problems.push(format!("{} missing", expected.name)),
                Some(actual) if actual.checksum != expected.checksum => problems.push(format!(
                    "{} checksum {} != {}",
                    expected.name, actual.checksum, expected.checksum
                )),
                Some(actual) if actual.size_bytes != expected.size_bytes => problems.push(format!(
                    "{} size {} != {}",
                    expected.name, actual.size_bytes, expected.size_bytes
                )),
                Some(_) => {}
            }
        }
        if !problems.is_empty() {
            return Err(incomplete(problems.join("; ")));
        }
        if !confirmation.published {
            return Err(incomplete("destination did not publish the bundle".to_string()));
        }
        Ok(())
    }
}

/// Transport into a destination inbox reachable as a local directory, such
/// as a shared mount.
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    node: NodeName,
    inbox: PathBuf,
    remote_inbox: PathBuf,
    key: ConfirmationKey,
}

impl LocalDirTransport {
    /// `inbox` is where this process writes; `remote_inbox` is the same
    /// directory as the destination runtime sees it.
    pub fn new(
        node: NodeName,
        inbox: impl Into<PathBuf>,
        remote_inbox: impl Into<PathBuf>,
        key: ConfirmationKey,
    ) -> Self {
        Self {
            node,
            inbox: inbox.into(),
            remote_inbox: remote_inbox.into(),
            key,
        }
    }

    fn incoming_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.inbox.join(format!(".{}.incoming", migration_id))
    }

    fn published_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.inbox.join(migration_id.as_str())
    }

    fn transport_error(&self, reason: impl Into<String>) -> MigrationError {
        MigrationError::Transport {
            node: self.node.to_string(),
            reason: reason.into(),
        }
    }

    fn check_name(&self, name: &str) -> MigrationResult<()> {
        if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains('\\') {
            return Err(MigrationError::HardValidation(
                HardValidationError::InvalidFieldValue {
                    field: "transfer.file",
                    value: name.to_string(),
                    reason: "File name must be a plain bundle entry".to_string(),
                },
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalDirTransport {
    fn node(&self) -> &NodeName {
        &self.node
    }

    async fn probe(
        &self,
        migration_id: &MigrationId,
        name: &str,
    ) -> MigrationResult<Option<FileDigest>> {
        self.check_name(name)?;
        let candidates = [
            self.published_dir(migration_id).join(name),
            self.incoming_dir(migration_id).join(name),
        ];

        tokio::task::spawn_blocking(move || {
            for path in candidates {
                match integrity::digest_file(&path) {
                    Ok(digest) => return Ok(Some(digest)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(MigrationError::io("probing transferred file", e)),
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| self.transport_error(e.to_string()))?
    }

    async fn send_file(
        &self,
        migration_id: &MigrationId,
        name: &str,
        source: &Path,
    ) -> MigrationResult<()> {
        self.check_name(name)?;
        let incoming = self.incoming_dir(migration_id);
        tokio::fs::create_dir_all(&incoming)
            .await
            .map_err(|e| self.transport_error(format!("cannot create inbox: {}", e)))?;

        // Copy under a hidden name so an interrupted copy never looks complete
        let partial = incoming.join(format!(".{}.part", name));
        tokio::fs::copy(source, &partial)
            .await
            .map_err(|e| self.transport_error(format!("copying {}: {}", name, e)))?;
        tokio::fs::rename(&partial, incoming.join(name))
            .await
            .map_err(|e| self.transport_error(format!("finalizing {}: {}", name, e)))?;

        tracing::debug!(migration_id = %migration_id, node = %self.node, file = name, "File sent");
        Ok(())
    }

    async fn confirm(&self, manifest: &TransferManifest) -> MigrationResult<TransferConfirmation> {
        for entry in &manifest.files {
            self.check_name(&entry.name)?;
        }

        let incoming = self.incoming_dir(&manifest.migration_id);
        let published = self.published_dir(&manifest.migration_id);
        let manifest = manifest.clone();
        let node = self.node.clone();
        let key = self.key.clone();

        tokio::task::spawn_blocking(move || {
            let dir = if incoming.is_dir() { &incoming } else { &published };

            let mut found = Vec::new();
            let mut complete = true;
            for entry in &manifest.files {
                match integrity::digest_file(&dir.join(&entry.name)) {
                    Ok(digest) => {
                        complete &= digest == entry.digest();
                        found.push(TransferEntry {
                            name: entry.name.clone(),
                            size_bytes: digest.size_bytes,
                            checksum: digest.checksum,
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => complete = false,
                    Err(e) => return Err(MigrationError::io("verifying transferred file", e)),
                }
            }

            let mut is_published = dir == &published;
            if complete && !is_published {
                if published.exists() {
                    std::fs::remove_dir_all(&published)
                        .map_err(|e| MigrationError::io("replacing received bundle", e))?;
                }
                std::fs::rename(&incoming, &published)
                    .map_err(|e| MigrationError::io("publishing received bundle", e))?;
                if let Some(parent) = published.parent() {
                    sync_dir(parent)?;
                }
                is_published = true;
            }

            Ok(key.sign(manifest.migration_id, node, found, complete && is_published))
        })
        .await
        .map_err(|e| self.transport_error(e.to_string()))?
    }

    async fn discard(&self, migration_id: &MigrationId) -> MigrationResult<()> {
        for dir in [self.incoming_dir(migration_id), self.published_dir(migration_id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.transport_error(format!("discarding {}: {}", dir.display(), e))),
            }
        }
        tracing::info!(migration_id = %migration_id, node = %self.node, "Discarded transferred bundle");
        Ok(())
    }

    fn remote_bundle_dir(&self, migration_id: &MigrationId) -> PathBuf {
        self.remote_inbox.join(migration_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConfirmationKey {
        ConfirmationKey::new(b"0123456789abcdef0123".to_vec()).unwrap()
    }

    fn entry(name: &str, data: &[u8]) -> TransferEntry {
        TransferEntry {
            name: name.to_string(),
            size_bytes: data.len() as u64,
            checksum: integrity::checksum_bytes(data),
        }
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(ConfirmationKey::new(b"short".to_vec()).is_err());
        assert!(ConfirmationKey::from_hex("zz").is_err());
        assert!(ConfirmationKey::from_hex(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let k = key();
        let id = MigrationId::generate();
        let node = NodeName::new("n2").unwrap();
        let mut conf = k.sign(id, node, vec![entry("c1.tar", b"abc")], true);
        assert!(k.verify(&conf));

        conf.files[0].checksum = integrity::checksum_bytes(b"abd");
        assert!(!k.verify(&conf));

        let other = ConfirmationKey::new(b"another-key-entirely".to_vec()).unwrap();
        let conf = k.sign(MigrationId::generate(), NodeName::new("n2").unwrap(), vec![], true);
        assert!(!other.verify(&conf));
    }

    #[test]
    fn test_check_reports_mismatched_file() {
        let k = key();
        let coordinator = TransferCoordinator::new(k.clone());
        let node = NodeName::new("n2").unwrap();
        let manifest = TransferManifest {
            migration_id: MigrationId::generate(),
            files: vec![entry("c1.tar", b"one"), entry("c2.tar", b"two")],
        };

        let good = k.sign(manifest.migration_id.clone(), node.clone(), manifest.files.clone(), true);
        coordinator.check(&manifest, &node, &good).unwrap();

        let bad = k.sign(
            manifest.migration_id.clone(),
            node.clone(),
            vec![entry("c1.tar", b"one"), entry("c2.tar", b"tw0")],
            false,
        );
        match coordinator.check(&manifest, &node, &bad) {
            Err(MigrationError::TransferIncomplete { reason, .. }) => {
                assert!(reason.contains("c2.tar"));
                assert!(!reason.contains("c1.tar"));
            }
            other => panic!("expected TransferIncomplete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_transport_publishes_on_confirm() {
        let src = tempfile::tempdir().unwrap();
        let inbox = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("c1.tar"), b"state").unwrap();

        let transport = LocalDirTransport::new(
            NodeName::new("n2").unwrap(),
            inbox.path(),
            "/remote/inbox",
            key(),
        );
        let id = MigrationId::generate();
        let manifest = TransferManifest {
            migration_id: id.clone(),
            files: vec![entry("c1.tar", b"state")],
        };

        assert_eq!(transport.probe(&id, "c1.tar").await.unwrap(), None);
        transport
            .send_file(&id, "c1.tar", &src.path().join("c1.tar"))
            .await
            .unwrap();
        assert!(transport.probe(&id, "c1.tar").await.unwrap().is_some());

        let confirmation = transport.confirm(&manifest).await.unwrap();
        assert!(confirmation.published);
        assert!(inbox.path().join(id.as_str()).join("c1.tar").is_file());
        assert_eq!(
            transport.remote_bundle_dir(&id),
            PathBuf::from("/remote/inbox").join(id.as_str())
        );

        // Confirming again re-verifies the published copy
        let again = transport.confirm(&manifest).await.unwrap();
        assert!(again.published);

        transport.discard(&id).await.unwrap();
        assert!(!inbox.path().join(id.as_str()).exists());
    }

    #[tokio::test]
    async fn test_local_transport_rejects_path_escape() {
        let inbox = tempfile::tempdir().unwrap();
        let transport = LocalDirTransport::new(
            NodeName::new("n2").unwrap(),
            inbox.path(),
            inbox.path(),
            key(),
        );
        let id = MigrationId::generate();
        assert!(transport.probe(&id, "../etc/passwd").await.is_err());
    }
}
