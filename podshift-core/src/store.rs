// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! File-backed migration record store.
//!
//! One JSON file per migration under the state directory, each sealed with a
//! CRC32 trailer. Writes go to a hidden temp file which is fsynced and renamed
//! over the record, so a crash leaves either the old or the new record, never
//! a torn one.

use std::fs::{self, File};
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::bundle::{sync_dir, BundleCodec};
use crate::error::{MigrationError, MigrationResult};
use crate::integrity;
use crate::record::MigrationRecord;
use crate::types::{MigrationId, SandboxId};

const RECORD_EXT: &str = "json";

/// Every record file in the state directory, damaged ones set aside.
#[derive(Debug, Default)]
pub struct RecordScan {
    /// Readable records, oldest first.
    pub records: Vec<MigrationRecord>,
    /// Files that failed their checksum or did not parse, with the reason.
    pub corrupt: Vec<(PathBuf, String)>,
}

/// Run `f` holding the shard lock for `key`, then drop the key so the map
/// only ever holds keys that are currently locked.
fn with_lock<K, T>(locks: &DashMap<K, ()>, key: &K, f: impl FnOnce() -> T) -> T
where
    K: Eq + Hash + Clone,
{
    let guard = locks.entry(key.clone()).or_default();
    let result = f();
    drop(guard);
    locks.remove(key);
    result
}

/// Durable `MigrationRecord` store keyed by migration ID.
#[derive(Debug)]
pub struct MigrationStore {
    dir: PathBuf,
    /// Serialises `create` per source pod within this process.
    pod_locks: DashMap<SandboxId, ()>,
    /// Serialises read-modify-write of a single record.
    record_locks: DashMap<MigrationId, ()>,
}

impl MigrationStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> MigrationResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| MigrationError::io("creating state dir", e))?;
        Ok(Self {
            dir,
            pod_locks: DashMap::new(),
            record_locks: DashMap::new(),
        })
    }

    pub fn open_shared(dir: impl Into<PathBuf>) -> MigrationResult<Arc<Self>> {
        Self::open(dir).map(Arc::new)
    }

    fn record_path(&self, id: &MigrationId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXT))
    }

    /// Persist a new record. Fails with `MigrationInProgress` if the pod
    /// already has a non-terminal migration.
    ///
    /// Damaged record files are logged and skipped so one of them cannot
    /// block every new migration.
    pub fn create(&self, record: &MigrationRecord) -> MigrationResult<()> {
        with_lock(&self.pod_locks, &record.pod.sandbox_id, || {
            let scan = self.scan()?;
            for (path, reason) in &scan.corrupt {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Skipping corrupt migration record; remove it once inspected"
                );
            }
            if let Some(existing) = scan
                .records
                .into_iter()
                .find(|r| r.pod.sandbox_id == record.pod.sandbox_id && !r.is_terminal())
            {
                return Err(MigrationError::MigrationInProgress {
                    pod: record.pod.qualified_name(),
                    migration_id: existing.migration_id,
                });
            }

            with_lock(&self.record_locks, &record.migration_id, || self.write(record))
        })?;

        tracing::info!(
            migration_id = %record.migration_id,
            pod = %record.pod,
            destination = %record.destination_node,
            "Migration record created"
        );
        Ok(())
    }

    pub fn load(&self, id: &MigrationId) -> MigrationResult<MigrationRecord> {
        self.read(&self.record_path(id))?
            .ok_or_else(|| MigrationError::RecordNotFound(id.clone()))
    }

    /// Persist `record`. A cancellation requested concurrently through
    /// [`MigrationStore::request_cancel`] is merged into `record`, never lost.
    pub fn save(&self, record: &mut MigrationRecord) -> MigrationResult<()> {
        let id = record.migration_id.clone();
        with_lock(&self.record_locks, &id, || {
            if let Some(on_disk) = self.read(&self.record_path(&id))? {
                record.cancel_requested |= on_disk.cancel_requested;
            }
            record.updated_at = Utc::now();
            self.write(record)
        })
    }

    /// All records, oldest first. Fails on the first damaged record file.
    pub fn list(&self) -> MigrationResult<Vec<MigrationRecord>> {
        let mut scan = self.scan()?;
        if !scan.corrupt.is_empty() {
            let (path, reason) = scan.corrupt.swap_remove(0);
            return Err(MigrationError::CorruptRecord { path, reason });
        }
        Ok(scan.records)
    }

    /// Read every record file, setting damaged ones aside instead of failing.
    pub fn scan(&self) -> MigrationResult<RecordScan> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| MigrationError::io("listing state dir", e))?;

        let mut scan = RecordScan::default();
        for entry in entries {
            let path = entry
                .map_err(|e| MigrationError::io("listing state dir", e))?
                .path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true);
            if !is_record {
                continue;
            }
            match self.read(&path) {
                Ok(Some(record)) => scan.records.push(record),
                Ok(None) => {}
                Err(MigrationError::CorruptRecord { path, reason }) => {
                    scan.corrupt.push((path, reason))
                }
                Err(e) => return Err(e),
            }
        }

        scan.records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        scan.corrupt.sort();
        Ok(scan)
    }

    /// Ask the driver of `id` to stop. Refused unless the migration is in a
    /// cancellable state.
    pub fn request_cancel(&self, id: &MigrationId) -> MigrationResult<MigrationRecord> {
        with_lock(&self.record_locks, id, || self.mark_cancelled(id))
    }

    fn mark_cancelled(&self, id: &MigrationId) -> MigrationResult<MigrationRecord> {
        let mut record = self.load(id)?;
        if !record.state.is_cancellable() {
            return Err(MigrationError::CancelRefused {
                migration_id: id.clone(),
                state: record.state.name(),
            });
        }

        record.cancel_requested = true;
        record.updated_at = Utc::now();
        self.write(&record)?;

        tracing::info!(migration_id = %id, state = %record.state, "Cancellation requested");
        Ok(record)
    }

    pub fn is_cancel_requested(&self, id: &MigrationId) -> MigrationResult<bool> {
        Ok(self.load(id)?.cancel_requested)
    }

    /// Purge a terminal record together with its local bundle.
    pub fn acknowledge(
        &self,
        id: &MigrationId,
        codec: &BundleCodec,
    ) -> MigrationResult<MigrationRecord> {
        with_lock(&self.record_locks, id, || self.purge(id, codec))
    }

    fn purge(&self, id: &MigrationId, codec: &BundleCodec) -> MigrationResult<MigrationRecord> {
        let record = self.load(id)?;
        if !record.is_terminal() {
            return Err(MigrationError::NotTerminal {
                migration_id: id.clone(),
                state: record.state.name(),
            });
        }

        codec.discard(id)?;
        fs::remove_file(self.record_path(id))
            .map_err(|e| MigrationError::io("removing migration record", e))?;
        sync_dir(&self.dir)?;

        tracing::info!(migration_id = %id, state = %record.state, "Migration acknowledged");
        Ok(record)
    }

    fn read(&self, path: &Path) -> MigrationResult<Option<MigrationRecord>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MigrationError::io("reading migration record", e)),
        };

        let corrupt = |reason: String| MigrationError::CorruptRecord {
            path: path.to_path_buf(),
            reason,
        };
        let payload = integrity::unseal_record(&raw).map_err(corrupt)?;
        let record = serde_json::from_slice(payload).map_err(|e| corrupt(e.to_string()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &MigrationRecord) -> MigrationResult<()> {
        let payload = serde_json::to_vec_pretty(record).map_err(|e| MigrationError::CorruptRecord {
            path: self.record_path(&record.migration_id),
            reason: format!("cannot serialize: {}", e),
        })?;
        let sealed = integrity::seal_record(&payload);

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.migration_id, RECORD_EXT));
        {
            let mut file =
                File::create(&tmp).map_err(|e| MigrationError::io("creating record temp file", e))?;
            file.write_all(&sealed)
                .and_then(|_| file.sync_all())
                .map_err(|e| MigrationError::io("writing migration record", e))?;
        }
        fs::rename(&tmp, self.record_path(&record.migration_id))
            .map_err(|e| MigrationError::io("publishing migration record", e))?;
        sync_dir(&self.dir)?;

        tracing::debug!(
            migration_id = %record.migration_id,
            state = %record.state,
            "Migration record saved"
        );
        Ok(())
    }
}
