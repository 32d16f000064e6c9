//! Metadata store: the list of backups, schedule bookkeeping, and the active
//! retention policy, persisted as one JSON document under a single RW mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::RetentionPolicy;
use crate::error::{BackupError, Result};
use crate::fsutil::write_file_private;
use crate::types::Backup;

/// Filename of the metadata document inside the backup directory.
pub const METADATA_FILE: &str = "metadata.json";

/// On-disk shape of the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataDocument {
    backups: Vec<Backup>,
    last_scheduled: Option<DateTime<Utc>>,
    next_scheduled: Option<DateTime<Utc>>,
    retention_policy: RetentionPolicy,
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self {
            backups: Vec::new(),
            last_scheduled: None,
            next_scheduled: None,
            retention_policy: RetentionPolicy::default(),
        }
    }
}

/// Single-writer store for backup metadata.
///
/// Every mutation happens under the write half of one RW mutex and is
/// persisted before the lock is released; readers take the read half only.
/// The file is never mutated out-of-process.
pub struct MetadataStore {
    path: PathBuf,
    inner: RwLock<MetadataDocument>,
}

impl MetadataStore {
    /// Open the store at `<dir>/metadata.json`. A missing or unreadable file
    /// yields an empty store; the next save creates the file.
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(METADATA_FILE);
        let document = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<MetadataDocument>(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "unreadable backup metadata, starting from an empty store"
                    );
                    MetadataDocument::default()
                }
            },
            Err(_) => MetadataDocument::default(),
        };

        Self {
            path,
            inner: RwLock::new(document),
        }
    }

    /// Path of the persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, document: &MetadataDocument) -> Result<()> {
        let rendered = serde_json::to_vec_pretty(document)?;
        write_file_private(&self.path, &rendered)
    }

    /// Append a backup record.
    pub async fn add_backup(&self, backup: Backup) -> Result<()> {
        let mut doc = self.inner.write().await;
        doc.backups.push(backup);
        self.persist(&doc)
    }

    /// Replace the record with the same id.
    pub async fn update_backup(&self, backup: Backup) -> Result<()> {
        let mut doc = self.inner.write().await;
        let slot = doc
            .backups
            .iter_mut()
            .find(|b| b.id == backup.id)
            .ok_or_else(|| BackupError::NotFound(backup.id.clone()))?;
        *slot = backup;
        self.persist(&doc)
    }

    /// Remove one record, returning it.
    pub async fn remove_backup(&self, id: &str) -> Result<Backup> {
        let mut doc = self.inner.write().await;
        let index = doc
            .backups
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        let removed = doc.backups.remove(index);
        self.persist(&doc)?;
        Ok(removed)
    }

    /// Remove many records under one lock acquisition and one save. Unknown
    /// ids are skipped; the removed records are returned.
    pub async fn remove_backups(&self, ids: &[String]) -> Result<Vec<Backup>> {
        let mut doc = self.inner.write().await;
        let mut removed = Vec::new();
        doc.backups.retain(|b| {
            if ids.iter().any(|id| *id == b.id) {
                removed.push(b.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    /// Fetch one record by id.
    pub async fn get_backup(&self, id: &str) -> Result<Backup> {
        let doc = self.inner.read().await;
        doc.backups
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(id.to_string()))
    }

    /// Snapshot of every record.
    pub async fn backups(&self) -> Vec<Backup> {
        self.inner.read().await.backups.clone()
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.inner.read().await.backups.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.backups.is_empty()
    }

    /// Active retention policy.
    pub async fn retention_policy(&self) -> RetentionPolicy {
        self.inner.read().await.retention_policy.clone()
    }

    /// Swap the retention policy.
    pub async fn set_retention_policy(&self, policy: RetentionPolicy) -> Result<()> {
        let mut doc = self.inner.write().await;
        doc.retention_policy = policy;
        self.persist(&doc)
    }

    /// Scheduler bookkeeping: (last run, next planned run).
    pub async fn schedule_times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let doc = self.inner.read().await;
        (doc.last_scheduled, doc.next_scheduled)
    }

    /// Record the moment the last scheduled backup ran.
    pub async fn set_last_scheduled(&self, at: DateTime<Utc>) -> Result<()> {
        let mut doc = self.inner.write().await;
        doc.last_scheduled = Some(at);
        self.persist(&doc)
    }

    /// Record the next planned scheduler run.
    pub async fn set_next_scheduled(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        let mut doc = self.inner.write().await;
        doc.next_scheduled = at;
        self.persist(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackupTrigger, BackupType};

    fn backup(note: &str) -> Backup {
        Backup::new(BackupType::Database, BackupTrigger::Manual, note)
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path());
        let b = backup("first");
        let id = b.id.clone();
        store.add_backup(b).await.unwrap();

        let reopened = MetadataStore::open(dir.path());
        let loaded = reopened.get_backup(&id).await.unwrap();
        assert_eq!(loaded.notes, "first");
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path());
        let err = store.update_backup(backup("ghost")).await.unwrap_err();
        assert!(matches!(err, BackupError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_many_single_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path());
        let a = backup("a");
        let b = backup("b");
        let c = backup("c");
        let ids = vec![a.id.clone(), c.id.clone()];
        for x in [a, b, c] {
            store.add_backup(x).await.unwrap();
        }

        let removed = store.remove_backups(&ids).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), b"not json").unwrap();
        let store = MetadataStore::open(dir.path());
        assert!(store.is_empty().await);

        // A save overwrites the corrupt document.
        store.add_backup(backup("fresh")).await.unwrap();
        let reopened = MetadataStore::open(dir.path());
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_schedule_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path());
        let now = Utc::now();
        store.set_last_scheduled(now).await.unwrap();
        store.set_next_scheduled(Some(now)).await.unwrap();

        let (last, next) = store.schedule_times().await;
        assert_eq!(last, Some(now));
        assert_eq!(next, Some(now));
    }
}
