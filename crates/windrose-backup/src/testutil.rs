//! In-memory database stand-in and manager fixtures for unit tests.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use windrose_core::{AppConfig, AppVersion, CoreError, DatabaseAdapter, RecordCounts};

use crate::config::BackupConfig;
use crate::manager::BackupManager;

/// File-backed fake database: a real file on disk, adapter behavior in
/// memory.
pub struct TestDb {
    counts: RecordCounts,
    fail_checkpoint: bool,
}

impl TestDb {
    pub fn with_counts(playbacks: u64, geolocations: u64) -> Self {
        Self {
            counts: RecordCounts {
                playbacks,
                geolocations,
            },
            fail_checkpoint: false,
        }
    }

    pub fn failing_checkpoint(mut self) -> Self {
        self.fail_checkpoint = true;
        self
    }

    /// Materialize the database file under `dir` and wrap into an adapter.
    pub fn into_adapter(self, dir: &Path) -> Arc<dyn DatabaseAdapter> {
        let db_path = dir.join("windrose.duckdb");
        std::fs::write(&db_path, b"duckdb-test-image".repeat(64)).expect("write test database");
        Arc::new(TestDbAdapter {
            path: db_path.display().to_string(),
            counts: self.counts,
            fail_checkpoint: self.fail_checkpoint,
            closed: AtomicBool::new(false),
        })
    }
}

struct TestDbAdapter {
    path: String,
    counts: RecordCounts,
    fail_checkpoint: bool,
    closed: AtomicBool,
}

#[async_trait]
impl DatabaseAdapter for TestDbAdapter {
    fn database_path(&self) -> String {
        self.path.clone()
    }

    async fn record_counts(&self, _ctx: &CancellationToken) -> windrose_core::Result<RecordCounts> {
        Ok(self.counts)
    }

    async fn checkpoint(&self, _ctx: &CancellationToken) -> windrose_core::Result<()> {
        if self.fail_checkpoint {
            return Err(CoreError::Database("checkpoint refused".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> windrose_core::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A manager rooted in a fresh temp directory, with the fake database living
/// beside (not inside) the backup directory.
pub async fn manager_with_dir(db: TestDb) -> (tempfile::TempDir, BackupManager) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let adapter = db.into_adapter(dir.path());
    let config = BackupConfig::new(dir.path().join("backups"));
    let manager = BackupManager::new(
        config,
        AppConfig::default(),
        adapter,
        AppVersion("0.4.0-test".to_string()),
    )
    .expect("construct manager");
    (dir, manager)
}
