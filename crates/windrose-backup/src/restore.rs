//! Restore engine: validated extraction to a temp directory, atomic
//! replacement of the live database, config recovery, and the post-restore
//! integrity probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::{self, CONFIG_DIR, CONFIG_ENTRY, DATABASE_DIR};
use crate::error::{BackupError, Result};
use crate::fsutil::{copy_file, extract_file, safe_join};
use crate::manager::BackupManager;
use crate::types::{BackupTrigger, BackupType};

/// Filename the recovered configuration is written to, next to the archives.
/// The live configuration is environment-driven and never overwritten.
pub const RESTORED_CONFIG_FILE: &str = "restored-config.json";

/// Tables every healthy database carries.
const CORE_TABLES: [&str; 2] = ["playbacks", "geolocations"];

/// Fraction of the declared record count the probe insists on.
const PROBE_COUNT_THRESHOLD: f64 = 0.95;

/// Knobs for one restore run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Skip pre-restore validation.
    pub force_restore: bool,

    /// Validate and stop; nothing is touched.
    pub validate_only: bool,

    /// Take a Full backup before touching anything.
    pub create_pre_restore_backup: bool,

    /// Probe the database after restoring it.
    pub verify_after_restore: bool,

    /// Override the component selection implied by the backup type.
    pub restore_database: Option<bool>,
    pub restore_config: Option<bool>,
}

/// Outcome of one restore run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub backup_id: String,
    pub pre_restore_backup_id: Option<String>,
    pub database_restored: bool,
    pub config_restored: bool,

    /// Records the restored database is expected to hold.
    pub records_restored: u64,

    /// True whenever the database component was replaced.
    pub restart_required: bool,

    pub warnings: Vec<String>,
    pub error: Option<String>,
}

/// Read-only view of a restored database, opened by a [`ProbeFactory`].
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    /// Confirm the database answers at all.
    async fn ping(&self) -> Result<()>;

    /// Table names visible in the schema catalog.
    async fn table_names(&self) -> Result<Vec<String>>;

    /// Row count of one table.
    async fn count_rows(&self, table: &str) -> Result<u64>;
}

/// Opens read-only probes against database files. Injected so the engine
/// stays decoupled from the database driver.
pub trait ProbeFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn DatabaseProbe>>;
}

impl BackupManager {
    /// Register the probe factory used by `verify_after_restore`.
    pub fn with_probe_factory(mut self, factory: Arc<dyn ProbeFactory>) -> Self {
        self.probe_factory = Some(factory);
        self
    }

    /// Restore a backup. Validation failures (when validation is requested)
    /// and database copy failures are fatal; everything else accumulates in
    /// `warnings`.
    pub async fn restore_backup(
        &self,
        ctx: &CancellationToken,
        id: &str,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let backup = self.store.get_backup(id).await?;
        let mut result = RestoreResult {
            backup_id: backup.id.clone(),
            ..RestoreResult::default()
        };

        if !options.force_restore {
            let validation = self.validate_backup(id).await?;
            if !validation.valid {
                return Err(BackupError::ValidationFailed(format!(
                    "backup {} failed validation: {}",
                    id,
                    validation.errors.join("; ")
                )));
            }
        }

        if options.validate_only {
            result.success = true;
            return Ok(result);
        }

        if options.create_pre_restore_backup {
            match self
                .create_backup(
                    ctx,
                    BackupType::Full,
                    BackupTrigger::PreRestore,
                    "Pre-restore safety backup",
                )
                .await
            {
                Ok(pre) => result.pre_restore_backup_id = Some(pre.id),
                Err(err) => result
                    .warnings
                    .push(format!("pre-restore backup failed: {}", err)),
            }
        }

        if let Some(hook) = &self.on_restore_start {
            hook(&backup);
        }

        // Component selection: defaults flow from the backup type, explicit
        // options override.
        let restore_db = options
            .restore_database
            .unwrap_or_else(|| backup.backup_type.includes_database());
        let restore_config = options
            .restore_config
            .unwrap_or_else(|| backup.backup_type.includes_config());

        info!(
            id = %backup.id,
            database = restore_db,
            config = restore_config,
            "starting restore"
        );

        let staging = tempfile::Builder::new()
            .prefix("windrose-restore-")
            .tempdir_in(&self.config.backup_dir)?;
        self.extract_for_restore(&backup.path, staging.path(), restore_db, restore_config)?;

        if ctx.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        if restore_db {
            self.replace_database(staging.path(), &mut result).await?;
            result.database_restored = true;
            result.restart_required = true;
            result.records_restored = backup.record_count;
        }

        if restore_config {
            self.recover_config(staging.path(), &mut result)?;
        }

        // TempDir removal on drop is best effort by design of the handle;
        // nothing to do if it fails.
        drop(staging);

        if options.verify_after_restore && result.database_restored {
            self.run_probe(backup.record_count, &mut result).await;
        }

        result.success = true;
        info!(id = %backup.id, warnings = result.warnings.len(), "restore finished");
        Ok(result)
    }

    /// Walk the archive, rejecting traversal on every entry, extracting the
    /// entries selected for restore into the staging root.
    fn extract_for_restore(
        &self,
        archive_path: &Path,
        staging: &Path,
        restore_db: bool,
        restore_config: bool,
    ) -> Result<()> {
        let mut tar = archive::open_archive(archive_path)?;
        for entry in tar
            .entries()
            .map_err(|e| BackupError::Archive(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| BackupError::Archive(e.to_string()))?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|_| BackupError::InvalidArchivePath)?
                .to_string_lossy()
                .to_string();

            // Every entry is checked, wanted or not: a hostile name anywhere
            // in the archive aborts the restore before any file lands.
            let destination = safe_join(staging, &name)?;

            let wanted = (restore_db && name.starts_with(&format!("{}/", DATABASE_DIR)))
                || (restore_config && name.starts_with(&format!("{}/", CONFIG_DIR)));
            if !wanted {
                continue;
            }

            let declared = entry.header().size().unwrap_or(0);
            extract_file(&mut entry, &destination, declared)?;
        }
        Ok(())
    }

    /// Swap the live database files for the extracted ones.
    async fn replace_database(
        &self,
        staging: &Path,
        result: &mut RestoreResult,
    ) -> Result<()> {
        let db_name = self.database_file_name();
        let extracted_db = staging.join(DATABASE_DIR).join(&db_name);
        if !extracted_db.is_file() {
            return Err(BackupError::Restore(format!(
                "archive contains no database file {}/{}",
                DATABASE_DIR, db_name
            )));
        }

        let live_db = PathBuf::from(self.db.database_path());
        let live_wal = PathBuf::from(format!("{}.wal", live_db.display()));

        if let Err(err) = self.db.close().await {
            result
                .warnings
                .push(format!("failed to close live database: {}", err));
        }

        for stale in [&live_db, &live_wal] {
            if let Err(err) = std::fs::remove_file(stale) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    result
                        .warnings
                        .push(format!("failed to remove {}: {}", stale.display(), err));
                }
            }
        }

        copy_file(&extracted_db, &live_db)
            .map_err(|e| BackupError::Restore(format!("failed to copy database: {}", e)))?;

        let extracted_wal = staging
            .join(DATABASE_DIR)
            .join(format!("{}.wal", db_name));
        if extracted_wal.is_file() {
            copy_file(&extracted_wal, &live_wal)
                .map_err(|e| BackupError::Restore(format!("failed to copy WAL: {}", e)))?;
        }

        Ok(())
    }

    /// Place the recovered configuration next to the archives and say so.
    fn recover_config(&self, staging: &Path, result: &mut RestoreResult) -> Result<()> {
        let extracted = staging.join(CONFIG_ENTRY);
        if !extracted.is_file() {
            result
                .warnings
                .push("archive contains no configuration entry".to_string());
            return Ok(());
        }

        let destination = self.config.backup_dir.join(RESTORED_CONFIG_FILE);
        copy_file(&extracted, &destination)?;
        result.config_restored = true;
        result.warnings.push(format!(
            "configuration written to {}; the live configuration is environment-driven and was not modified",
            destination.display()
        ));
        Ok(())
    }

    /// Post-restore probe: liveness, schema shape, and record counts. Probe
    /// failures are warnings, never fatal.
    async fn run_probe(&self, declared_records: u64, result: &mut RestoreResult) {
        let Some(factory) = &self.probe_factory else {
            result
                .warnings
                .push("verification requested but no database probe is configured".to_string());
            return;
        };

        let db_path = PathBuf::from(self.db.database_path());
        let probe = match factory.open(&db_path) {
            Ok(probe) => probe,
            Err(err) => {
                result
                    .warnings
                    .push(format!("could not open restored database: {}", err));
                return;
            }
        };

        if let Err(err) = probe.ping().await {
            result
                .warnings
                .push(format!("restored database did not answer: {}", err));
            return;
        }

        let tables = match probe.table_names().await {
            Ok(tables) => tables,
            Err(err) => {
                result
                    .warnings
                    .push(format!("could not enumerate tables: {}", err));
                return;
            }
        };
        if tables.is_empty() {
            result
                .warnings
                .push("restored database contains no tables".to_string());
        }

        for core in CORE_TABLES {
            if !tables.iter().any(|t| t == core) {
                result
                    .warnings
                    .push(format!("core table missing after restore: {}", core));
            }
        }

        if declared_records > 0 {
            let mut observed = 0u64;
            for core in CORE_TABLES {
                match probe.count_rows(core).await {
                    Ok(count) => observed += count,
                    Err(err) => result
                        .warnings
                        .push(format!("could not count rows of {}: {}", core, err)),
                }
            }
            let floor = (declared_records as f64 * PROBE_COUNT_THRESHOLD) as u64;
            if observed < floor {
                result.warnings.push(format!(
                    "restored record count {} is below 95% of the declared {}",
                    observed, declared_records
                ));
            }
        }

        if result.warnings.is_empty() {
            info!("post-restore verification passed");
        } else {
            warn!(
                warnings = result.warnings.len(),
                "post-restore verification raised warnings"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, METADATA_ENTRY};
    use crate::config::CompressionConfig;
    use crate::testutil::{manager_with_dir, TestDb};
    use crate::types::{Backup, BackupStatus};

    #[tokio::test]
    async fn test_restore_database_round_trip() {
        let (dir, manager) = manager_with_dir(TestDb::with_counts(10, 5)).await;
        let ctx = CancellationToken::new();
        let backup = manager
            .create_backup(&ctx, BackupType::Full, BackupTrigger::Manual, "")
            .await
            .unwrap();

        // Scribble over the live database, then restore.
        let db_path = PathBuf::from(manager.db.database_path());
        let original = std::fs::read(&db_path).unwrap();
        std::fs::write(&db_path, b"corrupted live state").unwrap();

        let result = manager
            .restore_backup(
                &ctx,
                &backup.id,
                &RestoreOptions {
                    create_pre_restore_backup: true,
                    restore_database: Some(true),
                    restore_config: Some(false),
                    ..RestoreOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.database_restored);
        assert!(!result.config_restored);
        assert!(result.restart_required);
        assert!(result.pre_restore_backup_id.is_some());
        assert_eq!(std::fs::read(&db_path).unwrap(), original);
        drop(dir);
    }

    #[tokio::test]
    async fn test_validate_only_touches_nothing() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(2, 2)).await;
        let ctx = CancellationToken::new();
        let backup = manager
            .create_backup(&ctx, BackupType::Full, BackupTrigger::Manual, "")
            .await
            .unwrap();

        let db_path = PathBuf::from(manager.db.database_path());
        std::fs::write(&db_path, b"live state stays").unwrap();

        let result = manager
            .restore_backup(
                &ctx,
                &backup.id,
                &RestoreOptions {
                    validate_only: true,
                    ..RestoreOptions::default()
                },
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.database_restored);
        assert_eq!(std::fs::read(&db_path).unwrap(), b"live state stays");
    }

    #[tokio::test]
    async fn test_config_restore_is_informational() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let ctx = CancellationToken::new();
        let backup = manager
            .create_backup(&ctx, BackupType::Config, BackupTrigger::Manual, "")
            .await
            .unwrap();

        let result = manager
            .restore_backup(&ctx, &backup.id, &RestoreOptions::default())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.config_restored);
        assert!(!result.restart_required);
        assert!(manager
            .config()
            .backup_dir
            .join(RESTORED_CONFIG_FILE)
            .is_file());
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_traversal_entry_aborts_restore() {
        let (dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let ctx = CancellationToken::new();

        // Hand-craft a hostile archive and register it as a backup record.
        let hostile = dir.path().join("backups/hostile.tar.gz");
        let mut writer =
            ArchiveWriter::create(&hostile, &CompressionConfig::default()).unwrap();
        writer
            .append_bytes("../../../etc/passwd", b"0123456789")
            .unwrap();
        writer.append_bytes(METADATA_ENTRY, b"{}").unwrap();
        writer.finish().unwrap();

        let mut record = Backup::new(BackupType::Config, BackupTrigger::Manual, "");
        record.path = hostile.clone();
        record.status = BackupStatus::Completed;
        record.checksum = crate::fsutil::sha256_file(&hostile).unwrap();
        record.file_size = std::fs::metadata(&hostile).unwrap().len();
        let id = record.id.clone();
        manager.store().add_backup(record).await.unwrap();

        let err = manager
            .restore_backup(
                &ctx,
                &id,
                &RestoreOptions {
                    force_restore: true,
                    restore_config: Some(true),
                    ..RestoreOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidArchivePath));

        // Nothing escaped the staging root, and staging itself is gone.
        assert!(!dir.path().join("etc/passwd").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("windrose-restore-")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_backup_refused_without_force() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let ctx = CancellationToken::new();
        let backup = manager
            .create_backup(&ctx, BackupType::Database, BackupTrigger::Manual, "")
            .await
            .unwrap();

        // Corrupt the archive so validation fails.
        std::fs::write(&backup.path, b"garbage").unwrap();

        let err = manager
            .restore_backup(&ctx, &backup.id, &RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ValidationFailed(_)));
    }
}
