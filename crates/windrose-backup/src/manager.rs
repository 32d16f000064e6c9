//! Backup CRUD: creation, listing, deletion, import, and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windrose_core::{AppConfig, AppVersion, DatabaseAdapter};

use crate::archive::{self, ArchiveWriter, CONFIG_ENTRY, DATABASE_DIR, METADATA_ENTRY};
use crate::config::{BackupConfig, ScheduleConfig};
use crate::error::{BackupError, Result};
use crate::fsutil::{self, copy_file, sha256_file};
use crate::metadata::MetadataStore;
use crate::restore::ProbeFactory;
use crate::scheduler::SchedulerState;
use crate::types::{Backup, BackupStatus, BackupTrigger, BackupType, DatabaseSummary};

/// Callback invoked with a finished backup record.
pub type BackupHook = Arc<dyn Fn(&Backup) + Send + Sync>;

/// Largest foreign archive accepted by import: 10 GiB.
const MAX_IMPORT_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Filters, ordering, and paging for [`BackupManager::list_backups`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub backup_type: Option<BackupType>,
    pub status: Option<BackupStatus>,
    pub trigger: Option<BackupTrigger>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,

    /// Newest first when true. Listing defaults to newest first.
    pub sort_ascending: bool,

    pub offset: usize,

    /// 0 means no limit.
    pub limit: usize,
}

/// Aggregate counts and sizes over the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub total_count: usize,
    pub total_bytes: u64,
    pub count_by_type: HashMap<String, usize>,
    pub count_by_status: HashMap<String, usize>,
    pub newest_completed: Option<DateTime<Utc>>,
    pub oldest_completed: Option<DateTime<Utc>>,
}

/// Coordinates every backup operation for one backup directory.
pub struct BackupManager {
    pub(crate) config: BackupConfig,
    pub(crate) app_config: AppConfig,
    pub(crate) version: AppVersion,
    pub(crate) db: Arc<dyn DatabaseAdapter>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) schedule_config: tokio::sync::RwLock<ScheduleConfig>,
    pub(crate) on_backup_complete: Option<BackupHook>,
    pub(crate) on_restore_start: Option<BackupHook>,
    pub(crate) probe_factory: Option<Arc<dyn ProbeFactory>>,
    pub(crate) scheduler: SchedulerState,
}

impl BackupManager {
    /// Construct a manager, validating configuration and preparing the backup
    /// directory. A disabled configuration skips directory creation.
    pub fn new(
        config: BackupConfig,
        app_config: AppConfig,
        db: Arc<dyn DatabaseAdapter>,
        version: AppVersion,
    ) -> Result<Self> {
        config.validate()?;

        if config.enabled {
            fsutil::create_dir_restricted(&config.backup_dir)?;
        }

        let store = Arc::new(MetadataStore::open(&config.backup_dir));
        let schedule_config = tokio::sync::RwLock::new(config.schedule.clone());

        Ok(Self {
            config,
            app_config,
            version,
            db,
            store,
            schedule_config,
            on_backup_complete: None,
            on_restore_start: None,
            probe_factory: None,
            scheduler: SchedulerState::new(),
        })
    }

    /// Register a callback fired after each completed backup.
    pub fn with_on_backup_complete(mut self, hook: BackupHook) -> Self {
        self.on_backup_complete = Some(hook);
        self
    }

    /// Register a callback fired when a restore begins.
    pub fn with_on_restore_start(mut self, hook: BackupHook) -> Self {
        self.on_restore_start = Some(hook);
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// The metadata store.
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Filename of the database inside archives, derived from the adapter.
    pub(crate) fn database_file_name(&self) -> String {
        Path::new(&self.db.database_path())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "database.db".to_string())
    }

    fn archive_path_for(&self, backup: &Backup) -> PathBuf {
        let stamp = backup.created_at.format("%Y%m%d-%H%M%S");
        self.config.backup_dir.join(format!(
            "backup-{}-{}-{}.{}",
            backup.backup_type,
            stamp,
            backup.short_id(),
            self.config.compression.extension()
        ))
    }

    /// Create a backup of the given type.
    ///
    /// The record is persisted whether the backup completes or fails; only a
    /// disabled engine or cancellation before any work refuses outright.
    pub async fn create_backup(
        &self,
        ctx: &CancellationToken,
        backup_type: BackupType,
        trigger: BackupTrigger,
        notes: impl Into<String>,
    ) -> Result<Backup> {
        if !self.config.enabled {
            return Err(BackupError::Disabled);
        }
        if ctx.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let mut backup = Backup::new(backup_type, trigger, notes);
        backup.compressed = self.config.compression.enabled;
        backup.encrypted = self.config.encryption.enabled;
        backup.app_version = self.version.to_string();
        backup.path = self.archive_path_for(&backup);

        info!(
            id = %backup.id,
            backup_type = %backup.backup_type,
            path = %backup.path.display(),
            "creating backup"
        );

        match self.populate_archive(ctx, &mut backup).await {
            Ok(()) => {
                backup.checksum = sha256_file(&backup.path)?;
                backup.file_size = std::fs::metadata(&backup.path)?.len();
                backup.mark_completed();
            }
            Err(err) => {
                warn!(id = %backup.id, error = %err, "backup failed");
                let _ = std::fs::remove_file(&backup.path);
                backup.mark_failed(err.to_string());
            }
        }

        // A finished archive is never lost to a metadata write failure; the
        // record can be rebuilt later from the archive footer.
        if let Err(err) = self.store.add_backup(backup.clone()).await {
            warn!(id = %backup.id, error = %err, "failed to persist backup metadata");
        }

        if backup.status == BackupStatus::Completed {
            if let Some(hook) = &self.on_backup_complete {
                hook(&backup);
            }
            info!(
                id = %backup.id,
                bytes = backup.file_size,
                seconds = backup.duration_seconds.unwrap_or(0.0),
                "backup completed"
            );
        }

        Ok(backup)
    }

    async fn populate_archive(&self, ctx: &CancellationToken, backup: &mut Backup) -> Result<()> {
        let mut writer = ArchiveWriter::create(&backup.path, &self.config.compression)?;

        if backup.backup_type.includes_database() {
            if ctx.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            // A failed checkpoint still yields a usable backup; the WAL rides
            // along and replays on open.
            if let Err(err) = self.db.checkpoint(ctx).await {
                warn!(error = %err, "database checkpoint failed, backing up with WAL");
            }

            let db_path = PathBuf::from(self.db.database_path());
            let db_name = self.database_file_name();
            let entry = writer.append_path(&format!("{}/{}", DATABASE_DIR, db_name), &db_path)?;
            backup.contents.files.push(entry);

            let wal_path = PathBuf::from(format!("{}.wal", db_path.display()));
            let wal_included = wal_path.is_file();
            if wal_included {
                let entry = writer
                    .append_path(&format!("{}/{}.wal", DATABASE_DIR, db_name), &wal_path)?;
                backup.contents.files.push(entry);
            }

            let counts = self.db.record_counts(ctx).await?;
            backup.record_count = counts.total();
            backup.contents.database = Some(DatabaseSummary {
                path: db_path.display().to_string(),
                wal_included,
                playback_count: counts.playbacks,
                geolocation_count: counts.geolocations,
            });
        }

        if backup.backup_type.includes_config() {
            if ctx.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let sanitized = serde_json::to_vec_pretty(&self.app_config.sanitized())?;
            let entry = writer.append_bytes(CONFIG_ENTRY, &sanitized)?;
            backup.contents.files.push(entry);
            backup.contents.config_included = true;
        }

        if ctx.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let record = serde_json::to_vec_pretty(&backup)?;
        writer.append_bytes(METADATA_ENTRY, &record)?;
        writer.finish()
    }

    /// List backups with filtering, ordering, and paging.
    pub async fn list_backups(&self, options: &ListOptions) -> Vec<Backup> {
        let mut backups: Vec<Backup> = self
            .store
            .backups()
            .await
            .into_iter()
            .filter(|b| options.backup_type.map_or(true, |t| b.backup_type == t))
            .filter(|b| options.status.map_or(true, |s| b.status == s))
            .filter(|b| options.trigger.map_or(true, |t| b.trigger == t))
            .filter(|b| options.created_after.map_or(true, |t| b.created_at >= t))
            .filter(|b| options.created_before.map_or(true, |t| b.created_at <= t))
            .collect();

        if options.sort_ascending {
            backups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        } else {
            backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }

        let iter = backups.into_iter().skip(options.offset);
        if options.limit > 0 {
            iter.take(options.limit).collect()
        } else {
            iter.collect()
        }
    }

    /// Fetch one backup by id.
    pub async fn get_backup(&self, id: &str) -> Result<Backup> {
        self.store.get_backup(id).await
    }

    /// Delete a backup: archive file first (missing file tolerated), then the
    /// record, in one metadata save.
    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        let backup = self.store.get_backup(id).await?;

        if let Err(err) = std::fs::remove_file(&backup.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(err.into());
            }
            debug!(id, path = %backup.path.display(), "archive already gone");
        }

        self.store.remove_backup(id).await?;
        info!(id, "backup deleted");
        Ok(())
    }

    /// Take a Database backup before a sync run when configured. Returns
    /// `None` without touching anything when the pre-sync flag is off.
    pub async fn create_pre_sync_backup(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Option<Backup>> {
        if !self.schedule().await.pre_sync_backup {
            return Ok(None);
        }
        let backup = self
            .create_backup(
                ctx,
                BackupType::Database,
                BackupTrigger::PreSync,
                "Pre-sync snapshot",
            )
            .await?;
        Ok(Some(backup))
    }

    /// Import a foreign archive into the backup directory.
    ///
    /// The archive is copied to `imported-<stamp>-<name>`, its trailing
    /// metadata entry is decoded when present, and a fresh record is persisted
    /// with recomputed path, size, and checksum.
    pub async fn import_backup(&self, ctx: &CancellationToken, src: &Path) -> Result<Backup> {
        if !self.config.enabled {
            return Err(BackupError::Disabled);
        }
        if ctx.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| BackupError::Archive("import source has no file name".to_string()))?;
        if !(name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tar.zst")) {
            return Err(BackupError::Archive(format!(
                "unsupported import extension: {}",
                name
            )));
        }

        let size = std::fs::metadata(src)?.len();
        if size > MAX_IMPORT_SIZE {
            return Err(BackupError::Archive(format!(
                "import too large: {} bytes (limit {})",
                size, MAX_IMPORT_SIZE
            )));
        }

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dst = self
            .config
            .backup_dir
            .join(format!("imported-{}-{}", stamp, name));
        copy_file(src, &dst)?;

        let mut backup = self
            .decode_embedded_record(&dst)
            .unwrap_or_else(|| {
                debug!(path = %dst.display(), "no readable metadata entry, synthesizing record");
                Backup::new(
                    BackupType::Database,
                    BackupTrigger::Manual,
                    format!("Imported from {}", name),
                )
            });

        // Identity and file facts always come from the imported copy, not the
        // embedded record.
        backup.id = uuid::Uuid::new_v4().to_string();
        backup.path = dst.clone();
        backup.file_size = std::fs::metadata(&dst)?.len();
        backup.checksum = sha256_file(&dst)?;
        backup.status = BackupStatus::Completed;
        if backup.completed_at.is_none() {
            backup.completed_at = Some(Utc::now());
        }

        self.store.add_backup(backup.clone()).await?;
        info!(id = %backup.id, source = %src.display(), "backup imported");
        Ok(backup)
    }

    fn decode_embedded_record(&self, path: &Path) -> Option<Backup> {
        let mut archive = archive::open_archive(path).ok()?;
        let mut decoded = None;
        for entry in archive.entries().ok()? {
            let mut entry = entry.ok()?;
            let name = entry.path().ok()?.to_string_lossy().to_string();
            if name == METADATA_ENTRY {
                let mut raw = Vec::new();
                entry.read_to_end(&mut raw).ok()?;
                decoded = serde_json::from_slice::<Backup>(&raw).ok();
            }
        }
        decoded
    }

    /// Aggregate statistics over every stored record.
    pub async fn statistics(&self) -> BackupStatistics {
        let backups = self.store.backups().await;
        let mut stats = BackupStatistics {
            total_count: backups.len(),
            ..BackupStatistics::default()
        };

        for backup in &backups {
            stats.total_bytes += backup.file_size;
            *stats
                .count_by_type
                .entry(backup.backup_type.to_string())
                .or_insert(0) += 1;
            *stats
                .count_by_status
                .entry(format!("{:?}", backup.status).to_lowercase())
                .or_insert(0) += 1;

            if backup.status == BackupStatus::Completed {
                if stats.newest_completed.map_or(true, |t| backup.created_at > t) {
                    stats.newest_completed = Some(backup.created_at);
                }
                if stats.oldest_completed.map_or(true, |t| backup.created_at < t) {
                    stats.oldest_completed = Some(backup.created_at);
                }
            }
        }
        stats
    }
}
