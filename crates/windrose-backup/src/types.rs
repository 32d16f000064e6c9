//! Backup record model shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Backup type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Database plus sanitized configuration.
    Full,
    /// Database file and WAL only.
    Database,
    /// Sanitized configuration only.
    Config,
    /// Reserved for future delta archives.
    Incremental,
}

impl BackupType {
    /// Archive-internal name fragment and filename fragment.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Database => "database",
            BackupType::Config => "config",
            BackupType::Incremental => "incremental",
        }
    }

    /// Whether archives of this type carry the database file.
    pub fn includes_database(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Database)
    }

    /// Whether archives of this type carry the sanitized configuration.
    pub fn includes_config(&self) -> bool {
        matches!(self, BackupType::Full | BackupType::Config)
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backup lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Assigned only by the validator or retention cleanup.
    Corrupted,
}

/// What initiated a backup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupTrigger {
    Manual,
    Scheduled,
    PreSync,
    PreRestore,
    Retention,
}

/// Per-file entry recorded while streaming into an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFile {
    /// Archive-relative path, e.g. `database/windrose.duckdb`.
    pub name: String,

    /// Original on-disk path at backup time.
    pub source_path: String,

    /// Size in bytes.
    pub size: u64,

    /// Modification time of the source file.
    pub modified_at: Option<DateTime<Utc>>,

    /// SHA-256 of the entry content, lowercase hex. Computed while streaming,
    /// never by re-reading the source.
    pub checksum: String,
}

/// Summary of what an archive contains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupContents {
    /// Files included in the archive, in write order.
    pub files: Vec<BackupFile>,

    /// Database summary, present when the database was included.
    pub database: Option<DatabaseSummary>,

    /// True when the sanitized configuration was included.
    pub config_included: bool,
}

/// Database facts captured at backup time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSummary {
    pub path: String,
    pub wal_included: bool,
    pub playback_count: u64,
    pub geolocation_count: u64,
}

/// A single point-in-time backup and its lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    /// Immutable UUIDv4 identifier.
    pub id: String,

    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub trigger: BackupTrigger,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Wall-clock duration in seconds, set on completion.
    pub duration_seconds: Option<f64>,

    /// Filesystem path of the archive.
    pub path: PathBuf,

    /// Whole-archive size in bytes.
    pub file_size: u64,

    /// SHA-256 of the whole archive, lowercase hex.
    pub checksum: String,

    pub compressed: bool,
    pub encrypted: bool,

    /// Application version that produced the backup.
    pub app_version: String,

    /// Database engine version, when known.
    pub db_version: String,

    /// Total record count across core tables at backup time.
    pub record_count: u64,

    /// Free-form operator notes.
    pub notes: String,

    /// Error message when the backup failed.
    pub error: Option<String>,

    pub contents: BackupContents,
}

impl Backup {
    /// New record in the InProgress state.
    pub fn new(backup_type: BackupType, trigger: BackupTrigger, notes: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            backup_type,
            status: BackupStatus::InProgress,
            trigger,
            created_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            path: PathBuf::new(),
            file_size: 0,
            checksum: String::new(),
            compressed: false,
            encrypted: false,
            app_version: String::new(),
            db_version: String::new(),
            record_count: 0,
            notes: notes.into(),
            error: None,
            contents: BackupContents::default(),
        }
    }

    /// First 8 characters of the id, used in archive filenames.
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    /// Transition to Completed, recording timing facts.
    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.duration_seconds = Some((now - self.created_at).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(now);
        self.status = BackupStatus::Completed;
    }

    /// Transition to Failed with the causing error.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.duration_seconds = Some((now - self.created_at).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(now);
        self.status = BackupStatus::Failed;
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_backup_in_progress() {
        let backup = Backup::new(BackupType::Full, BackupTrigger::Manual, "note");
        assert_eq!(backup.status, BackupStatus::InProgress);
        assert_eq!(backup.notes, "note");
        assert_eq!(backup.short_id().len(), 8);
        assert!(Uuid::parse_str(&backup.id).is_ok());
    }

    #[test]
    fn test_type_inclusion_rules() {
        assert!(BackupType::Full.includes_database());
        assert!(BackupType::Full.includes_config());
        assert!(BackupType::Database.includes_database());
        assert!(!BackupType::Database.includes_config());
        assert!(!BackupType::Config.includes_database());
        assert!(BackupType::Config.includes_config());
    }

    #[test]
    fn test_mark_completed_sets_timing() {
        let mut backup = Backup::new(BackupType::Database, BackupTrigger::Scheduled, "");
        backup.mark_completed();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert!(backup.completed_at.is_some());
        assert!(backup.duration_seconds.is_some());
    }

    #[test]
    fn test_status_serialization() {
        let status = BackupStatus::InProgress;
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"in_progress\"");
    }
}
