//! Backup engine configuration: schedule, retention, compression, encryption.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};
use crate::types::BackupType;

/// Compression algorithm for archives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Zstd,
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub enabled: bool,

    /// Compression level, 1-9.
    pub level: u32,

    pub algorithm: CompressionAlgorithm,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            algorithm: CompressionAlgorithm::Gzip,
        }
    }
}

impl CompressionConfig {
    /// Archive filename extension for these settings.
    pub fn extension(&self) -> &'static str {
        if !self.enabled {
            return "tar";
        }
        match self.algorithm {
            CompressionAlgorithm::Gzip => "tar.gz",
            CompressionAlgorithm::Zstd => "tar.zst",
        }
    }
}

/// Encryption settings. Encryption of archives at rest is keyed material
/// handled by the operator; the engine only validates the key shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key: String,
}

/// Schedule settings for automatic backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,

    /// Interval between scheduled backups, in hours. Must be >= 1.
    pub interval_hours: u32,

    /// Local hour of day (0-23) targeted when the interval is a day or more.
    pub preferred_hour: u32,

    /// Type of backup the scheduler creates.
    pub backup_type: BackupType,

    /// When true, a Database backup is taken before each sync run.
    pub pre_sync_backup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 24,
            preferred_hour: 2,
            backup_type: BackupType::Full,
            pre_sync_backup: false,
        }
    }
}

impl ScheduleConfig {
    /// Validate the schedule knobs.
    pub fn validate(&self) -> Result<()> {
        if self.interval_hours < 1 {
            return Err(BackupError::Configuration(
                "schedule.interval must be at least 1 hour".to_string(),
            ));
        }
        if self.preferred_hour > 23 {
            return Err(BackupError::Configuration(format!(
                "schedule.preferred_hour must be 0-23, got {}",
                self.preferred_hour
            )));
        }
        if self.backup_type == BackupType::Incremental {
            return Err(BackupError::Configuration(
                "schedule.backup_type must be one of full, database, config".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval as a chrono duration.
    pub fn interval(&self) -> Duration {
        Duration::hours(i64::from(self.interval_hours))
    }
}

/// Retention policy knobs. Selection semantics live in the retention planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Hard floor: never retain fewer completed backups than this. Must be >= 1.
    pub min_count: usize,

    /// Ceiling on retained backups. 0 means unlimited; otherwise must be
    /// >= `min_count`.
    pub max_count: usize,

    /// Force-delete backups older than this many days. 0 means unlimited.
    pub max_age_days: u32,

    /// Keep everything created within this many hours.
    pub keep_recent_hours: u32,

    /// Keep one backup per day for this many days.
    pub keep_daily_for_days: u32,

    /// Keep one backup per ISO week for this many weeks.
    pub keep_weekly_for_weeks: u32,

    /// Keep one backup per month for this many months.
    pub keep_monthly_for_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_count: 3,
            max_count: 50,
            max_age_days: 90,
            keep_recent_hours: 24,
            keep_daily_for_days: 7,
            keep_weekly_for_weeks: 4,
            keep_monthly_for_months: 6,
        }
    }
}

impl RetentionPolicy {
    /// Validate the retention knobs.
    pub fn validate(&self) -> Result<()> {
        if self.min_count < 1 {
            return Err(BackupError::Configuration(
                "retention.min_count must be at least 1".to_string(),
            ));
        }
        if self.max_count != 0 && self.max_count < self.min_count {
            return Err(BackupError::Configuration(format!(
                "retention.max_count ({}) must be 0 or >= retention.min_count ({})",
                self.max_count, self.min_count
            )));
        }
        Ok(())
    }
}

/// Top-level backup engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Disables all backup functionality when false.
    pub enabled: bool,

    /// Directory holding archives and metadata. Must be absolute.
    pub backup_dir: PathBuf,

    pub schedule: ScheduleConfig,
    pub retention: RetentionPolicy,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_dir: PathBuf::new(),
            schedule: ScheduleConfig::default(),
            retention: RetentionPolicy::default(),
            compression: CompressionConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Convenience constructor for an enabled engine rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            backup_dir: dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Validate the full configuration. Called at manager construction.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            // A disabled engine skips directory checks entirely.
            return Ok(());
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(BackupError::Configuration(
                "backup_dir is required".to_string(),
            ));
        }
        if !self.backup_dir.is_absolute() {
            return Err(BackupError::Configuration(format!(
                "backup_dir must be an absolute path: {}",
                self.backup_dir.display()
            )));
        }
        self.schedule.validate()?;
        self.retention.validate()?;
        if self.compression.enabled && !(1..=9).contains(&self.compression.level) {
            return Err(BackupError::Configuration(format!(
                "compression.level must be 1-9, got {}",
                self.compression.level
            )));
        }
        if self.encryption.enabled && self.encryption.key.len() < 32 {
            return Err(BackupError::Configuration(
                "encryption.key must be at least 32 bytes when encryption is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
