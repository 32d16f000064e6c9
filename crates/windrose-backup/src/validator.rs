//! Backup validation: checksum re-verification, archive readability, and
//! required-entry presence. Malformed backups are reported, never thrown.

use serde::{Deserialize, Serialize};

use crate::archive::{self, CONFIG_ENTRY, DATABASE_DIR};
use crate::error::Result;
use crate::fsutil::sha256_file;
use crate::manager::BackupManager;
use crate::types::{Backup, BackupType};

/// Outcome of validating one backup. Every failure mode lands in a field or
/// in `errors`; validation itself only fails on unknown ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub backup_id: String,

    /// True only when every applicable check passed.
    pub valid: bool,

    pub checksum_valid: bool,
    pub archive_readable: bool,
    pub files_complete: bool,
    pub database_valid: bool,
    pub config_valid: bool,

    pub expected_checksum: String,
    pub actual_checksum: String,

    /// Entry names read from the archive, in order.
    pub entries: Vec<String>,

    pub missing_files: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validates archives against their metadata records.
pub struct Validator<'a> {
    manager: &'a BackupManager,
}

impl<'a> Validator<'a> {
    pub fn new(manager: &'a BackupManager) -> Self {
        Self { manager }
    }

    /// Validate the backup with the given id.
    pub async fn validate(&self, id: &str) -> Result<ValidationResult> {
        let backup = self.manager.store().get_backup(id).await?;
        Ok(self.validate_backup(&backup).await)
    }

    /// Validate a backup record against its on-disk archive.
    pub async fn validate_backup(&self, backup: &Backup) -> ValidationResult {
        let mut result = ValidationResult {
            backup_id: backup.id.clone(),
            expected_checksum: backup.checksum.clone(),
            ..ValidationResult::default()
        };

        if !backup.path.is_file() {
            result
                .errors
                .push(format!("archive missing: {}", backup.path.display()));
            return result;
        }

        match sha256_file(&backup.path) {
            Ok(actual) => {
                result.actual_checksum = actual.clone();
                result.checksum_valid = actual == backup.checksum && !backup.checksum.is_empty();
                if !result.checksum_valid {
                    result.errors.push(format!(
                        "checksum mismatch: expected {}, got {}",
                        backup.checksum, actual
                    ));
                }
            }
            Err(err) => {
                result.errors.push(format!("failed to hash archive: {}", err));
                return result;
            }
        }

        match archive::list_entries(&backup.path) {
            Ok(entries) => {
                result.archive_readable = true;
                result.entries = entries;
            }
            Err(err) => {
                result.errors.push(format!("unreadable archive: {}", err));
                return result;
            }
        }

        let db_entry = format!("{}/{}", DATABASE_DIR, self.manager.database_file_name());
        let mut required = Vec::new();
        if backup.backup_type.includes_database() {
            required.push(db_entry.clone());
        }
        if backup.backup_type.includes_config() {
            required.push(CONFIG_ENTRY.to_string());
        }

        for name in &required {
            if !result.entries.iter().any(|e| e == name) {
                result.missing_files.push(name.clone());
            }
        }
        result.files_complete = result.missing_files.is_empty();
        if !result.files_complete {
            result.errors.push(format!(
                "archive is missing required entries: {}",
                result.missing_files.join(", ")
            ));
        }

        // Per-component validity: met requirement, or not applicable to the
        // declared type.
        result.database_valid = !backup.backup_type.includes_database()
            || result.entries.iter().any(|e| *e == db_entry);
        result.config_valid = !backup.backup_type.includes_config()
            || result.entries.iter().any(|e| e == CONFIG_ENTRY);

        if backup.backup_type == BackupType::Incremental {
            result
                .warnings
                .push("incremental archives have no required-entry profile".to_string());
        }

        result.valid = result.checksum_valid
            && result.archive_readable
            && result.files_complete
            && result.database_valid
            && result.config_valid;
        result
    }
}

impl BackupManager {
    /// Validate the backup with the given id. See [`ValidationResult`].
    pub async fn validate_backup(&self, id: &str) -> Result<ValidationResult> {
        Validator::new(self).validate(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager_with_dir, TestDb};
    use crate::types::BackupTrigger;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_valid_backup_passes_every_check() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(10, 5)).await;
        let backup = manager
            .create_backup(
                &CancellationToken::new(),
                BackupType::Full,
                BackupTrigger::Manual,
                "",
            )
            .await
            .unwrap();

        let result = manager.validate_backup(&backup.id).await.unwrap();
        assert!(result.valid);
        assert!(result.checksum_valid);
        assert!(result.archive_readable);
        assert!(result.files_complete);
        assert!(result.database_valid);
        assert!(result.config_valid);
        assert!(result.entries.len() >= 2);
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_checksum() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(10, 5)).await;
        let backup = manager
            .create_backup(
                &CancellationToken::new(),
                BackupType::Database,
                BackupTrigger::Manual,
                "",
            )
            .await
            .unwrap();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&backup.path)
            .unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        let mut byte = [0u8; 1];
        use std::io::Read;
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[byte[0] ^ 0xFF]).unwrap();
        drop(file);

        let result = manager.validate_backup(&backup.id).await.unwrap();
        assert!(!result.valid);
        assert!(!result.checksum_valid);
        assert_ne!(result.actual_checksum, result.expected_checksum);
    }

    #[tokio::test]
    async fn test_missing_archive_reported_not_thrown() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        let backup = manager
            .create_backup(
                &CancellationToken::new(),
                BackupType::Database,
                BackupTrigger::Manual,
                "",
            )
            .await
            .unwrap();
        std::fs::remove_file(&backup.path).unwrap();

        let result = manager.validate_backup(&backup.id).await.unwrap();
        assert!(!result.valid);
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_an_error() {
        let (_dir, manager) = manager_with_dir(TestDb::with_counts(1, 1)).await;
        assert!(manager.validate_backup("no-such-id").await.is_err());
    }
}
