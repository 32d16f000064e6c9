//! # Windrose Backup - Durable Backup & Recovery Engine
//!
//! `windrose-backup` provides scheduled, retention-managed archival of the
//! Windrose analytics database and sanitized configuration, with
//! integrity-verified round-trips and path-traversal-safe restore.
//!
//! ## Features
//!
//! - **Streamed Archives**: tar containers (optionally gzip/zstd) with
//!   per-entry SHA-256 computed in the same pass that writes them
//! - **GFS Retention**: recent/daily/weekly/monthly representatives with
//!   hard floors, ceilings, and dry-run previews
//! - **Scheduled Execution**: a single background task with graceful,
//!   idempotent shutdown
//! - **Safe Restore**: staged extraction, atomic database replacement, and a
//!   post-restore integrity probe
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use windrose_backup::prelude::*;
//!
//! # async fn example(db: Arc<dyn windrose_core::DatabaseAdapter>) -> Result<()> {
//! let config = BackupConfig::new("/var/lib/windrose/backups");
//! let manager = BackupManager::new(
//!     config,
//!     windrose_core::AppConfig::default(),
//!     db,
//!     windrose_core::AppVersion::default(),
//! )?;
//!
//! let ctx = CancellationToken::new();
//! let backup = manager
//!     .create_backup(&ctx, BackupType::Full, BackupTrigger::Manual, "nightly")
//!     .await?;
//! let report = manager.validate_backup(&backup.id).await?;
//! assert!(report.valid);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod manager;
pub mod metadata;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{BackupError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        BackupConfig, CompressionAlgorithm, CompressionConfig, EncryptionConfig, RetentionPolicy,
        ScheduleConfig,
    };
    pub use crate::error::{BackupError, Result};
    pub use crate::manager::{BackupManager, BackupStatistics, ListOptions};
    pub use crate::restore::{
        DatabaseProbe, ProbeFactory, RestoreOptions, RestoreResult, RESTORED_CONFIG_FILE,
    };
    pub use crate::retention::{
        CorruptionReport, RetentionPlan, RetentionPreview, RetentionReport,
    };
    pub use crate::types::{
        Backup, BackupContents, BackupFile, BackupStatus, BackupTrigger, BackupType,
    };
    pub use crate::validator::ValidationResult;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
