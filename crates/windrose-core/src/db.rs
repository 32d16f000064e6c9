//! Database adapter seam consumed by the backup and recommendation engines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Row counts for the core analytics tables.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RecordCounts {
    /// Rows in the playbacks table.
    pub playbacks: u64,

    /// Rows in the geolocations table.
    pub geolocations: u64,
}

impl RecordCounts {
    /// Combined row count across the core tables.
    pub fn total(&self) -> u64 {
        self.playbacks + self.geolocations
    }
}

/// Capability set the platform requires from the embedded analytical database.
///
/// The database itself is an external collaborator; everything the backup
/// engine needs from it is expressed through this trait so tests can supply
/// an in-memory stand-in. All methods must be safe to call while the caller
/// holds no locks.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Absolute path of the on-disk database file.
    fn database_path(&self) -> String;

    /// Row counts of the core tables.
    async fn record_counts(&self, ctx: &CancellationToken) -> Result<RecordCounts>;

    /// Flush the write-ahead log so the on-disk file is a consistent snapshot.
    async fn checkpoint(&self, ctx: &CancellationToken) -> Result<()>;

    /// Close the live connection, releasing the file for replacement.
    async fn close(&self) -> Result<()>;
}
