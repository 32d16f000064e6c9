//! # Windrose Core - Shared Platform Types
//!
//! `windrose-core` holds the seams shared by the Windrose engines: the
//! database adapter capability set, the application configuration surface and
//! its sanitized archival view, and the injectable application version.

pub mod config;
pub mod db;
pub mod error;

pub use config::AppConfig;
pub use db::{DatabaseAdapter, RecordCounts};
pub use error::{CoreError, Result};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application version injected into artifacts (backup records, probes).
///
/// A constant in production; tests override it to pin expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion(pub String);

impl Default for AppVersion {
    fn default() -> Self {
        Self(VERSION.to_string())
    }
}

impl std::fmt::Display for AppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
