//! Application configuration surface and the sanitized view of it that is
//! allowed to leave the process (backup archives, support bundles).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, Result};

/// Top-level application configuration.
///
/// Loading (environment, files, CLI) happens outside the core crates; this is
/// the struct shape the engines consume. Secret-bearing fields never appear in
/// [`AppConfig::sanitized`] output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tautulli connection settings.
    pub tautulli: TautulliConfig,

    /// Embedded database settings.
    pub database: DatabaseConfig,

    /// HTTP server settings.
    pub server: ServerConfig,

    /// Sync pipeline settings.
    pub sync: SyncConfig,

    /// API paging defaults.
    pub api: ApiConfig,

    /// Authentication settings.
    pub auth: AuthConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Tautulli upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TautulliConfig {
    pub url: String,
    pub api_key: String,
}

/// Embedded database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Absolute path of the database file.
    pub path: String,

    /// Memory limit handed to the database engine, e.g. "2GB".
    pub memory_limit: String,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Default map coordinates for the dashboard.
    pub latitude: f64,
    pub longitude: f64,
}

/// Sync pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between sync runs, in minutes.
    pub interval_minutes: u64,

    /// How far back the initial sync reaches, in days.
    pub lookback_days: u32,

    /// Rows fetched per upstream request.
    pub batch_size: usize,
}

/// API paging defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode, e.g. "none", "basic", "forward".
    pub mode: String,
    pub username: String,
    pub password: String,
    pub jwt_secret: String,

    /// Session lifetime in hours.
    pub session_timeout_hours: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tautulli: TautulliConfig {
                url: String::new(),
                api_key: String::new(),
            },
            database: DatabaseConfig {
                path: String::new(),
                memory_limit: "2GB".to_string(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8282,
                latitude: 0.0,
                longitude: 0.0,
            },
            sync: SyncConfig {
                interval_minutes: 60,
                lookback_days: 30,
                batch_size: 1000,
            },
            api: ApiConfig {
                default_page_size: 100,
                max_page_size: 1000,
            },
            auth: AuthConfig {
                mode: "none".to_string(),
                username: String::new(),
                password: String::new(),
                jwt_secret: String::new(),
                session_timeout_hours: 24,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.api.max_page_size < self.api.default_page_size {
            return Err(CoreError::Configuration(
                "api.max_page_size must be >= api.default_page_size".to_string(),
            ));
        }
        if self.sync.interval_minutes == 0 {
            return Err(CoreError::Configuration(
                "sync.interval_minutes must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Non-secret view of the configuration, written into backup archives.
    ///
    /// Returned as a tagged map rather than a fixed struct: operators extend
    /// the archived view without a schema migration. API keys, passwords, and
    /// JWT secrets are omitted.
    pub fn sanitized(&self) -> Value {
        json!({
            "tautulli": {
                "url": self.tautulli.url,
            },
            "database": {
                "path": self.database.path,
                "memory_limit": self.database.memory_limit,
            },
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "latitude": self.server.latitude,
                "longitude": self.server.longitude,
            },
            "sync": {
                "interval_minutes": self.sync.interval_minutes,
                "lookback_days": self.sync.lookback_days,
                "batch_size": self.sync.batch_size,
            },
            "api": {
                "default_page_size": self.api.default_page_size,
                "max_page_size": self.api.max_page_size,
            },
            "auth": {
                "mode": self.auth.mode,
                "session_timeout_hours": self.auth.session_timeout_hours,
            },
            "logging": {
                "level": self.logging.level,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sanitized_omits_secrets() {
        let mut config = AppConfig::default();
        config.tautulli.api_key = "secret-key".to_string();
        config.auth.password = "hunter2".to_string();
        config.auth.jwt_secret = "jwt-secret".to_string();

        let rendered = config.sanitized().to_string();
        assert!(!rendered.contains("secret-key"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("jwt-secret"));
        assert!(rendered.contains("session_timeout_hours"));
    }

    #[test]
    fn test_page_size_validation() {
        let mut config = AppConfig::default();
        config.api.max_page_size = 10;
        assert!(config.validate().is_err());
    }
}
