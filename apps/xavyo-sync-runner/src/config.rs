//! Runner configuration loaded from environment variables.

use std::env;

use xavyo_sync::SyncEngineConfig;

use crate::logging::LogFormat;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// PostgreSQL connection string.
    pub database_url: String,

    /// Upper bound on pooled database connections.
    pub max_connections: u32,

    /// Log filter directive, used when `RUST_LOG` is unset.
    pub rust_log: String,

    /// Shape of log lines on stderr.
    pub log_format: LogFormat,

    /// Engine settings; command-line flags override these.
    pub engine: SyncEngineConfig,
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `DATABASE_URL` is missing
    /// - A numeric variable does not parse or is zero
    ///
    /// # Optional Variables
    ///
    /// - `RUST_LOG` - Log level filter (default: "info")
    /// - `SYNC_LOG_FORMAT` - `json` or `compact` (default: json)
    /// - `DATABASE_MAX_CONNECTIONS` - Pool size (default: 5)
    /// - `SYNC_PAGE_SIZE` - Objects per page (default: 500)
    /// - `SYNC_CROSS_PAGE_BATCH_SIZE` - Objects per cross-page reload (default: 200)
    /// - `SYNC_PROGRESS_INTERVAL` - Pages between progress writes (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development only)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let log_format = match lookup("SYNC_LOG_FORMAT") {
            Some(raw) => raw.trim().parse().map_err(|message| ConfigError::InvalidValue {
                var: "SYNC_LOG_FORMAT".to_string(),
                message,
            })?,
            None => LogFormat::default(),
        };

        let defaults = SyncEngineConfig::default();
        let max_connections = parse_positive(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?;
        let engine = defaults
            .clone()
            .with_page_size(parse_positive(&lookup, "SYNC_PAGE_SIZE", defaults.page_size)?)
            .with_cross_page_batch_size(parse_positive(
                &lookup,
                "SYNC_CROSS_PAGE_BATCH_SIZE",
                defaults.cross_page_batch_size,
            )?)
            .with_progress_update_interval(parse_positive(
                &lookup,
                "SYNC_PROGRESS_INTERVAL",
                defaults.progress_update_interval,
            )?);

        Ok(Self {
            database_url,
            max_connections,
            rust_log,
            log_format,
            engine,
        })
    }
}

fn parse_positive<F, T>(lookup: &F, var: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var: var.to_string(),
        message: e.to_string(),
    })?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var: var.to_string(),
            message: "Must be greater than 0".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RunnerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RunnerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/xavyo")]).unwrap();
        assert_eq!(config.database_url, "postgres://localhost/xavyo");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.rust_log, "info");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.engine, SyncEngineConfig::default());
    }

    #[test]
    fn test_missing_database_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "DATABASE_URL"));
    }

    #[test]
    fn test_engine_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/xavyo"),
            ("SYNC_PAGE_SIZE", "1000"),
            ("SYNC_CROSS_PAGE_BATCH_SIZE", " 50 "),
            ("SYNC_PROGRESS_INTERVAL", "4"),
        ])
        .unwrap();
        assert_eq!(config.engine.page_size, 1000);
        assert_eq!(config.engine.cross_page_batch_size, 50);
        assert_eq!(config.engine.progress_update_interval, 4);
    }

    #[test]
    fn test_log_format() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/xavyo"),
            ("SYNC_LOG_FORMAT", "compact"),
        ])
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Compact);

        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/xavyo"),
            ("SYNC_LOG_FORMAT", "xml"),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for SYNC_LOG_FORMAT: Unknown log format: xml"
        );
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/xavyo"),
            ("SYNC_PAGE_SIZE", "lots"),
        ])
        .unwrap_err();
        assert!(err.to_string().starts_with("Invalid value for SYNC_PAGE_SIZE"));
    }

    #[test]
    fn test_zero_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://localhost/xavyo"),
            ("DATABASE_MAX_CONNECTIONS", "0"),
        ])
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for DATABASE_MAX_CONNECTIONS: Must be greater than 0"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: TEST_VAR"
        );
    }
}
