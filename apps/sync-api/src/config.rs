//! Server configuration module.
//!
//! Process-level settings are read from environment variables. Engine
//! settings live in the TOML file named by `FIELDSYNC_CONFIG`.

use std::env;
use std::path::PathBuf;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,

    /// SQLite database file
    pub database_path: PathBuf,

    /// HS256 secret for caller tokens
    pub jwt_secret: String,

    /// Access token lifetime in seconds
    pub jwt_access_lifetime_secs: i64,

    /// Engine TOML file (defaults to the platform config dir)
    pub engine_config: Option<PathBuf>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("jwt_access_lifetime_secs", &self.jwt_access_lifetime_secs)
            .field("engine_config", &self.engine_config)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("FIELDSYNC_JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("FIELDSYNC_JWT_SECRET".to_string()))?;

        let jwt_access_lifetime_secs = match lookup("FIELDSYNC_JWT_ACCESS_LIFETIME_SECS") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue("FIELDSYNC_JWT_ACCESS_LIFETIME_SECS".to_string())
            })?,
            None => 3600,
        };

        Ok(ServerConfig {
            bind_addr: lookup("FIELDSYNC_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_path: lookup("FIELDSYNC_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fieldsync.db")),
            jwt_secret,
            jwt_access_lifetime_secs,
            engine_config: lookup("FIELDSYNC_CONFIG").map(PathBuf::from),
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[("FIELDSYNC_JWT_SECRET", "s")])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.database_path, PathBuf::from("fieldsync.db"));
        assert_eq!(config.jwt_access_lifetime_secs, 3600);
        assert!(config.engine_config.is_none());
        assert!(!format!("{config:?}").contains("\"s\""));
    }

    #[test]
    fn test_secret_required() {
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRequired(_))
        ));
        assert!(ServerConfig::from_lookup(lookup(&[("FIELDSYNC_JWT_SECRET", "  ")])).is_err());
    }

    #[test]
    fn test_bad_lifetime() {
        let result = ServerConfig::from_lookup(lookup(&[
            ("FIELDSYNC_JWT_SECRET", "s"),
            ("FIELDSYNC_JWT_ACCESS_LIFETIME_SECS", "soon"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
